//! HTTP front of the relay: the `/health` route, origin-checked WebSocket
//! upgrades, and one reader plus one writer task per connection.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::protocol::ServerMessage;
use super::router::Relay;
use crate::core::config::{HEALTH_PATH, RELAY_OUTBOUND_QUEUE};
use crate::core::error::RelayError;
use crate::utils::sos::SignalOfStop;

/// Which browser origins may open a relay connection.
///
/// An empty list allows everything. Requests without an `Origin` header come
/// from non-browser tools and are always allowed.
#[derive(Debug, Clone, Default)]
pub struct OriginPolicy {
    allowed: Vec<String>,
}

impl OriginPolicy {
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let allowed = allowed
            .into_iter()
            .map(|o| normalize_origin(o.as_ref()))
            .filter(|o| !o.is_empty())
            .collect();
        Self { allowed }
    }

    pub fn allows_any(&self) -> bool {
        self.allowed.is_empty()
    }

    pub fn check(&self, origin: Option<&str>) -> Result<(), RelayError> {
        let Some(origin) = origin else {
            return Ok(());
        };
        if self.allows_any() || self.allowed.iter().any(|a| *a == normalize_origin(origin)) {
            Ok(())
        } else {
            Err(RelayError::CrossOriginRejection(origin.to_string()))
        }
    }
}

fn normalize_origin(origin: &str) -> String {
    origin.trim().trim_end_matches('/').to_ascii_lowercase()
}

pub struct RelayServer {
    listener: TcpListener,
    relay: Arc<Relay>,
    origins: Arc<OriginPolicy>,
}

#[derive(Clone)]
struct RelayState {
    relay: Arc<Relay>,
    origins: Arc<OriginPolicy>,
}

impl RelayServer {
    pub async fn bind(addr: SocketAddr, origins: OriginPolicy) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind relay on {addr}"))?;
        Ok(Self {
            listener,
            relay: Arc::new(Relay::new()),
            origins: Arc::new(origins),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Relay listener has no local address")
    }

    /// `/health` answers `ok`; every other path is a WebSocket upgrade.
    fn router(&self) -> Router {
        Router::new()
            .route(HEALTH_PATH, get(health_handler))
            .fallback(upgrade_handler)
            .with_state(RelayState {
                relay: self.relay.clone(),
                origins: self.origins.clone(),
            })
    }

    /// Serves until `sos` is cancelled.
    pub async fn run(self, sos: SignalOfStop) -> Result<()> {
        let addr = self.local_addr()?;
        info!(
            event = "relay_listening",
            addr = %addr,
            any_origin = self.origins.allows_any(),
            "Signaling relay listening"
        );

        let router = self.router();
        axum::serve(
            self.listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            sos.wait().await;
            info!(event = "relay_shutdown", "Relay stopping");
        })
        .await
        .context("Relay server failed")
    }
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn upgrade_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<RelayState>,
) -> Response {
    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    if let Err(e) = state.origins.check(origin) {
        warn!(event = "origin_rejected", peer = %peer, error = %e, "Refusing upgrade");
        return (StatusCode::FORBIDDEN, e.to_string()).into_response();
    }
    ws.on_upgrade(move |socket| serve_socket(socket, peer, state.relay))
}

async fn serve_socket(socket: WebSocket, peer: SocketAddr, relay: Arc<Relay>) {
    let (mut sink, mut source) = socket.split();

    let (tx, mut rx) = mpsc::channel::<ServerMessage>(RELAY_OUTBOUND_QUEUE);
    let endpoint = relay.connect(tx).await;
    let connections = relay.connection_count().await;
    debug!(event = "connection_upgraded", peer = %peer, endpoint = %endpoint, connections, "WebSocket established");

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(e) => {
                    warn!(event = "encode_failed", error = %e, "Failed to encode outbound message");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text)).await {
                debug!(event = "write_failed", error = %e, "Socket write failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Text(text)) => relay.handle_text(endpoint, &text).await,
            Ok(Message::Binary(_)) => {
                debug!(event = "binary_ignored", endpoint = %endpoint, "Relay carries no binary frames");
            }
            Ok(Message::Close(_)) => break,
            // ping/pong is answered by the websocket layer
            Ok(_) => {}
            Err(e) => {
                debug!(event = "read_failed", endpoint = %endpoint, error = %e, "Socket read failed");
                break;
            }
        }
    }

    // Removing the endpoint drops its queue sender, which ends the writer.
    relay.disconnect(endpoint).await;
    let _ = writer.await;
}
