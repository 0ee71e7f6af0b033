//! Client side of the relay connection.
//!
//! A writer task drains the outbound queue into the socket; a reader task
//! parses relay messages into the inbound queue. When the socket goes away
//! the inbound queue closes.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::core::relay::protocol::{ClientMessage, ServerMessage};
use crate::core::transfer::negotiation::SignalSink;

pub struct SignalingClient {
    outbound: SignalSink,
    inbound: mpsc::UnboundedReceiver<ServerMessage>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl SignalingClient {
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws_stream, _) = connect_async(url)
            .await
            .with_context(|| format!("Failed to connect to relay at {url}"))?;
        info!(event = "relay_connected", url, "Connected to signaling relay");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel::<ServerMessage>();

        let writer = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&msg) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(event = "encode_failed", error = %e, "Failed to encode signaling message");
                        continue;
                    }
                };
                if let Err(e) = ws_write.send(Message::Text(text)).await {
                    warn!(event = "relay_write_failed", error = %e, "Relay socket write failed");
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(msg) => {
                            if inbound_tx.send(msg).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            debug!(event = "relay_message_ignored", error = %e, "Unrecognised relay message");
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(event = "relay_read_failed", error = %e, "Relay socket read failed");
                        break;
                    }
                }
            }
            info!(event = "relay_disconnected", "Signaling relay connection closed");
        });

        Ok(Self {
            outbound,
            inbound,
            writer,
            reader,
        })
    }

    /// Queue feeding the relay; cloned into sessions.
    pub fn sink(&self) -> SignalSink {
        self.outbound.clone()
    }

    /// Next relay message; `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.inbound.recv().await
    }

    pub fn shutdown(self) {
        self.writer.abort();
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::relay::server::{OriginPolicy, RelayServer};
    use crate::core::relay::RoomId;
    use crate::utils::sos::SignalOfStop;
    use serde_json::json;
    use std::time::Duration;

    async fn next(client: &mut SignalingClient) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(5), client.recv())
            .await
            .expect("timed out waiting for relay")
            .expect("relay closed")
    }

    #[tokio::test]
    async fn clients_exchange_signals_through_the_relay() {
        let server = RelayServer::bind("127.0.0.1:0".parse().unwrap(), OriginPolicy::default())
            .await
            .unwrap();
        let url = format!("ws://{}/", server.local_addr().unwrap());
        let sos = SignalOfStop::new();
        tokio::spawn(server.run(sos.clone()));

        let room = RoomId::new("42").unwrap();
        let mut a = SignalingClient::connect(&url).await.unwrap();
        let mut b = SignalingClient::connect(&url).await.unwrap();

        a.sink().send(ClientMessage::Join(room.clone())).unwrap();
        assert_eq!(next(&mut a).await, ServerMessage::Joined { room_id: room.clone() });
        b.sink().send(ClientMessage::Join(room.clone())).unwrap();
        assert_eq!(next(&mut b).await, ServerMessage::Joined { room_id: room.clone() });

        b.sink()
            .send(ClientMessage::Ice {
                room_id: room.clone(),
                candidate: json!({"candidate": "candidate:1"}),
            })
            .unwrap();

        // a first hears about b, then gets b's candidate
        assert!(matches!(next(&mut a).await, ServerMessage::PeerJoined { .. }));
        assert_eq!(
            next(&mut a).await,
            ServerMessage::Ice {
                room_id: room,
                candidate: json!({"candidate": "candidate:1"})
            }
        );

        a.shutdown();
        b.shutdown();
        sos.cancel();
    }
}
