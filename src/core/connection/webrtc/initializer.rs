//! WebRTC plumbing: API construction, peer connection setup and the
//! callbacks that turn transport activity into `LinkEvent`s.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;

use crate::core::connection::LinkEvent;
use crate::core::error::TransferError;
use crate::core::transfer::frame::ChannelFrame;

pub(super) type EventTx = mpsc::UnboundedSender<LinkEvent>;

pub(super) fn create_webrtc_api() -> Result<API, TransferError> {
    let mut me = MediaEngine::default();
    let reg = register_default_interceptors(Registry::new(), &mut me)
        .map_err(|e| TransferError::Negotiation(format!("interceptor setup failed: {e}")))?;

    Ok(APIBuilder::new()
        .with_setting_engine(SettingEngine::default())
        .with_media_engine(me)
        .with_interceptor_registry(reg)
        .build())
}

/// STUN-only ICE configuration.
pub(super) fn ice_servers(urls: &[String]) -> Vec<RTCIceServer> {
    vec![RTCIceServer {
        urls: urls.to_vec(),
        username: String::new(),
        credential: String::new(),
    }]
}

/// New peer connection wired to report state changes and trickle local
/// candidates into `tx`. `side` only labels log lines.
pub(super) async fn new_peer_connection(
    urls: &[String],
    tx: EventTx,
    side: &'static str,
) -> Result<Arc<RTCPeerConnection>, TransferError> {
    let api = create_webrtc_api()?;
    let pc = Arc::new(
        api.new_peer_connection(RTCConfiguration {
            ice_servers: ice_servers(urls),
            ..Default::default()
        })
        .await
        .map_err(|e| TransferError::Negotiation(e.to_string()))?,
    );

    let state_tx = tx.clone();
    pc.on_peer_connection_state_change(Box::new(move |s| {
        let tx = state_tx.clone();
        Box::pin(async move {
            match s {
                RTCPeerConnectionState::Connected => {
                    info!(event = "webrtc_connected", side, "WebRTC connection established");
                }
                RTCPeerConnectionState::Failed => {
                    error!(event = "webrtc_failed", side, "WebRTC connection failed");
                }
                RTCPeerConnectionState::Disconnected => {
                    warn!(
                        event = "webrtc_disconnected",
                        side, "WebRTC transient disconnect (ICE may recover)"
                    );
                }
                RTCPeerConnectionState::Closed => {
                    info!(event = "webrtc_closed", side, "WebRTC connection closed");
                }
                _ => {}
            }
            if let Some(reason) = closing_reason(s) {
                let _ = tx.send(LinkEvent::Closed(reason.into()));
            }
        })
    }));

    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        Box::pin(async move {
            // `None` marks the end of gathering; browsers do not need it relayed.
            let Some(candidate) = candidate else {
                debug!(event = "ice_gathering_complete", side);
                return;
            };
            let encoded = candidate
                .to_json()
                .map_err(|e| e.to_string())
                .and_then(|init| serde_json::to_value(init).map_err(|e| e.to_string()));
            match encoded {
                Ok(value) => {
                    let _ = tx.send(LinkEvent::LocalCandidate(value));
                }
                Err(e) => {
                    warn!(event = "candidate_encode_failed", side, error = %e, "Dropping local candidate");
                }
            }
        })
    }));

    Ok(pc)
}

/// Peer connection states that end the link for good. `Disconnected` is
/// left out since ICE can still recover from it.
fn closing_reason(state: RTCPeerConnectionState) -> Option<&'static str> {
    match state {
        RTCPeerConnectionState::Failed => Some("peer connection failed"),
        RTCPeerConnectionState::Closed => Some("peer connection closed"),
        _ => None,
    }
}

/// Attach `on_open`, `on_close`, `on_error` and `on_message` to `dc`.
pub(super) fn attach_channel_handlers(dc: &Arc<RTCDataChannel>, tx: EventTx) {
    let label = dc.label().to_string();
    let open_tx = tx.clone();
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            info!(event = "dc_open", channel = %label, "DataChannel open");
            let _ = open_tx.send(LinkEvent::ChannelOpen);
        })
    }));

    let label = dc.label().to_string();
    let close_tx = tx.clone();
    dc.on_close(Box::new(move || {
        let label = label.clone();
        let tx = close_tx.clone();
        Box::pin(async move {
            warn!(event = "dc_closed", channel = %label, "DataChannel closed by transport");
            let _ = tx.send(LinkEvent::Closed("data channel closed".into()));
        })
    }));

    let label = dc.label().to_string();
    let error_tx = tx.clone();
    dc.on_error(Box::new(move |err| {
        let label = label.clone();
        let tx = error_tx.clone();
        Box::pin(async move {
            error!(event = "dc_error", channel = %label, %err, "DataChannel transport error");
            let _ = tx.send(LinkEvent::Closed(format!("data channel error: {err}")));
        })
    }));

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let tx = tx.clone();
        Box::pin(async move {
            let frame = if msg.is_string {
                ChannelFrame::Text(String::from_utf8_lossy(&msg.data).into_owned())
            } else {
                ChannelFrame::Binary(msg.data)
            };
            let _ = tx.send(LinkEvent::Frame(frame));
        })
    }));
}
