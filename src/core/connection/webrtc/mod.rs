//! Production transport on the `webrtc` crate.
//!
//! One ordered, reliable data channel labelled `file` per link, STUN-only
//! ICE, trickled candidates. Descriptions and candidates travel as the JSON
//! shapes browsers use (`{type, sdp}` and `RTCIceCandidateInit`).

mod flow;
mod initializer;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use self::flow::{drain, wait_for_buffer_space};
use self::initializer::{attach_channel_handlers, new_peer_connection};
use super::{IceCandidate, Negotiated, PeerConnector, PeerLink, SessionDescription};
use crate::core::config::{DATA_CHANNEL_LABEL, DEFAULT_STUN_SERVER};
use crate::core::error::TransferError;

fn negotiation(e: impl std::fmt::Display) -> TransferError {
    TransferError::Negotiation(e.to_string())
}

fn transport(e: impl std::fmt::Display) -> TransferError {
    TransferError::TransportLoss(e.to_string())
}

#[derive(Debug, Clone)]
pub struct WebRtcConnector {
    ice_urls: Vec<String>,
}

impl Default for WebRtcConnector {
    fn default() -> Self {
        Self {
            ice_urls: vec![DEFAULT_STUN_SERVER.to_string()],
        }
    }
}

impl WebRtcConnector {
    pub fn with_ice_servers(ice_urls: Vec<String>) -> Self {
        if ice_urls.is_empty() {
            return Self::default();
        }
        Self { ice_urls }
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    type Link = WebRtcLink;

    async fn offer(&self) -> Result<Negotiated<WebRtcLink>, TransferError> {
        let (tx, events) = mpsc::unbounded_channel();
        let pc = new_peer_connection(&self.ice_urls, tx.clone(), "offerer").await?;

        // Explicit ordered + fully reliable (SCTP default, no partial reliability).
        let dc_init = Some(RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        });
        let dc = pc
            .create_data_channel(DATA_CHANNEL_LABEL, dc_init)
            .await
            .map_err(negotiation)?;
        attach_channel_handlers(&dc, tx);

        let offer = pc.create_offer(None).await.map_err(negotiation)?;
        pc.set_local_description(offer.clone())
            .await
            .map_err(negotiation)?;
        let local_description = serde_json::to_value(&offer).map_err(negotiation)?;
        info!(event = "offer_created", "Local offer ready");

        Ok(Negotiated {
            link: Arc::new(WebRtcLink::new(pc, Some(dc))),
            events,
            local_description,
        })
    }

    async fn answer(
        &self,
        offer: SessionDescription,
    ) -> Result<Negotiated<WebRtcLink>, TransferError> {
        let desc: RTCSessionDescription = serde_json::from_value(offer).map_err(negotiation)?;

        let (tx, events) = mpsc::unbounded_channel();
        let pc = new_peer_connection(&self.ice_urls, tx.clone(), "answerer").await?;
        let link = Arc::new(WebRtcLink::new(pc.clone(), None));

        let slot = link.channel.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let slot = slot.clone();
            let tx = tx.clone();
            Box::pin(async move {
                if dc.label() != DATA_CHANNEL_LABEL {
                    debug!(event = "dc_ignored", channel = %dc.label(), "Unexpected data channel");
                    return;
                }
                attach_channel_handlers(&dc, tx);
                *slot.write().await = Some(dc);
            })
        }));

        pc.set_remote_description(desc).await.map_err(negotiation)?;
        let answer = pc.create_answer(None).await.map_err(negotiation)?;
        pc.set_local_description(answer.clone())
            .await
            .map_err(negotiation)?;
        let local_description = serde_json::to_value(&answer).map_err(negotiation)?;
        info!(event = "answer_created", "Local answer ready");

        Ok(Negotiated {
            link,
            events,
            local_description,
        })
    }
}

pub struct WebRtcLink {
    pc: Arc<RTCPeerConnection>,
    channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>>,
    closed: AtomicBool,
}

impl WebRtcLink {
    fn new(pc: Arc<RTCPeerConnection>, channel: Option<Arc<RTCDataChannel>>) -> Self {
        Self {
            pc,
            channel: Arc::new(RwLock::new(channel)),
            closed: AtomicBool::new(false),
        }
    }

    async fn channel(&self) -> Result<Arc<RTCDataChannel>, TransferError> {
        self.channel
            .read()
            .await
            .clone()
            .ok_or_else(|| TransferError::TransportLoss("data channel not established".into()))
    }
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn apply_answer(&self, answer: SessionDescription) -> Result<(), TransferError> {
        let desc: RTCSessionDescription = serde_json::from_value(answer).map_err(negotiation)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(negotiation)
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), TransferError> {
        let init: RTCIceCandidateInit = serde_json::from_value(candidate).map_err(negotiation)?;
        self.pc.add_ice_candidate(init).await.map_err(negotiation)
    }

    async fn send_text(&self, text: String) -> Result<(), TransferError> {
        let dc = self.channel().await?;
        wait_for_buffer_space(&dc, text.len()).await?;
        dc.send_text(text).await.map_err(transport)?;
        Ok(())
    }

    async fn send_binary(&self, data: Bytes) -> Result<(), TransferError> {
        let dc = self.channel().await?;
        wait_for_buffer_space(&dc, data.len()).await?;
        dc.send(&data).await.map_err(transport)?;
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(dc) = self.channel.read().await.clone() {
            drain(&dc).await;
            if let Err(e) = dc.close().await {
                debug!(event = "dc_close_failed", error = %e);
            }
        }
        if let Err(e) = self.pc.close().await {
            debug!(event = "pc_close_failed", error = %e);
        }
    }
}
