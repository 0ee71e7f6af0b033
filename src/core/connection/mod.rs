//! Direct peer transport.
//!
//! Transfer sessions only need a handful of primitives from the transport:
//! create an offer, answer an offer, apply an answer, add a remote candidate,
//! and send text or binary frames once the channel is open. `PeerConnector`
//! and `PeerLink` are that surface; `webrtc` is the production backend.

pub mod signaling;
pub mod webrtc;

#[cfg(test)]
pub mod sim;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::core::error::TransferError;
use crate::core::transfer::frame::ChannelFrame;

/// Session description as exchanged over the relay (`{type, sdp}`). Opaque
/// to everything but the transport backend.
pub type SessionDescription = serde_json::Value;

/// ICE candidate as exchanged over the relay. Opaque like descriptions.
pub type IceCandidate = serde_json::Value;

/// What a link reports back to its session.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// A local candidate to publish to the peer.
    LocalCandidate(IceCandidate),
    /// The data channel is open and frames may flow.
    ChannelOpen,
    Frame(ChannelFrame),
    /// Channel or connection closed, failed, or was closed by the peer.
    Closed(String),
}

pub type LinkEvents = mpsc::UnboundedReceiver<LinkEvent>;

/// A link that has produced its local description.
pub struct Negotiated<L> {
    pub link: Arc<L>,
    pub events: LinkEvents,
    pub local_description: SessionDescription,
}

#[async_trait]
pub trait PeerConnector: Send + Sync + 'static {
    type Link: PeerLink;

    /// Offering side: creates the data channel and the local offer.
    async fn offer(&self) -> Result<Negotiated<Self::Link>, TransferError>;

    /// Answering side: applies the remote offer and creates the answer.
    async fn answer(
        &self,
        offer: SessionDescription,
    ) -> Result<Negotiated<Self::Link>, TransferError>;
}

#[async_trait]
pub trait PeerLink: Send + Sync + 'static {
    async fn apply_answer(&self, answer: SessionDescription) -> Result<(), TransferError>;

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), TransferError>;

    async fn send_text(&self, text: String) -> Result<(), TransferError>;

    async fn send_binary(&self, data: Bytes) -> Result<(), TransferError>;

    /// Flushes what can be flushed and tears the link down. Idempotent.
    async fn close(&self);
}
