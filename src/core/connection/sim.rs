//! In-process transport for tests.
//!
//! An offer carries a token; answering it wires the two links back to back.
//! Frames sent on one side show up as `LinkEvent::Frame` on the other, in
//! order. Faults can be injected per connector.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{IceCandidate, LinkEvent, Negotiated, PeerConnector, PeerLink, SessionDescription};
use crate::core::error::TransferError;
use crate::core::transfer::frame::ChannelFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Deliver this many binary frames, then sever the link.
    CloseAfterBinary(usize),
    /// Refuse the remote answer.
    RejectAnswer,
    /// Negotiate but never open the channel.
    NeverOpen,
    /// Take this long to close, as a link draining its send buffer does.
    SlowClose(Duration),
}

/// Shared switchboard. Records every frame it delivers.
#[derive(Default)]
pub struct SimNetwork {
    pending: Mutex<HashMap<String, Arc<SimLink>>>,
    delivered: Mutex<Vec<ChannelFrame>>,
}

impl SimNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn delivered(&self) -> Vec<ChannelFrame> {
        self.delivered.lock().unwrap().clone()
    }

    /// Payload sizes of every binary frame delivered so far.
    pub fn binary_sizes(&self) -> Vec<usize> {
        self.delivered()
            .iter()
            .filter_map(|f| match f {
                ChannelFrame::Binary(b) => Some(b.len()),
                ChannelFrame::Text(_) => None,
            })
            .collect()
    }
}

#[derive(Clone)]
pub struct SimConnector {
    net: Arc<SimNetwork>,
    fault: Option<Fault>,
}

impl SimConnector {
    pub fn new(net: Arc<SimNetwork>) -> Self {
        Self { net, fault: None }
    }

    pub fn with_fault(net: Arc<SimNetwork>, fault: Fault) -> Self {
        Self {
            net,
            fault: Some(fault),
        }
    }

    fn new_link(&self, token: &str) -> (Arc<SimLink>, mpsc::UnboundedReceiver<LinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = Arc::new(SimLink {
            token: token.to_string(),
            net: self.net.clone(),
            events: tx,
            peer: Mutex::new(Weak::new()),
            remote_set: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            fault: self.fault,
            binary_sent: AtomicUsize::new(0),
        });
        (link, rx)
    }
}

#[async_trait]
impl PeerConnector for SimConnector {
    type Link = SimLink;

    async fn offer(&self) -> Result<Negotiated<SimLink>, TransferError> {
        let token = Uuid::new_v4().to_string();
        let (link, events) = self.new_link(&token);
        link.emit(LinkEvent::LocalCandidate(
            json!({"candidate": format!("candidate:sim {token} offer"), "sdpMid": "0"}),
        ));
        self.net
            .pending
            .lock()
            .unwrap()
            .insert(token.clone(), link.clone());
        Ok(Negotiated {
            link,
            events,
            local_description: json!({"type": "offer", "sdp": token}),
        })
    }

    async fn answer(&self, offer: SessionDescription) -> Result<Negotiated<SimLink>, TransferError> {
        let token = offer["sdp"]
            .as_str()
            .ok_or_else(|| TransferError::Negotiation("not a sim offer".into()))?
            .to_string();
        let offerer = self
            .net
            .pending
            .lock()
            .unwrap()
            .remove(&token)
            .ok_or_else(|| TransferError::Negotiation(format!("unknown offer {token}")))?;

        let (link, events) = self.new_link(&token);
        link.remote_set.store(true, Ordering::SeqCst);
        *link.peer.lock().unwrap() = Arc::downgrade(&offerer);
        *offerer.peer.lock().unwrap() = Arc::downgrade(&link);
        link.emit(LinkEvent::LocalCandidate(
            json!({"candidate": format!("candidate:sim {token} answer"), "sdpMid": "0"}),
        ));

        Ok(Negotiated {
            link,
            events,
            local_description: json!({"type": "answer", "sdp": token}),
        })
    }
}

pub struct SimLink {
    token: String,
    net: Arc<SimNetwork>,
    events: mpsc::UnboundedSender<LinkEvent>,
    peer: Mutex<Weak<SimLink>>,
    remote_set: AtomicBool,
    closed: AtomicBool,
    fault: Option<Fault>,
    binary_sent: AtomicUsize,
}

impl SimLink {
    fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }

    fn peer(&self) -> Option<Arc<SimLink>> {
        self.peer.lock().unwrap().upgrade()
    }

    fn sever(&self, reason: &str) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.emit(LinkEvent::Closed(reason.to_string()));
        }
        if let Some(peer) = self.peer() {
            if !peer.closed.swap(true, Ordering::SeqCst) {
                peer.emit(LinkEvent::Closed(reason.to_string()));
            }
        }
    }

    fn deliver(&self, frame: ChannelFrame) -> Result<(), TransferError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransferError::TransportLoss("link closed".into()));
        }
        let peer = self
            .peer()
            .ok_or_else(|| TransferError::TransportLoss("no peer".into()))?;
        self.net.delivered.lock().unwrap().push(frame.clone());
        peer.emit(LinkEvent::Frame(frame));
        Ok(())
    }
}

#[async_trait]
impl PeerLink for SimLink {
    async fn apply_answer(&self, answer: SessionDescription) -> Result<(), TransferError> {
        if self.fault == Some(Fault::RejectAnswer) {
            return Err(TransferError::Negotiation("answer rejected".into()));
        }
        if answer["sdp"].as_str() != Some(self.token.as_str()) {
            return Err(TransferError::Negotiation("answer for another offer".into()));
        }
        self.remote_set.store(true, Ordering::SeqCst);

        if self.fault != Some(Fault::NeverOpen) {
            if let Some(peer) = self.peer() {
                peer.emit(LinkEvent::ChannelOpen);
            }
            self.emit(LinkEvent::ChannelOpen);
        }
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), TransferError> {
        if !self.remote_set.load(Ordering::SeqCst) {
            return Err(TransferError::Negotiation(
                "candidate before remote description".into(),
            ));
        }
        tracing::trace!(event = "sim_candidate", token = %self.token, %candidate);
        Ok(())
    }

    async fn send_text(&self, text: String) -> Result<(), TransferError> {
        self.deliver(ChannelFrame::Text(text))
    }

    async fn send_binary(&self, data: Bytes) -> Result<(), TransferError> {
        if let Some(Fault::CloseAfterBinary(limit)) = self.fault {
            if self.binary_sent.fetch_add(1, Ordering::SeqCst) >= limit {
                self.sever("simulated disconnect");
                return Err(TransferError::TransportLoss("simulated disconnect".into()));
            }
        }
        self.deliver(ChannelFrame::Binary(data))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(peer) = self.peer() {
            if !peer.closed.load(Ordering::SeqCst) {
                peer.emit(LinkEvent::Closed("peer closed the link".into()));
            }
        }
        if let Some(Fault::SlowClose(delay)) = self.fault {
            tokio::time::sleep(delay).await;
        }
    }
}
