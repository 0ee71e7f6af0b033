//! Signaling plumbing shared by both session roles.

use std::pin::Pin;

use tokio::sync::mpsc;
use tokio::time::{sleep, Sleep};
use tracing::{debug, trace};

use crate::core::config::NEGOTIATION_TIMEOUT;
use crate::core::connection::{IceCandidate, LinkEvent, LinkEvents, PeerLink, SessionDescription};
use crate::core::error::TransferError;
use crate::core::relay::protocol::ClientMessage;
use crate::core::relay::{EndpointId, RoomId};

/// Relayed signaling routed by the coordinator to one session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionSignal {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
    PeerJoined(EndpointId),
    PeerLeft(EndpointId),
}

/// Outbound signaling; drained by the relay client.
pub type SignalSink = mpsc::UnboundedSender<ClientMessage>;

/// A session's view of the relay: its room plus the outbound queue.
#[derive(Debug, Clone)]
pub struct Signaler {
    room: RoomId,
    tx: SignalSink,
}

impl Signaler {
    pub fn new(room: RoomId, tx: SignalSink) -> Self {
        Self { room, tx }
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn offer(&self, offer: SessionDescription) {
        self.emit(ClientMessage::Offer {
            room_id: self.room.clone(),
            offer,
        });
    }

    pub fn answer(&self, answer: SessionDescription) {
        self.emit(ClientMessage::Answer {
            room_id: self.room.clone(),
            answer,
        });
    }

    pub fn candidate(&self, candidate: IceCandidate) {
        self.emit(ClientMessage::Ice {
            room_id: self.room.clone(),
            candidate,
        });
    }

    fn emit(&self, msg: ClientMessage) {
        let kind = msg.event_name();
        if self.tx.send(msg).is_err() {
            debug!(event = "signal_dropped", kind, room = %self.room, "Relay client gone, signal dropped");
        } else {
            trace!(event = "signal_sent", kind, room = %self.room);
        }
    }
}

/// Remote candidates that arrived before the local side could apply them.
///
/// Candidates are never dropped: until `mark_ready` they are held in arrival
/// order, afterwards they pass straight through.
#[derive(Debug, Default)]
pub struct CandidateQueue {
    pending: Vec<IceCandidate>,
    ready: bool,
}

impl CandidateQueue {
    /// Returns the candidate back if it can be applied right away.
    pub fn push(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.ready {
            Some(candidate)
        } else {
            self.pending.push(candidate);
            None
        }
    }

    /// Flips to pass-through and hands back everything queued so far.
    pub fn mark_ready(&mut self) -> Vec<IceCandidate> {
        self.ready = true;
        std::mem::take(&mut self.pending)
    }
}

/// Marks `queue` ready and applies everything it held, in arrival order.
pub async fn flush_candidates<L: PeerLink + ?Sized>(
    link: &L,
    queue: &mut CandidateQueue,
) -> Result<(), TransferError> {
    let pending = queue.mark_ready();
    if !pending.is_empty() {
        debug!(event = "candidates_flushed", count = pending.len(), "Applying queued remote candidates");
    }
    for candidate in pending {
        link.add_remote_candidate(candidate).await?;
    }
    Ok(())
}

/// Next event of a link that may not exist yet. Pends forever without one.
pub async fn next_link_event(events: &mut Option<LinkEvents>) -> Option<LinkEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Timer bounding the offer/answer exchange. Unarmed until negotiation
/// starts, disarmed once the channel opens.
#[derive(Debug, Default)]
pub struct NegotiationDeadline(Option<Pin<Box<Sleep>>>);

impl NegotiationDeadline {
    pub fn arm(&mut self) {
        self.0 = Some(Box::pin(sleep(NEGOTIATION_TIMEOUT)));
    }

    pub fn disarm(&mut self) {
        self.0 = None;
    }

    pub async fn expired(&mut self) {
        match self.0.as_mut() {
            Some(timer) => timer.as_mut().await,
            None => std::future::pending().await,
        }
    }
}
