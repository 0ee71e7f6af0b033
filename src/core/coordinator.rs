//! SessionCoordinator: binds a role and a room to one transfer session at a
//! time and routes relayed signaling to it.
//!
//! The coordinator owns every artifact a receive session produced (resolvable
//! by `ArtifactRef` until released) and a newest-first history of what was
//! shared and received. Teardown cancels the running session, waits for it to
//! close its link and releases every artifact. History entries outlive their
//! artifacts and are marked `released`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::connection::PeerConnector;
use crate::core::relay::protocol::{ClientMessage, ServerMessage};
use crate::core::relay::RoomId;
use crate::core::transfer::artifact::{Artifact, ArtifactRef};
use crate::core::transfer::frame::TransferDescriptor;
use crate::core::transfer::negotiation::{SessionSignal, SignalSink, Signaler};
use crate::core::transfer::receiver::ReceiverTask;
use crate::core::transfer::sender::{SendOptions, SenderTask, TransferSource};
use crate::core::transfer::state::{EventSink, Role, TransferEvent, TransferState};
use crate::utils::sos::SignalOfStop;

// ── History ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct SharedRecord {
    pub descriptor: TransferDescriptor,
    pub room: RoomId,
    pub at: SystemTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedRecord {
    pub descriptor: TransferDescriptor,
    pub reference: ArtifactRef,
    pub room: RoomId,
    pub at: SystemTime,
    /// The artifact is gone; `reference` no longer resolves.
    pub released: bool,
}

/// What the coordinator hands back to its owner.
#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    Transfer(TransferEvent),
    /// The session task returned. Receive sessions may be re-armed after this.
    SessionEnded {
        role: Role,
        room: RoomId,
        state: TransferState,
    },
}

// ── Active session ───────────────────────────────────────────────────────────

struct ActiveSession {
    role: Role,
    room: RoomId,
    signals: mpsc::UnboundedSender<SessionSignal>,
    stop: SignalOfStop,
    /// `None` once the task has been reaped.
    handle: Option<JoinHandle<TransferState>>,
    /// Receive sessions only: set before the link starts closing.
    settled: Option<watch::Receiver<Option<TransferState>>>,
}

impl ActiveSession {
    fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Terminal, even if the task is still closing its link.
    fn is_settled(&self) -> bool {
        !self.is_running() || self.settled.as_ref().is_some_and(|rx| rx.borrow().is_some())
    }
}

// ── SessionCoordinator ───────────────────────────────────────────────────────

pub struct SessionCoordinator<C: PeerConnector> {
    connector: Arc<C>,
    outbound: SignalSink,
    events_tx: EventSink,
    events_rx: mpsc::UnboundedReceiver<TransferEvent>,
    active: Option<ActiveSession>,
    /// Settled sessions replaced before their task returned.
    closing: Vec<JoinHandle<TransferState>>,
    /// Re-arm receive mode after each finished session.
    stay_open: bool,
    artifacts: HashMap<ArtifactRef, Artifact>,
    shared: Vec<SharedRecord>,
    received: Vec<ReceivedRecord>,
}

impl<C: PeerConnector> SessionCoordinator<C> {
    pub fn new(connector: Arc<C>, outbound: SignalSink) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            connector,
            outbound,
            events_tx,
            events_rx,
            active: None,
            closing: Vec::new(),
            stay_open: false,
            artifacts: HashMap::new(),
            shared: Vec::new(),
            received: Vec::new(),
        }
    }

    pub fn set_stay_open(&mut self, stay_open: bool) {
        self.stay_open = stay_open;
    }

    pub fn is_running(&self) -> bool {
        self.active.as_ref().is_some_and(ActiveSession::is_running)
    }

    /// Joins `room` and offers `source` to whoever is (or will be) in it.
    /// Any previous session is torn down first.
    pub async fn start_send(&mut self, room: RoomId, source: TransferSource, options: SendOptions) {
        self.teardown().await;
        self.join(&room);

        let (signals, signals_rx) = mpsc::unbounded_channel();
        let stop = SignalOfStop::new();
        let task = SenderTask::new(
            self.connector.clone(),
            Signaler::new(room.clone(), self.outbound.clone()),
            signals_rx,
            stop.clone(),
            Some(self.events_tx.clone()),
            source,
            options,
        );
        self.active = Some(ActiveSession {
            role: Role::Send,
            room,
            signals,
            stop,
            handle: Some(tokio::spawn(task.run())),
            settled: None,
        });
    }

    /// Joins `room` and waits for an offer there.
    pub async fn start_receive(&mut self, room: RoomId) {
        self.teardown().await;
        self.join(&room);
        self.arm_receiver(room);
    }

    fn join(&self, room: &RoomId) {
        info!(event = "room_join", room = %room, "Joining room");
        if self.outbound.send(ClientMessage::Join(room.clone())).is_err() {
            warn!(event = "relay_unavailable", room = %room, "Relay client gone, join not sent");
        }
    }

    fn arm_receiver(&mut self, room: RoomId) {
        if let Some(handle) = self.active.take().and_then(|mut old| old.handle.take()) {
            if !handle.is_finished() {
                self.closing.push(handle);
            }
        }

        let (signals, signals_rx) = mpsc::unbounded_channel();
        let stop = SignalOfStop::new();
        let task = ReceiverTask::new(
            self.connector.clone(),
            Signaler::new(room.clone(), self.outbound.clone()),
            signals_rx,
            stop.clone(),
            Some(self.events_tx.clone()),
        );
        let settled = task.settled();
        self.active = Some(ActiveSession {
            role: Role::Receive,
            room,
            signals,
            stop,
            handle: Some(tokio::spawn(task.run())),
            settled: Some(settled),
        });
    }

    /// Hands one relayed message to the active session. Messages for any
    /// other room are dropped.
    pub fn route(&mut self, msg: ServerMessage) {
        let Some(room) = msg.room().cloned() else {
            if let ServerMessage::Error { message } = msg {
                warn!(event = "relay_error", %message, "Relay rejected a message");
            }
            return;
        };

        let Some(active) = self.active.as_ref() else {
            debug!(event = "signal_unrouted", room = %room, "No active session");
            return;
        };
        if active.room != room {
            debug!(event = "signal_other_room", room = %room, active = %active.room, "Dropping message for another room");
            return;
        }

        let signal = match msg {
            ServerMessage::Joined { .. } => {
                info!(event = "room_joined", room = %room, "Joined room");
                return;
            }
            ServerMessage::PeerJoined { id, .. } => SessionSignal::PeerJoined(id),
            ServerMessage::PeerLeft { id, .. } => SessionSignal::PeerLeft(id),
            ServerMessage::Offer { offer, .. } => {
                if active.role == Role::Receive && self.stay_open && active.is_settled() {
                    info!(event = "receive_rearmed", room = %room, "New offer, starting a fresh receive session");
                    self.arm_receiver(room.clone());
                }
                SessionSignal::Offer(offer)
            }
            ServerMessage::Answer { answer, .. } => SessionSignal::Answer(answer),
            ServerMessage::Ice { candidate, .. } => SessionSignal::Candidate(candidate),
            ServerMessage::Error { .. } => return,
        };

        if let Some(active) = self.active.as_ref() {
            if active.signals.send(signal).is_err() {
                debug!(event = "signal_late", room = %room, "Session already finished");
            }
        }
    }

    /// Next session event. Transfer events are recorded (history, artifact
    /// table) before they are returned. Pends while nothing is running.
    pub async fn next_event(&mut self) -> CoordinatorEvent {
        tokio::select! {
            biased;

            Some(event) = self.events_rx.recv() => {
                self.record(&event);
                CoordinatorEvent::Transfer(event)
            }

            state = reap(&mut self.active) => state,
        }
    }

    fn record(&mut self, event: &TransferEvent) {
        let room = match self.active.as_ref() {
            Some(active) => active.room.clone(),
            None => return,
        };
        match event {
            TransferEvent::Sent(descriptor) => {
                self.shared.insert(
                    0,
                    SharedRecord {
                        descriptor: descriptor.clone(),
                        room,
                        at: SystemTime::now(),
                    },
                );
            }
            TransferEvent::Received(artifact) => {
                self.received.insert(
                    0,
                    ReceivedRecord {
                        descriptor: artifact.descriptor.clone(),
                        reference: artifact.reference,
                        room,
                        at: artifact.received_at,
                        released: false,
                    },
                );
                self.artifacts.insert(artifact.reference, artifact.clone());
            }
            _ => {}
        }
    }

    pub fn resolve(&self, reference: &ArtifactRef) -> Option<&Artifact> {
        self.artifacts.get(reference)
    }

    pub fn shared(&self) -> &[SharedRecord] {
        &self.shared
    }

    pub fn received(&self) -> &[ReceivedRecord] {
        &self.received
    }

    /// Drops the artifact but keeps its history entry, marked released.
    pub fn release(&mut self, reference: &ArtifactRef) -> bool {
        let released = self.artifacts.remove(reference).is_some();
        if released {
            debug!(event = "artifact_released", artifact = %reference);
            self.mark_released(|r| &r.reference == reference);
        }
        released
    }

    fn mark_released(&mut self, pick: impl Fn(&ReceivedRecord) -> bool) {
        for record in self.received.iter_mut().filter(|r| pick(r)) {
            record.released = true;
        }
    }

    /// Removes a received entry and releases its artifact.
    pub fn delete_received(&mut self, reference: &ArtifactRef) -> bool {
        let before = self.received.len();
        self.received.retain(|r| &r.reference != reference);
        let released = self.artifacts.remove(reference).is_some();
        if released {
            debug!(event = "artifact_released", artifact = %reference);
        }
        released || before != self.received.len()
    }

    /// Cancels the active session and releases every artifact.
    pub async fn teardown(&mut self) {
        self.end_session().await;
        // Events still queued belong to the session that just ended.
        while self.events_rx.try_recv().is_ok() {}
        if !self.artifacts.is_empty() {
            debug!(event = "artifacts_released", count = self.artifacts.len());
            self.artifacts.clear();
        }
        self.mark_released(|_| true);
    }

    /// Cancels the active session and waits for it to close its link.
    pub async fn end_session(&mut self) -> Option<TransferState> {
        for handle in self.closing.drain(..) {
            let _ = handle.await;
        }
        let mut active = self.active.take()?;
        active.stop.cancel();
        let handle = active.handle.take()?;
        match handle.await {
            Ok(state) => {
                info!(event = "session_ended", role = %active.role, room = %active.room, state = %state);
                Some(state)
            }
            Err(e) => {
                warn!(event = "session_join_failed", error = %e, "Session task failed");
                None
            }
        }
    }
}

/// Waits for the active session task to return, then reports it once.
async fn reap(active: &mut Option<ActiveSession>) -> CoordinatorEvent {
    let Some(session) = active.as_mut() else {
        return std::future::pending().await;
    };
    let Some(handle) = session.handle.as_mut() else {
        return std::future::pending().await;
    };
    let state = match handle.await {
        Ok(state) => state,
        Err(e) => {
            warn!(event = "session_join_failed", error = %e, "Session task failed");
            TransferState::Aborted
        }
    };
    session.handle = None;
    CoordinatorEvent::SessionEnded {
        role: session.role,
        room: session.room.clone(),
        state,
    }
}
