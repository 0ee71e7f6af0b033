//! Receiving side of a transfer.
//!
//! `ReceiverSession` is the frame-level state machine and does no I/O.
//! `ReceiverTask` drives one session: it answers the relayed offer, pumps
//! link events into the session and closes the link once it is terminal.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::artifact::{Artifact, ReassemblyBuffer};
use super::frame::{decode_tagged_chunk, ChannelFrame, ChunkFraming, ControlFrame, TransferDescriptor};
use super::negotiation::{
    flush_candidates, next_link_event, CandidateQueue, NegotiationDeadline, SessionSignal, Signaler,
};
use super::state::{notify, EventSink, Progress, Role, TransferEvent, TransferState};
use crate::core::connection::{LinkEvent, PeerConnector, PeerLink};
use crate::core::error::TransferError;
use crate::utils::sos::SignalOfStop;

/// What happened to one inbound frame.
#[derive(Debug, PartialEq)]
pub enum FrameOutcome {
    Accepted,
    /// Frame ignored, state unchanged.
    Dropped(TransferError),
    Completed(Artifact),
    Aborted(TransferError),
}

pub struct ReceiverSession {
    state: TransferState,
    descriptor: Option<TransferDescriptor>,
    framing: ChunkFraming,
    tag: Option<Uuid>,
    next_seq: u32,
    buffer: ReassemblyBuffer,
    events: Option<EventSink>,
}

impl ReceiverSession {
    pub fn new(events: Option<EventSink>) -> Self {
        Self {
            state: TransferState::Idle,
            descriptor: None,
            framing: ChunkFraming::Raw,
            tag: None,
            next_seq: 0,
            buffer: ReassemblyBuffer::default(),
            events,
        }
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    #[cfg(test)]
    pub fn descriptor(&self) -> Option<&TransferDescriptor> {
        self.descriptor.as_ref()
    }

    #[cfg(test)]
    pub fn received_bytes(&self) -> u64 {
        self.buffer.received()
    }

    #[cfg(test)]
    pub fn buffered_frames(&self) -> usize {
        self.buffer.frames()
    }

    /// `Idle -> Negotiating`. Only one offer is accepted per session.
    pub fn on_offer(&mut self) -> Result<(), TransferError> {
        if self.state != TransferState::Idle {
            return Err(TransferError::ProtocolViolation(format!(
                "offer while {}",
                self.state
            )));
        }
        self.set_state(TransferState::Negotiating);
        Ok(())
    }

    /// `Negotiating -> AwaitingMeta`, with a fresh reassembly buffer.
    pub fn on_channel_open(&mut self) {
        if self.state != TransferState::Negotiating {
            debug!(event = "channel_open_ignored", state = %self.state, "Channel open outside negotiation");
            return;
        }
        self.reset_transfer();
        self.set_state(TransferState::AwaitingMeta);
    }

    pub fn on_frame(&mut self, frame: ChannelFrame) -> FrameOutcome {
        let outcome = match frame {
            ChannelFrame::Text(text) => self.on_text(&text),
            ChannelFrame::Binary(data) => self.on_binary(data),
        };
        if let FrameOutcome::Dropped(e) = &outcome {
            warn!(event = "frame_dropped", state = %self.state, error = %e, "Dropping frame");
        }
        outcome
    }

    /// Channel closed, connection failed or the peer left. No-op once
    /// terminal.
    pub fn on_transport_loss(&mut self, reason: impl Into<String>) -> Option<TransferError> {
        if self.state.is_terminal() {
            return None;
        }
        Some(self.abort(TransferError::TransportLoss(reason.into())))
    }

    pub fn cancel(&mut self) {
        if !self.state.is_terminal() {
            self.abort(TransferError::Cancelled);
        }
    }

    /// Moves to `Aborted` and releases everything buffered.
    pub fn abort(&mut self, error: TransferError) -> TransferError {
        if self.state.is_terminal() {
            return error;
        }
        let partial = self.buffer.received();
        self.reset_transfer();
        warn!(event = "receive_aborted", error = %error, partial_bytes = partial, "Receive aborted");
        self.set_state(TransferState::Aborted);
        notify(
            &self.events,
            TransferEvent::Failed {
                role: Role::Receive,
                error: error.clone(),
            },
        );
        error
    }

    fn on_text(&mut self, text: &str) -> FrameOutcome {
        let Some(frame) = ControlFrame::parse(text) else {
            return FrameOutcome::Dropped(TransferError::ProtocolViolation(
                "unrecognised text frame".into(),
            ));
        };

        match (self.state, frame) {
            (TransferState::AwaitingMeta, ControlFrame::Meta { descriptor, framing }) => {
                self.begin(descriptor, framing)
            }
            (TransferState::Transferring, ControlFrame::Meta { .. }) => FrameOutcome::Dropped(
                TransferError::ProtocolViolation("second descriptor during a transfer".into()),
            ),
            (TransferState::Transferring, ControlFrame::Done { id }) => {
                if self.descriptor.as_ref().map(|d| d.id.as_str()) == Some(id.as_str()) {
                    self.finish()
                } else {
                    FrameOutcome::Dropped(TransferError::ProtocolViolation(format!(
                        "done for unknown transfer {id}"
                    )))
                }
            }
            (state, ControlFrame::Meta { .. }) => FrameOutcome::Dropped(
                TransferError::ProtocolViolation(format!("descriptor while {state}")),
            ),
            (state, ControlFrame::Done { .. }) => FrameOutcome::Dropped(
                TransferError::ProtocolViolation(format!("done while {state}")),
            ),
        }
    }

    fn begin(&mut self, descriptor: TransferDescriptor, framing: ChunkFraming) -> FrameOutcome {
        let tag = match framing {
            ChunkFraming::Raw => None,
            ChunkFraming::Tagged => match Uuid::parse_str(&descriptor.id) {
                Ok(id) => Some(id),
                Err(_) => {
                    return FrameOutcome::Dropped(TransferError::ProtocolViolation(format!(
                        "tagged framing needs a uuid transfer id, got {}",
                        descriptor.id
                    )))
                }
            },
        };

        info!(
            event = "receive_started",
            transfer = %descriptor.id,
            name = %descriptor.name,
            size = descriptor.size,
            mime = %descriptor.mime,
            framing = ?framing,
            "Receiving file"
        );
        let total = descriptor.size;
        self.descriptor = Some(descriptor);
        self.framing = framing;
        self.tag = tag;
        self.next_seq = 0;
        self.set_state(TransferState::Transferring);
        self.report(Progress::received(0, total));
        FrameOutcome::Accepted
    }

    fn on_binary(&mut self, data: Bytes) -> FrameOutcome {
        match self.state {
            TransferState::Transferring => {}
            TransferState::AwaitingMeta => {
                return FrameOutcome::Dropped(TransferError::ProtocolViolation(
                    "binary frame before descriptor".into(),
                ))
            }
            state => {
                return FrameOutcome::Dropped(TransferError::ProtocolViolation(format!(
                    "binary frame while {state}"
                )))
            }
        }

        let payload = match self.framing {
            ChunkFraming::Raw => data,
            ChunkFraming::Tagged => {
                let Some((id, seq, payload)) = decode_tagged_chunk(&data) else {
                    return FrameOutcome::Dropped(TransferError::ProtocolViolation(
                        "tagged chunk shorter than its header".into(),
                    ));
                };
                if Some(id) != self.tag {
                    return FrameOutcome::Dropped(TransferError::ProtocolViolation(format!(
                        "chunk for another transfer {id}"
                    )));
                }
                if seq != self.next_seq {
                    let expected = self.next_seq;
                    return FrameOutcome::Aborted(self.abort(TransferError::ProtocolViolation(
                        format!("chunk sequence gap: expected {expected}, got {seq}"),
                    )));
                }
                self.next_seq = self.next_seq.wrapping_add(1);
                payload
            }
        };

        let total = self.descriptor.as_ref().map_or(0, |d| d.size);
        let after = self.buffer.received() + payload.len() as u64;
        if after > total {
            return FrameOutcome::Dropped(TransferError::ProtocolViolation(format!(
                "chunk overruns announced size ({after} > {total})"
            )));
        }

        self.buffer.push(payload);
        self.report(Progress::received(after, total));
        FrameOutcome::Accepted
    }

    fn finish(&mut self) -> FrameOutcome {
        let Some(descriptor) = self.descriptor.take() else {
            return FrameOutcome::Dropped(TransferError::ProtocolViolation(
                "done without descriptor".into(),
            ));
        };

        let received = self.buffer.received();
        if received != descriptor.size {
            let expected = descriptor.size;
            self.descriptor = Some(descriptor);
            return FrameOutcome::Aborted(self.abort(TransferError::Incomplete { expected, received }));
        }

        let frames = self.buffer.frames();
        let artifact = Artifact::new(descriptor, self.buffer.assemble());
        info!(
            event = "receive_completed",
            transfer = %artifact.descriptor.id,
            artifact = %artifact.reference,
            bytes = artifact.len(),
            frames,
            "File received"
        );
        self.set_state(TransferState::Completed);
        self.report(Progress::complete(artifact.descriptor.size));
        notify(&self.events, TransferEvent::Received(artifact.clone()));
        FrameOutcome::Completed(artifact)
    }

    fn reset_transfer(&mut self) {
        self.buffer.clear();
        self.descriptor = None;
        self.framing = ChunkFraming::Raw;
        self.tag = None;
        self.next_seq = 0;
    }

    fn set_state(&mut self, state: TransferState) {
        debug!(event = "receiver_state", from = %self.state, to = %state);
        self.state = state;
        notify(
            &self.events,
            TransferEvent::StateChanged {
                role: Role::Receive,
                state,
            },
        );
    }

    fn report(&self, progress: Progress) {
        notify(
            &self.events,
            TransferEvent::Progress {
                role: Role::Receive,
                progress,
            },
        );
    }
}

/// Runs one receive attempt to a terminal state.
pub struct ReceiverTask<C: PeerConnector> {
    connector: Arc<C>,
    signaler: Signaler,
    signals: mpsc::UnboundedReceiver<SessionSignal>,
    stop: SignalOfStop,
    session: ReceiverSession,
    settled: watch::Sender<Option<TransferState>>,
}

impl<C: PeerConnector> ReceiverTask<C> {
    pub fn new(
        connector: Arc<C>,
        signaler: Signaler,
        signals: mpsc::UnboundedReceiver<SessionSignal>,
        stop: SignalOfStop,
        events: Option<EventSink>,
    ) -> Self {
        Self {
            connector,
            signaler,
            signals,
            stop,
            session: ReceiverSession::new(events),
            settled: watch::channel(None).0,
        }
    }

    /// Holds the terminal state as soon as it is reached, before the link
    /// has finished closing.
    pub fn settled(&self) -> watch::Receiver<Option<TransferState>> {
        self.settled.subscribe()
    }

    pub async fn run(self) -> TransferState {
        let ReceiverTask {
            connector,
            signaler,
            mut signals,
            stop,
            mut session,
            settled,
        } = self;

        let mut link: Option<Arc<C::Link>> = None;
        let mut link_events = None;
        let mut candidates = CandidateQueue::default();
        let mut deadline = NegotiationDeadline::default();

        info!(event = "receiver_waiting", room = %signaler.room(), "Waiting for an offer");

        while !session.state().is_terminal() {
            tokio::select! {
                _ = stop.wait() => session.cancel(),

                signal = signals.recv() => match signal {
                    Some(SessionSignal::Offer(offer)) => {
                        if let Err(e) = session.on_offer() {
                            debug!(event = "offer_ignored", error = %e, "Session already negotiating");
                            continue;
                        }
                        deadline.arm();
                        match connector.answer(offer).await {
                            Ok(negotiated) => {
                                signaler.answer(negotiated.local_description);
                                if let Err(e) = flush_candidates(negotiated.link.as_ref(), &mut candidates).await {
                                    session.abort(e);
                                }
                                link = Some(negotiated.link);
                                link_events = Some(negotiated.events);
                            }
                            Err(e) => {
                                session.abort(e);
                            }
                        }
                    }
                    Some(SessionSignal::Candidate(candidate)) => {
                        if let (Some(candidate), Some(l)) = (candidates.push(candidate), link.as_ref()) {
                            if let Err(e) = l.add_remote_candidate(candidate).await {
                                session.abort(e);
                            }
                        }
                    }
                    Some(SessionSignal::PeerLeft(peer)) => {
                        if session.state() != TransferState::Idle {
                            session.on_transport_loss(format!("peer {peer} left the room"));
                        }
                    }
                    Some(SessionSignal::Answer(_)) | Some(SessionSignal::PeerJoined(_)) => {}
                    None => session.cancel(),
                },

                event = next_link_event(&mut link_events) => match event {
                    Some(LinkEvent::LocalCandidate(candidate)) => signaler.candidate(candidate),
                    Some(LinkEvent::ChannelOpen) => {
                        deadline.disarm();
                        session.on_channel_open();
                    }
                    Some(LinkEvent::Frame(frame)) => {
                        session.on_frame(frame);
                    }
                    Some(LinkEvent::Closed(reason)) => {
                        session.on_transport_loss(reason);
                    }
                    None => {
                        session.on_transport_loss("link dropped");
                    }
                },

                _ = deadline.expired() => {
                    session.abort(TransferError::Negotiation("timed out waiting for the data channel".into()));
                }
            }
        }

        settled.send_replace(Some(session.state()));
        if let Some(link) = link {
            link.close().await;
        }
        session.state()
    }
}
