//! Sending side of a transfer.
//!
//! One `SenderTask` per attempt: offer, wait for the answer and the channel,
//! then stream `meta`, the chunks and `done`. The chunk loop suspends after
//! every chunk and checks for cancellation and channel loss before reading
//! the next slice.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::frame::{chunk_count, encode_tagged_chunk_into, ChunkFraming, ControlFrame, TransferDescriptor};
use super::negotiation::{
    flush_candidates, next_link_event, CandidateQueue, NegotiationDeadline, SessionSignal, Signaler,
};
use super::state::{notify, EventSink, Progress, Role, TransferEvent, TransferState};
use crate::core::config::{CHUNK_SIZE, COMPLETION_LINGER, DEFAULT_MIME};
use crate::core::connection::{IceCandidate, LinkEvent, LinkEvents, PeerConnector, PeerLink};
use crate::core::error::TransferError;
use crate::utils::sos::SignalOfStop;

/// The bytes to send plus what the receiver is told about them.
pub struct TransferSource {
    pub name: String,
    pub size: u64,
    pub mime: String,
    reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl std::fmt::Debug for TransferSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferSource")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("mime", &self.mime)
            .finish_non_exhaustive()
    }
}

impl TransferSource {
    /// Opens a file; the MIME type is guessed from its extension.
    pub async fn open(path: &Path) -> Result<Self> {
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let meta = file
            .metadata()
            .await
            .with_context(|| format!("Failed to stat {}", path.display()))?;
        if !meta.is_file() {
            anyhow::bail!("{} is not a regular file", path.display());
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let mime = mime_guess::from_path(path)
            .first()
            .map(|m| m.essence_str().to_string())
            .unwrap_or_else(|| DEFAULT_MIME.to_string());

        Ok(Self {
            name,
            size: meta.len(),
            mime,
            reader: Box::new(file),
        })
    }

    pub fn from_bytes(name: impl Into<String>, mime: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            size: data.len() as u64,
            mime: mime.into(),
            reader: Box::new(std::io::Cursor::new(data)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    pub framing: ChunkFraming,
}

/// Runs one send attempt to a terminal state.
pub struct SenderTask<C: PeerConnector> {
    connector: Arc<C>,
    signaler: Signaler,
    signals: mpsc::UnboundedReceiver<SessionSignal>,
    stop: SignalOfStop,
    events: Option<EventSink>,
    source: TransferSource,
    options: SendOptions,
    state: TransferState,
    candidates: CandidateQueue,
}

impl<C: PeerConnector> SenderTask<C> {
    pub fn new(
        connector: Arc<C>,
        signaler: Signaler,
        signals: mpsc::UnboundedReceiver<SessionSignal>,
        stop: SignalOfStop,
        events: Option<EventSink>,
        source: TransferSource,
        options: SendOptions,
    ) -> Self {
        Self {
            connector,
            signaler,
            signals,
            stop,
            events,
            source,
            options,
            state: TransferState::Idle,
            candidates: CandidateQueue::default(),
        }
    }

    pub async fn run(mut self) -> TransferState {
        let id = Uuid::new_v4();
        let descriptor = TransferDescriptor {
            id: id.to_string(),
            name: self.source.name.clone(),
            size: self.source.size,
            mime: self.source.mime.clone(),
        };
        info!(
            event = "send_started",
            transfer = %descriptor.id,
            room = %self.signaler.room(),
            name = %descriptor.name,
            size = descriptor.size,
            chunks = chunk_count(descriptor.size),
            "Offering file"
        );

        self.set_state(TransferState::Negotiating);
        let negotiated = match self.connector.offer().await {
            Ok(n) => n,
            Err(e) => {
                self.abort(e);
                return self.state;
            }
        };
        let link = negotiated.link;
        let mut events = Some(negotiated.events);
        let offer = negotiated.local_description;
        self.signaler.offer(offer.clone());

        let mut deadline = NegotiationDeadline::default();
        deadline.arm();
        let mut answered = false;
        // Kept for re-publishing when the offer has to be re-sent.
        let mut published: Vec<IceCandidate> = Vec::new();

        while !self.state.is_terminal() {
            tokio::select! {
                _ = self.stop.wait() => self.abort(TransferError::Cancelled),

                signal = self.signals.recv() => match signal {
                    Some(SessionSignal::Answer(answer)) if !answered => {
                        answered = true;
                        if let Err(e) = link.apply_answer(answer).await {
                            self.abort(e);
                        } else if let Err(e) = flush_candidates(link.as_ref(), &mut self.candidates).await {
                            self.abort(e);
                        }
                    }
                    Some(SessionSignal::Answer(_)) => {
                        debug!(event = "answer_ignored", "Already answered");
                    }
                    Some(SessionSignal::Candidate(candidate)) => {
                        if let Some(candidate) = self.candidates.push(candidate) {
                            if let Err(e) = link.add_remote_candidate(candidate).await {
                                self.abort(e);
                            }
                        }
                    }
                    Some(SessionSignal::PeerJoined(peer)) => {
                        if !answered {
                            info!(event = "offer_resent", peer = %peer, candidates = published.len(), "Peer joined, re-sending offer");
                            self.signaler.offer(offer.clone());
                            for candidate in &published {
                                self.signaler.candidate(candidate.clone());
                            }
                        }
                    }
                    Some(SessionSignal::PeerLeft(peer)) => {
                        if answered {
                            self.abort(TransferError::TransportLoss(format!("peer {peer} left the room")));
                        }
                    }
                    Some(SessionSignal::Offer(_)) => {}
                    None => self.abort(TransferError::Cancelled),
                },

                event = next_link_event(&mut events) => match event {
                    Some(LinkEvent::LocalCandidate(candidate)) => {
                        published.push(candidate.clone());
                        self.signaler.candidate(candidate);
                    }
                    Some(LinkEvent::ChannelOpen) => {
                        deadline.disarm();
                        if let Some(rx) = events.as_mut() {
                            self.transfer(link.as_ref(), rx, &descriptor, id).await;
                        }
                    }
                    Some(LinkEvent::Frame(_)) => {
                        debug!(event = "unexpected_frame", "Receiver sent a frame, ignoring");
                    }
                    Some(LinkEvent::Closed(reason)) => self.abort(TransferError::TransportLoss(reason)),
                    None => self.abort(TransferError::TransportLoss("link dropped".into())),
                },

                _ = deadline.expired() => {
                    self.abort(TransferError::Negotiation("no answer or channel within the negotiation timeout".into()));
                }
            }
        }

        if self.state == TransferState::Completed {
            self.linger(&mut events).await;
        }
        link.close().await;
        self.state
    }

    /// `Transferring`: meta, every chunk, done.
    async fn transfer<L: PeerLink + ?Sized>(
        &mut self,
        link: &L,
        events: &mut LinkEvents,
        descriptor: &TransferDescriptor,
        id: Uuid,
    ) {
        self.set_state(TransferState::Transferring);

        let meta = ControlFrame::Meta {
            descriptor: descriptor.clone(),
            framing: self.options.framing,
        };
        if let Err(e) = link.send_text(meta.encode()).await {
            self.abort(e);
            return;
        }

        let total = descriptor.size;
        self.report(Progress::sent(0, total));

        let mut slice = vec![0u8; CHUNK_SIZE];
        let mut frame = BytesMut::new();
        let mut sent = 0u64;
        let mut seq = 0u32;

        while sent < total {
            let want = (total - sent).min(CHUNK_SIZE as u64) as usize;
            if let Err(e) = self.source.reader.read_exact(&mut slice[..want]).await {
                self.abort(TransferError::Source(e.to_string()));
                return;
            }

            let chunk = match self.options.framing {
                ChunkFraming::Raw => Bytes::copy_from_slice(&slice[..want]),
                ChunkFraming::Tagged => {
                    encode_tagged_chunk_into(&mut frame, id, seq, &slice[..want]);
                    frame.split().freeze()
                }
            };
            if let Err(e) = link.send_binary(chunk).await {
                self.abort(e);
                return;
            }
            sent += want as u64;
            seq = seq.wrapping_add(1);
            self.report(Progress::sent(sent, total));

            tokio::task::yield_now().await;
            if let Err(e) = self.poll_interrupts(link, events).await {
                self.abort(e);
                return;
            }
        }

        let done = ControlFrame::Done {
            id: descriptor.id.clone(),
        };
        if let Err(e) = link.send_text(done.encode()).await {
            self.abort(e);
            return;
        }

        info!(
            event = "send_completed",
            transfer = %descriptor.id,
            bytes = sent,
            chunks = seq,
            "File sent"
        );
        // An empty file has no last chunk to carry it to 100.
        if total == 0 {
            self.report(Progress::complete(total));
        }
        self.set_state(TransferState::Completed);
        notify(&self.events, TransferEvent::Sent(descriptor.clone()));
    }

    /// Non-blocking look at everything that may have happened while the
    /// last chunk was in flight.
    async fn poll_interrupts<L: PeerLink + ?Sized>(
        &mut self,
        link: &L,
        events: &mut LinkEvents,
    ) -> Result<(), TransferError> {
        if self.stop.cancelled() {
            return Err(TransferError::Cancelled);
        }

        loop {
            match events.try_recv() {
                Ok(LinkEvent::Closed(reason)) => return Err(TransferError::TransportLoss(reason)),
                Ok(LinkEvent::LocalCandidate(candidate)) => self.signaler.candidate(candidate),
                Ok(_) => {}
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    return Err(TransferError::TransportLoss("link dropped".into()))
                }
            }
        }

        loop {
            match self.signals.try_recv() {
                Ok(SessionSignal::PeerLeft(peer)) => {
                    return Err(TransferError::TransportLoss(format!(
                        "peer {peer} left the room"
                    )))
                }
                Ok(SessionSignal::Candidate(candidate)) => {
                    if let Some(candidate) = self.candidates.push(candidate) {
                        if let Err(e) = link.add_remote_candidate(candidate).await {
                            warn!(event = "late_candidate_rejected", error = %e, "Ignoring candidate during transfer");
                        }
                    }
                }
                Ok(_) => {}
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return Err(TransferError::Cancelled),
            }
        }
        Ok(())
    }

    /// Keeps the link up after `done` until the receiver hangs up, so the
    /// tail of the stream is not cut off by our own close.
    async fn linger(&mut self, events: &mut Option<LinkEvents>) {
        let wait_for_close = async {
            loop {
                match next_link_event(events).await {
                    Some(LinkEvent::Closed(_)) | None => break,
                    Some(_) => {}
                }
            }
        };
        tokio::select! {
            _ = wait_for_close => debug!(event = "receiver_hung_up", "Receiver closed the link"),
            _ = tokio::time::sleep(COMPLETION_LINGER) => debug!(event = "linger_elapsed", "Closing link after linger"),
            _ = self.stop.wait() => {}
        }
    }

    fn abort(&mut self, error: TransferError) {
        if self.state.is_terminal() {
            return;
        }
        warn!(event = "send_aborted", error = %error, "Send aborted");
        self.set_state(TransferState::Aborted);
        notify(
            &self.events,
            TransferEvent::Failed {
                role: Role::Send,
                error,
            },
        );
    }

    fn set_state(&mut self, state: TransferState) {
        debug!(event = "sender_state", from = %self.state, to = %state);
        self.state = state;
        notify(
            &self.events,
            TransferEvent::StateChanged {
                role: Role::Send,
                state,
            },
        );
    }

    fn report(&self, progress: Progress) {
        notify(
            &self.events,
            TransferEvent::Progress {
                role: Role::Send,
                progress,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("roomdrop_test_{name}"));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn source_guesses_mime_from_extension() {
        let dir = test_dir("source_mime");
        let path = dir.join("photo.jpg");
        std::fs::write(&path, vec![0u8; 1234]).unwrap();

        let source = TransferSource::open(&path).await.unwrap();
        assert_eq!(source.name, "photo.jpg");
        assert_eq!(source.size, 1234);
        assert_eq!(source.mime, "image/jpeg");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn unknown_extension_falls_back_to_octet_stream() {
        let dir = test_dir("source_fallback");
        let path = dir.join("blob.zzzunknown");
        std::fs::write(&path, b"x").unwrap();

        let source = TransferSource::open(&path).await.unwrap();
        assert_eq!(source.mime, DEFAULT_MIME);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn directories_are_not_sources() {
        let dir = test_dir("source_dir");
        assert!(TransferSource::open(&dir).await.is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
