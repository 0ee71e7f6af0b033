//! Session lifecycle states and the events sessions report to their owner.

use std::fmt;

use tokio::sync::mpsc;
use tracing::trace;

use super::artifact::Artifact;
use super::frame::TransferDescriptor;
use crate::core::error::TransferError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Send,
    Receive,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Send => f.write_str("send"),
            Role::Receive => f.write_str("receive"),
        }
    }
}

/// `Idle -> Negotiating -> [AwaitingMeta] -> Transferring -> Completed`,
/// with `Aborted` reachable from every non-terminal state.
/// `AwaitingMeta` only exists on the receiving side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferState {
    Idle,
    Negotiating,
    AwaitingMeta,
    Transferring,
    Completed,
    Aborted,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferState::Completed | TransferState::Aborted)
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransferState::Idle => "idle",
            TransferState::Negotiating => "negotiating",
            TransferState::AwaitingMeta => "awaiting-meta",
            TransferState::Transferring => "transferring",
            TransferState::Completed => "completed",
            TransferState::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub bytes: u64,
    pub total: u64,
    pub percent: u8,
}

impl Progress {
    /// Sender side: 100 is reached once the last chunk is queued.
    pub fn sent(bytes: u64, total: u64) -> Self {
        Self {
            bytes,
            total,
            percent: percent_of(bytes, total),
        }
    }

    /// Receiver side: held at 99 until the done frame arrives.
    pub fn received(bytes: u64, total: u64) -> Self {
        Self {
            bytes,
            total,
            percent: percent_of(bytes, total).min(99),
        }
    }

    pub fn complete(total: u64) -> Self {
        Self {
            bytes: total,
            total,
            percent: 100,
        }
    }
}

/// `floor(done * 100 / total)` clamped to 100; 0 for an empty total.
pub fn percent_of(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = (done as u128 * 100) / total as u128;
    pct.min(100) as u8
}

#[derive(Debug, Clone)]
pub enum TransferEvent {
    StateChanged {
        role: Role,
        state: TransferState,
    },
    Progress {
        role: Role,
        progress: Progress,
    },
    /// Sender finished queueing every frame, done included.
    Sent(TransferDescriptor),
    /// Receiver assembled a complete artifact.
    Received(Artifact),
    Failed {
        role: Role,
        error: TransferError,
    },
}

pub type EventSink = mpsc::UnboundedSender<TransferEvent>;

/// Report to the session owner. A closed channel is not an error: the owner
/// has stopped listening.
pub fn notify(tx: &Option<EventSink>, event: TransferEvent) {
    if let Some(tx) = tx {
        if tx.send(event).is_err() {
            trace!(event = "notify_dropped", "Event receiver gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_floors() {
        assert_eq!(percent_of(0, 153_600), 0);
        assert_eq!(percent_of(65_536, 153_600), 42);
        assert_eq!(percent_of(131_072, 153_600), 85);
        assert_eq!(percent_of(153_600, 153_600), 100);
    }

    #[test]
    fn percent_of_empty_total_is_zero() {
        assert_eq!(percent_of(0, 0), 0);
    }

    #[test]
    fn percent_clamps_overshoot() {
        assert_eq!(percent_of(200, 100), 100);
        assert_eq!(percent_of(u64::MAX, 1), 100);
    }

    #[test]
    fn received_progress_holds_below_100() {
        assert_eq!(Progress::received(100, 100).percent, 99);
        assert_eq!(Progress::sent(100, 100).percent, 100);
        assert_eq!(Progress::complete(0).percent, 100);
    }

    #[test]
    fn terminal_states() {
        assert!(TransferState::Completed.is_terminal());
        assert!(TransferState::Aborted.is_terminal());
        assert!(!TransferState::AwaitingMeta.is_terminal());
    }
}
