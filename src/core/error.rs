//! Error taxonomy for the relay and the transfer protocol.
//!
//! Application plumbing (startup, CLI, disk I/O) stays on `anyhow`; these
//! typed errors are what sessions report to their caller and what the relay
//! uses to decide whether a connection may proceed.

use thiserror::Error;

/// Why a transfer session ended in `Aborted`, or why a frame was dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    /// Description or candidate application was rejected, or the exchange
    /// did not finish in time.
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// The peer sent a frame that does not fit the current state.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The direct channel closed or errored, or the peer left the room.
    #[error("transport lost: {0}")]
    TransportLoss(String),

    /// The completion marker arrived before the announced size was received.
    #[error("transfer incomplete: expected {expected} bytes, received {received}")]
    Incomplete { expected: u64, received: u64 },

    /// The source file could not be read.
    #[error("source read failed: {0}")]
    Source(String),

    /// The session was torn down locally.
    #[error("transfer cancelled")]
    Cancelled,
}

/// Relay-level failures. None of these ever terminate the relay process.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    /// The upgrade request carried an `Origin` outside the allowlist.
    #[error("origin not allowed: {0}")]
    CrossOriginRejection(String),

    /// A text frame did not match any known signaling message.
    #[error("malformed signaling message: {0}")]
    Malformed(String),

    /// A room id that is blank after trimming.
    #[error("room id must not be empty")]
    EmptyRoomId,

    /// A message referenced a room with no other members.
    #[error("room {0} has no other members")]
    RoutingFailure(String),
}
