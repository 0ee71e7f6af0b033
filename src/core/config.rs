//! Centralized configuration constants for roomdrop.
//!
//! All tunable parameters live here so they can be reviewed and adjusted
//! in a single place. Wire-format constants (frame kinds, chunk header
//! layout, signaling event names) stay in their respective modules.

use std::time::Duration;

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Maximum chunk payload in bytes (64 KiB).
///
/// Matches the default SCTP message size browsers and webrtc-rs accept
/// without negotiation, so raw chunk frames interoperate with browser peers.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// MIME type used when the sender cannot guess one from the file name.
pub const DEFAULT_MIME: &str = "application/octet-stream";

/// Name of the single ordered data channel carrying a transfer.
pub const DATA_CHANNEL_LABEL: &str = "file";

// ── Connection / Network ─────────────────────────────────────────────────────

/// STUN server handed to the ICE agent. No TURN fallback is configured.
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Upper bound for the whole offer/answer exchange, from `start` until the
/// data channel opens.
pub const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(60);

/// High water mark for the data channel send buffer (bytes).
/// The chunk loop waits for the buffer to drain below this before queueing.
pub const DC_BUFFERED_AMOUNT_HIGH: usize = 4 * 1024 * 1024;

/// Maximum time spent waiting for the send buffer to drain.
pub const DC_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll interval while waiting for the send buffer to drain.
pub const DC_DRAIN_POLL: Duration = Duration::from_millis(10);

/// How long a sender keeps the link open after `done`, waiting for the
/// receiver to close it.
pub const COMPLETION_LINGER: Duration = Duration::from_secs(30);

// ── Relay ────────────────────────────────────────────────────────────────────

/// Default TCP port of the signaling relay.
pub const DEFAULT_RELAY_PORT: u16 = 3000;

/// Default relay URL used by `send` / `receive`.
pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:3000/";

/// Path answered with `200 ok` instead of a WebSocket upgrade.
pub const HEALTH_PATH: &str = "/health";

/// Per-connection outbound queue depth on the relay.
pub const RELAY_OUTBOUND_QUEUE: usize = 128;

// ── Config file ──────────────────────────────────────────────────────────────

/// Config file picked up from the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "roomdrop.toml";
