//! The chunked transfer protocol run over an open data channel.

pub mod artifact;
pub mod frame;
pub mod negotiation;
pub mod receiver;
pub mod sender;
pub mod state;
