pub mod config;
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod relay;
pub mod transfer;
