//! `relay` command: runs the signaling relay until stopped.

use anyhow::Result;
use tracing::info;

use crate::core::relay::server::{OriginPolicy, RelayServer};
use crate::utils::sos::SignalOfStop;
use crate::workers::args::RelaySettings;

pub async fn run(settings: RelaySettings, sos: SignalOfStop) -> Result<()> {
    let origins = OriginPolicy::new(settings.allowed_origins.iter());
    if !origins.allows_any() {
        info!(
            event = "origin_allowlist",
            origins = ?settings.allowed_origins,
            "Restricting WebSocket origins"
        );
    }
    let server = RelayServer::bind(settings.addr, origins).await?;
    server.run(sos).await
}
