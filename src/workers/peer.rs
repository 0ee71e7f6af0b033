//! `send` / `receive` commands: one signaling connection, one coordinator,
//! and a loop feeding relay traffic in and session events out.

use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{bail, Result};
use tracing::{debug, error, info, warn};

use crate::core::connection::signaling::SignalingClient;
use crate::core::connection::webrtc::WebRtcConnector;
use crate::core::coordinator::{CoordinatorEvent, SessionCoordinator};
use crate::core::transfer::artifact::ArtifactRef;
use crate::core::transfer::sender::{SendOptions, TransferSource};
use crate::core::transfer::state::{TransferEvent, TransferState};
use crate::utils::format::format_bytes;
use crate::utils::sos::SignalOfStop;
use crate::workers::args::{ReceiveSettings, SendSettings};

type Coordinator = SessionCoordinator<WebRtcConnector>;

pub async fn run_send(settings: SendSettings, sos: SignalOfStop) -> Result<()> {
    let source = TransferSource::open(&settings.file).await?;
    info!(
        event = "send_prepared",
        name = %source.name,
        size = %format_bytes(source.size),
        room = %settings.room,
        "Ready to send"
    );

    let Some(mut client) = connect(&settings.relay_url, &sos).await? else {
        return Ok(());
    };
    let connector = Arc::new(WebRtcConnector::with_ice_servers(settings.stun_servers.clone()));
    let mut coordinator = SessionCoordinator::new(connector, client.sink());
    coordinator
        .start_send(
            settings.room.clone(),
            source,
            SendOptions {
                framing: settings.framing,
            },
        )
        .await;

    let mut progress = ProgressLog::default();
    let mut relay_open = true;
    let state = loop {
        tokio::select! {
            _ = sos.wait() => {
                info!(event = "send_cancelled", "Stopping");
                coordinator.teardown().await;
                client.shutdown();
                return Ok(());
            }
            msg = client.recv(), if relay_open => match msg {
                Some(msg) => coordinator.route(msg),
                None => {
                    relay_lost(&coordinator);
                    relay_open = false;
                }
            },
            event = coordinator.next_event() => match event {
                CoordinatorEvent::Transfer(event) => progress.log(&event),
                CoordinatorEvent::SessionEnded { state, .. } => break state,
            },
        }
    };

    coordinator.teardown().await;
    client.shutdown();
    log_history(&coordinator);
    match state {
        TransferState::Completed => Ok(()),
        other => bail!("Send ended {other}"),
    }
}

pub async fn run_receive(settings: ReceiveSettings, sos: SignalOfStop) -> Result<()> {
    let Some(mut client) = connect(&settings.relay_url, &sos).await? else {
        return Ok(());
    };
    let connector = Arc::new(WebRtcConnector::with_ice_servers(settings.stun_servers.clone()));
    let mut coordinator = SessionCoordinator::new(connector, client.sink());
    coordinator.set_stay_open(settings.stay_open);
    coordinator.start_receive(settings.room.clone()).await;
    info!(
        event = "receive_ready",
        room = %settings.room,
        out = %settings.out_dir.display(),
        stay_open = settings.stay_open,
        "Waiting for a file"
    );

    let mut progress = ProgressLog::default();
    let mut relay_open = true;
    let mut saved = 0usize;
    let state = loop {
        tokio::select! {
            _ = sos.wait() => {
                info!(event = "receive_cancelled", files = saved, "Stopping");
                coordinator.teardown().await;
                client.shutdown();
                log_history(&coordinator);
                return Ok(());
            }
            msg = client.recv(), if relay_open => match msg {
                Some(msg) => coordinator.route(msg),
                None => {
                    relay_lost(&coordinator);
                    relay_open = false;
                    if !coordinator.is_running() {
                        break TransferState::Aborted;
                    }
                }
            },
            event = coordinator.next_event() => match event {
                CoordinatorEvent::Transfer(TransferEvent::Received(artifact)) => {
                    if save(&mut coordinator, artifact.reference, &settings.out_dir).await {
                        saved += 1;
                    }
                }
                CoordinatorEvent::Transfer(event) => progress.log(&event),
                CoordinatorEvent::SessionEnded { state, .. } => {
                    progress = ProgressLog::default();
                    if !settings.stay_open || !relay_open {
                        break state;
                    }
                    info!(event = "receive_waiting", room = %settings.room, files = saved, "Waiting for the next file");
                }
            },
        }
    };

    coordinator.teardown().await;
    client.shutdown();
    log_history(&coordinator);
    match state {
        TransferState::Completed => Ok(()),
        _ if saved > 0 => Ok(()),
        other => bail!("Receive ended {other}"),
    }
}

/// `None` when stopped before the relay answered.
async fn connect(url: &str, sos: &SignalOfStop) -> Result<Option<SignalingClient>> {
    match sos.select(SignalingClient::connect(url)).await {
        Some(client) => client.map(Some),
        None => {
            info!(event = "connect_cancelled", relay = %url, "Stopped before the relay answered");
            Ok(None)
        }
    }
}

/// Writes the artifact out and releases it. A file that could not be
/// written is dropped from the history too. Returns whether it was saved.
async fn save(coordinator: &mut Coordinator, reference: ArtifactRef, dir: &Path) -> bool {
    let Some(artifact) = coordinator.resolve(&reference) else {
        warn!(event = "artifact_missing", artifact = %reference, "Artifact already released");
        return false;
    };
    let name = artifact.descriptor.name.clone();
    let size = artifact.len();
    let result = artifact.save_to(dir).await;
    if result.is_ok() {
        coordinator.release(&reference);
    } else {
        coordinator.delete_received(&reference);
    }
    match result {
        Ok(path) => {
            info!(
                event = "file_received",
                name = %name,
                size = %format_bytes(size),
                path = %path.display(),
                "File received"
            );
            true
        }
        Err(e) => {
            error!(event = "save_failed", name = %name, error = %e, "Failed to save received file");
            false
        }
    }
}

/// One line per file this run shared or received, newest first.
fn log_history(coordinator: &Coordinator) {
    for record in coordinator.shared() {
        info!(
            event = "history_shared",
            name = %record.descriptor.name,
            size = %format_bytes(record.descriptor.size),
            room = %record.room,
            secs_ago = age_secs(record.at),
            "Shared"
        );
    }
    for record in coordinator.received() {
        info!(
            event = "history_received",
            name = %record.descriptor.name,
            size = %format_bytes(record.descriptor.size),
            room = %record.room,
            secs_ago = age_secs(record.at),
            released = record.released,
            "Received"
        );
    }
}

fn age_secs(at: SystemTime) -> u64 {
    at.elapsed().map(|d| d.as_secs()).unwrap_or(0)
}

/// A running session no longer needs the relay once its channel is up.
fn relay_lost(coordinator: &Coordinator) {
    if coordinator.is_running() {
        warn!(event = "relay_lost", "Relay connection lost, continuing on the direct channel");
    } else {
        warn!(event = "relay_lost", "Relay connection lost");
    }
}

/// Logs progress in 10% steps rather than per chunk.
#[derive(Debug, Default)]
struct ProgressLog {
    last_step: Option<u8>,
}

impl ProgressLog {
    fn log(&mut self, event: &TransferEvent) {
        match event {
            TransferEvent::StateChanged { role, state } => {
                info!(event = "state_changed", %role, %state, "Transfer {}", state);
            }
            TransferEvent::Progress { role, progress } => {
                let step = progress.percent / 10;
                if self.last_step == Some(step) {
                    return;
                }
                self.last_step = Some(step);
                info!(
                    event = "progress",
                    %role,
                    percent = progress.percent,
                    done = %format_bytes(progress.bytes),
                    total = %format_bytes(progress.total),
                    "{}%",
                    progress.percent
                );
            }
            TransferEvent::Sent(descriptor) => {
                info!(
                    event = "file_sent",
                    name = %descriptor.name,
                    size = %format_bytes(descriptor.size),
                    "File sent, waiting for the receiver to close"
                );
            }
            TransferEvent::Received(artifact) => {
                debug!(event = "artifact_ready", artifact = %artifact.reference);
            }
            TransferEvent::Failed { role, error } => {
                error!(event = "transfer_failed", %role, %error, "Transfer failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transfer::state::{Progress, Role};

    #[test]
    fn progress_log_tracks_ten_percent_steps() {
        let mut log = ProgressLog::default();
        for bytes in [0u64, 5, 9, 10, 55, 100] {
            log.log(&TransferEvent::Progress {
                role: Role::Send,
                progress: Progress::sent(bytes, 100),
            });
        }
        assert_eq!(log.last_step, Some(10));
    }
}
