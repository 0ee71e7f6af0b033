mod core;
mod utils;
mod workers;

use crate::utils::sos::SignalOfStop;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use workers::args::{Args, Mode};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Args::load()?;

    // webrtc_ice logs "unknown TransactionID" warnings for late STUN
    // responses, which are normal. Keep them out unless tracing everything.
    let filter = match settings.verbose {
        0 => "warn,roomdrop=info,webrtc_ice::agent=error",
        1 => "info,webrtc_ice::agent=error",
        2 => "debug,webrtc_ice::agent=error",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let sos = SignalOfStop::new();

    // Ctrl+C handler
    let sos_clone = sos.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        sos_clone.cancel();
    });

    match settings.mode {
        Mode::Relay(relay) => workers::relay::run(relay, sos).await,
        Mode::Send(send) => workers::peer::run_send(send, sos).await,
        Mode::Receive(receive) => workers::peer::run_receive(receive, sos).await,
    }
}
