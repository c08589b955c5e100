//! Process signal handling: SIGINT and SIGTERM request a clean shutdown,
//! SIGHUP asks every producer to roll (close and reopen writer resources)
//! without stopping.

use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

pub enum SignalOutcome {
    Shutdown,
    Roll,
}

/// Waits for the next signal gollum cares about. Intended to be raced
/// against the coordinator's own run loop in a `tokio::select!`.
pub async fn next_signal() -> SignalOutcome {
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sighup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");

    tokio::select! {
        _ = sigint.recv() => {
            info!("received SIGINT, shutting down");
            SignalOutcome::Shutdown
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM, shutting down");
            SignalOutcome::Shutdown
        }
        _ = sighup.recv() => {
            info!("received SIGHUP, rolling producers");
            SignalOutcome::Roll
        }
    }
}
