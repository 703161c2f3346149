//! Process signal handling.

use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Wait for SIGINT or SIGTERM (Ctrl-C elsewhere), then cancel `token`.
///
/// Returns early without cancelling if `token` is cancelled by someone else.
pub async fn shutdown_signal(token: CancellationToken) {
    tokio::select! {
        _ = token.cancelled() => return,
        signal = wait_for_signal() => {
            info!(target: "relay::shutdown", signal, "Shutdown signal received");
        }
    }
    token.cancel();
}

/// Spawn [`shutdown_signal`] on the current runtime.
pub fn spawn_signal_listener(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(shutdown_signal(token))
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use signal::unix::{signal as unix_signal, SignalKind};

    let (mut sigterm, mut sigint) = match (
        unix_signal(SignalKind::terminate()),
        unix_signal(SignalKind::interrupt()),
    ) {
        (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
        (Err(e), _) | (_, Err(e)) => {
            warn!(target: "relay::shutdown", error = %e, "Unix signal handlers unavailable, falling back to Ctrl-C");
            return ctrl_c().await;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    ctrl_c().await
}

async fn ctrl_c() -> &'static str {
    if let Err(e) = signal::ctrl_c().await {
        warn!(target: "relay::shutdown", error = %e, "Ctrl-C handler unavailable");
        std::future::pending::<()>().await;
    }
    "ctrl-c"
}
