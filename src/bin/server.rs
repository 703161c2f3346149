//! `relay-server`: accepts metric updates over HTTP and persists them.

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use metrics_relay::config::ServerConfig;
use metrics_relay::logging::init_logging;
use metrics_relay::server;
use metrics_relay::shutdown::spawn_signal_listener;
use metrics_relay::RELAY_VERSION;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::parse();
    config.validate().context("invalid server configuration")?;

    let logger = init_logging(&config.logging, "server").context("failed to initialize logging")?;
    tracing::info!(
        target: "relay::init",
        version = RELAY_VERSION,
        store_interval = config.store_interval,
        restore = config.restore,
        "relay-server starting"
    );

    let token = CancellationToken::new();
    let signals = spawn_signal_listener(token.clone());

    let outcome = server::run(config, logger, token.clone()).await;
    if let Err(e) = &outcome {
        tracing::error!(target: "relay::init", category = e.category(), error = %e, "Server exited with error");
    }
    token.cancel();
    signals.await.context("signal listener failed")?;

    outcome.context("server failed")
}
