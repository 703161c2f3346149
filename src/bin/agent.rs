//! `relay-agent`: samples runtime and host metrics and reports them to the
//! server until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use metrics_relay::agent::{self, alloc::CountingAllocator};
use metrics_relay::config::AgentConfig;
use metrics_relay::logging::init_logging;
use metrics_relay::shutdown::spawn_signal_listener;
use metrics_relay::RELAY_VERSION;

#[global_allocator]
static GLOBAL: CountingAllocator = CountingAllocator;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AgentConfig::parse();
    config.validate().context("invalid agent configuration")?;

    let logger = init_logging(&config.logging, "agent").context("failed to initialize logging")?;
    tracing::info!(target: "relay::init", version = RELAY_VERSION, "relay-agent starting");

    let token = CancellationToken::new();
    let signals = spawn_signal_listener(token.clone());

    let outcome = agent::run(&config, &logger, token.clone()).await;
    token.cancel();
    signals.await.context("signal listener failed")?;

    outcome.context("agent failed")
}
