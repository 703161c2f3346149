//! Metrics agent: sampling, buffering and delivery.

pub mod alloc;
pub mod collector;
pub mod dispatcher;
pub mod scheduler;
pub mod transport;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

pub use collector::{Collector, HostCollector, RuntimeCollector};
pub use dispatcher::{DeliveryMode, Dispatcher, DispatcherConfig};
pub use scheduler::{MetricBuffer, Scheduler, SchedulerConfig};
pub use transport::{HttpTransport, Transport, TransportConfig};

use crate::config::AgentConfig;
use crate::error::TransportResult;
use crate::logging::Logger;
use crate::retry::RetryPolicy;

/// Wire up the agent from its configuration and run it until `token` is
/// cancelled.
pub async fn run(config: &AgentConfig, logger: &Logger, token: CancellationToken) -> TransportResult<()> {
    let transport = HttpTransport::new(TransportConfig {
        address: config.address.clone(),
        signer: config.signer(),
        timeout: config.http_timeout(),
    })?;

    info!(
        target: "relay::agent",
        server = transport.base_url(),
        signed = config.signer().is_some(),
        rate_limit = config.rate_limit,
        "Agent starting"
    );

    let mode = if config.legacy_path { DeliveryMode::PerMetric } else { DeliveryMode::Batch };
    let dispatcher = Dispatcher::spawn(
        DispatcherConfig { workers: config.rate_limit, mode, retry: RetryPolicy::default() },
        Arc::new(transport),
        token.clone(),
        logger.component("dispatcher"),
    );

    let collectors: Vec<Box<dyn Collector>> = vec![Box::new(RuntimeCollector::new()), Box::new(HostCollector::new())];
    let scheduler = Scheduler::new(
        SchedulerConfig { poll_interval: config.poll_interval(), report_interval: config.report_interval() },
        collectors,
        Arc::new(MetricBuffer::new()),
        dispatcher,
        logger.component("scheduler"),
    );

    scheduler.run(token).await;
    info!(target: "relay::agent", "Agent stopped");
    Ok(())
}
