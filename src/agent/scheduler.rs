//! Poll / report control loop.

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn, Instrument, Span};

use super::collector::Collector;
use super::dispatcher::Dispatcher;
use crate::model::{Batch, Metric};

// ============================================================================
// METRIC BUFFER
// ============================================================================

/// Metrics sampled since the last report.
#[derive(Debug, Default)]
pub struct MetricBuffer {
    metrics: Mutex<Vec<Metric>>,
}

impl MetricBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&self, batch: Batch) {
        self.metrics.lock().extend(batch);
    }

    /// Take everything buffered, leaving it empty.
    pub fn drain(&self) -> Batch {
        std::mem::take(&mut *self.metrics.lock())
    }

    pub fn len(&self) -> usize {
        self.metrics.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.lock().is_empty()
    }
}

// ============================================================================
// SCHEDULER
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub report_interval: Duration,
}

pub struct Scheduler {
    config: SchedulerConfig,
    collectors: Vec<Box<dyn Collector>>,
    buffer: Arc<MetricBuffer>,
    dispatcher: Dispatcher,
    span: Span,
}

impl Debug for Scheduler {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("collectors", &self.collectors.iter().map(|c| c.name()).collect::<Vec<_>>())
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

fn ticker(period: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        collectors: Vec<Box<dyn Collector>>,
        buffer: Arc<MetricBuffer>,
        dispatcher: Dispatcher,
        span: Span,
    ) -> Self {
        Self { config, collectors, buffer, dispatcher, span }
    }

    /// Run until `token` is cancelled, then stop the dispatcher.
    pub async fn run(self, token: CancellationToken) {
        let span = self.span.clone();
        async move {
            let mut poll = ticker(self.config.poll_interval);
            let mut report = ticker(self.config.report_interval);

            info!(
                target: "relay::agent",
                poll_secs = self.config.poll_interval.as_secs_f64(),
                report_secs = self.config.report_interval.as_secs_f64(),
                "Scheduler started"
            );

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = poll.tick() => self.poll(),
                    _ = report.tick() => self.report(&token).await,
                }
            }

            info!(target: "relay::agent", dropped = self.buffer.len(), "Scheduler stopping");
            self.dispatcher.shutdown().await;
        }
        .instrument(span)
        .await
    }

    fn poll(&self) {
        for collector in &self.collectors {
            let batch = collector.collect();
            trace!(target: "relay::agent", collector = collector.name(), metrics = batch.len(), "Collected");
            self.buffer.extend(batch);
        }
    }

    async fn report(&self, token: &CancellationToken) {
        let batch = self.buffer.drain();
        if batch.is_empty() {
            return;
        }
        let size = batch.len();
        if self.dispatcher.dispatch(batch, token).await {
            debug!(target: "relay::agent", metrics = size, "Batch queued");
        } else if !token.is_cancelled() {
            warn!(target: "relay::agent", metrics = size, "Dispatcher closed, batch dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::agent::collector::POLL_COUNT;
    use crate::agent::dispatcher::{DeliveryMode, DispatcherConfig};
    use crate::agent::transport::Transport;
    use crate::error::TransportResult;
    use crate::retry::RetryPolicy;

    struct PollCounter;

    impl Collector for PollCounter {
        fn name(&self) -> &'static str {
            "poll-counter"
        }

        fn collect(&self) -> Batch {
            vec![Metric::counter(POLL_COUNT, 1)]
        }
    }

    #[derive(Default)]
    struct Sink {
        batches: Mutex<Vec<Batch>>,
    }

    #[async_trait]
    impl Transport for Sink {
        async fn send_batch(&self, batch: &[Metric]) -> TransportResult<()> {
            self.batches.lock().push(batch.to_vec());
            Ok(())
        }

        async fn send_single(&self, _metric: &Metric) -> TransportResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_buffer_drain_resets() {
        let buffer = MetricBuffer::new();
        buffer.extend(vec![Metric::counter("a", 1)]);
        buffer.extend(vec![Metric::gauge("b", 1.0)]);

        assert_eq!(buffer.drain().len(), 2);
        assert!(buffer.is_empty());
        assert!(buffer.drain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_accumulate_until_report() {
        let sink = Arc::new(Sink::default());
        let token = CancellationToken::new();
        let dispatcher = Dispatcher::spawn(
            DispatcherConfig { workers: 1, mode: DeliveryMode::Batch, retry: RetryPolicy::none() },
            sink.clone(),
            token.clone(),
            Span::none(),
        );
        let buffer = Arc::new(MetricBuffer::new());
        let scheduler = Scheduler::new(
            SchedulerConfig { poll_interval: Duration::from_secs(2), report_interval: Duration::from_secs(10) },
            vec![Box::new(PollCounter)],
            buffer.clone(),
            dispatcher,
            Span::none(),
        );

        let handle = tokio::spawn(scheduler.run(token.clone()));
        tokio::time::sleep(Duration::from_secs(11)).await;

        {
            let batches = sink.batches.lock();
            assert_eq!(batches.len(), 1);
            // Polls at 2, 4, 6, 8, 10 land before the report at 10
            assert!(batches[0].len() >= 4, "got {}", batches[0].len());
            assert!(batches[0].iter().all(|m| m.name() == POLL_COUNT));
        }

        token.cancel();
        handle.await.unwrap();
        assert!(buffer.len() <= 1);
    }
}
