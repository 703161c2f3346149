//! Bounded worker pool draining the batch queue.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument, Span};

use super::transport::Transport;
use crate::error::{TransportError, TransportResult};
use crate::model::Batch;
use crate::retry::RetryPolicy;

/// How a batch goes on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// One `/updates/` request per batch
    Batch,
    /// One `/update/{type}/{name}/{value}` request per metric, each retried
    /// on its own
    PerMetric,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Worker count and queue capacity
    pub workers: usize,
    pub mode: DeliveryMode,
    pub retry: RetryPolicy,
}

#[derive(Debug)]
pub struct Dispatcher {
    sender: flume::Sender<Batch>,
    workers: JoinSet<()>,
}

impl Dispatcher {
    /// Start `config.workers` workers sharing one queue of the same capacity.
    pub fn spawn(config: DispatcherConfig, transport: Arc<dyn Transport>, token: CancellationToken, span: Span) -> Self {
        let workers_count = config.workers.max(1);
        let (sender, receiver) = flume::bounded(workers_count);
        let mut workers = JoinSet::new();

        for worker_id in 0..workers_count {
            let worker = Worker {
                id: worker_id,
                receiver: receiver.clone(),
                transport: transport.clone(),
                mode: config.mode,
                retry: config.retry.clone(),
                token: token.clone(),
            };
            workers.spawn(worker.run().instrument(span.clone()));
        }

        info!(target: "relay::agent", parent: &span, workers = workers_count, mode = ?config.mode, "Dispatcher started");
        Self { sender, workers }
    }

    /// Queue a batch, waiting for room. Returns `false` when cancelled or the
    /// workers are gone.
    pub async fn dispatch(&self, batch: Batch, token: &CancellationToken) -> bool {
        tokio::select! {
            _ = token.cancelled() => false,
            sent = self.sender.send_async(batch) => sent.is_ok(),
        }
    }

    /// Close the queue and wait for the workers to finish what they hold.
    pub async fn shutdown(mut self) {
        drop(self.sender);
        while let Some(joined) = self.workers.join_next().await {
            if let Err(e) = joined {
                warn!(target: "relay::agent", error = %e, "Dispatcher worker panicked");
            }
        }
    }
}

struct Worker {
    id: usize,
    receiver: flume::Receiver<Batch>,
    transport: Arc<dyn Transport>,
    mode: DeliveryMode,
    retry: RetryPolicy,
    token: CancellationToken,
}

impl Worker {
    async fn run(self) {
        loop {
            let batch = tokio::select! {
                _ = self.token.cancelled() => break,
                received = self.receiver.recv_async() => match received {
                    Ok(batch) => batch,
                    Err(_) => break,
                },
            };

            let outcome = tokio::select! {
                _ = self.token.cancelled() => Err(TransportError::Cancelled),
                result = self.deliver(&batch) => result,
            };

            match outcome {
                Ok(()) => debug!(target: "relay::agent", worker = self.id, metrics = batch.len(), "Batch sent"),
                Err(TransportError::Cancelled) => {
                    debug!(target: "relay::agent", worker = self.id, "Send cancelled by shutdown");
                    break;
                }
                Err(e) => warn!(
                    target: "relay::agent",
                    worker = self.id,
                    metrics = batch.len(),
                    category = e.category(),
                    error = %e,
                    "Dropping batch after failed delivery"
                ),
            }
        }
        debug!(target: "relay::agent", worker = self.id, "Worker stopped");
    }

    async fn deliver(&self, batch: &Batch) -> TransportResult<()> {
        match self.mode {
            DeliveryMode::Batch => self.retry.run("send_batch", |_| self.transport.send_batch(batch)).await,
            DeliveryMode::PerMetric => {
                let mut first_error = None;
                for metric in batch {
                    if let Err(e) = self.retry.run("send_single", |_| self.transport.send_single(metric)).await {
                        warn!(target: "relay::agent", worker = self.id, metric = %metric.id, error = %e, "Metric not delivered");
                        first_error.get_or_insert(e);
                    }
                }
                first_error.map_or(Ok(()), Err)
            }
        }
    }
}
