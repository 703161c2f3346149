//! Update engine: validation, counter accumulation and persistence through a
//! unit of work.

use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::Notify;
use tracing::{debug, warn, Instrument, Span};

use crate::error::{EngineError, EngineResult, StorageError, StorageResult};
use crate::model::{Metric, MetricFilter, MetricId, MetricKind, MetricMap, MetricPayload};
use crate::storage::{Backend, Operation, Storage, Transaction, UnitOfWork};
use crate::validation;

// ============================================================================
// ACCUMULATE OPERATION
// ============================================================================

/// Read current counter totals, add incoming deltas, write everything back.
/// Gauges are written as received.
struct Accumulate {
    incoming: Vec<Metric>,
}

impl Accumulate {
    fn counter_filter(&self) -> MetricFilter {
        self.incoming
            .iter()
            .filter(|m| m.kind() == MetricKind::Counter)
            .map(|m| &m.id)
            .collect()
    }

    fn merge(&self, existing: &MetricMap) -> StorageResult<Vec<Metric>> {
        self.incoming
            .iter()
            .map(|metric| {
                let mut next = metric.clone();
                if metric.kind() == MetricKind::Counter {
                    if let Some(stored) = existing.get(&metric.id).and_then(|m| m.delta) {
                        next.delta = Some(add_delta(&metric.id, stored, metric.delta)?);
                    }
                }
                Ok(next)
            })
            .collect()
    }
}

impl Operation for Accumulate {
    fn apply<'t>(&'t self, tx: &'t mut dyn Transaction) -> BoxFuture<'t, StorageResult<Vec<Metric>>> {
        async move {
            let filter = self.counter_filter();
            // An empty filter would mean "everything"
            let existing = if filter.is_empty() { MetricMap::new() } else { tx.find(&filter).await? };
            let merged = self.merge(&existing)?;
            tx.save(&merged).await?;
            Ok(merged)
        }
        .boxed()
    }
}

fn add_delta(id: &MetricId, current: i64, incoming: Option<i64>) -> StorageResult<i64> {
    current
        .checked_add(incoming.unwrap_or(0))
        .ok_or_else(|| StorageError::CounterOverflow { name: id.name.to_string() })
}

/// Collapse repeated ids within one request: counters sum, gauges keep the
/// last value. First-occurrence order is preserved.
fn merge_duplicates(metrics: Vec<Metric>) -> StorageResult<Vec<Metric>> {
    let mut merged: Vec<Metric> = Vec::with_capacity(metrics.len());
    let mut positions: HashMap<MetricId, usize> = HashMap::with_capacity(metrics.len());

    for metric in metrics {
        match positions.get(&metric.id) {
            Some(&index) => {
                let slot = &mut merged[index];
                match metric.kind() {
                    MetricKind::Counter => {
                        slot.delta = Some(add_delta(&metric.id, slot.delta.unwrap_or(0), metric.delta)?);
                    }
                    MetricKind::Gauge => slot.value = metric.value,
                }
            }
            None => {
                positions.insert(metric.id.clone(), merged.len());
                merged.push(metric);
            }
        }
    }
    Ok(merged)
}

// ============================================================================
// UPDATE ENGINE
// ============================================================================

pub struct UpdateEngine {
    storage: Arc<dyn Storage>,
    uow: Arc<dyn UnitOfWork>,
    updated: Arc<Notify>,
    span: Span,
}

impl Debug for UpdateEngine {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateEngine").field("backend", &self.storage.kind()).finish()
    }
}

impl UpdateEngine {
    pub fn new(storage: Arc<dyn Storage>, uow: Arc<dyn UnitOfWork>, span: Span) -> Self {
        Self { storage, uow, updated: Arc::new(Notify::new()), span }
    }

    pub fn from_backend(backend: &Backend, span: Span) -> Self {
        Self::new(backend.storage.clone(), backend.uow.clone(), span)
    }

    /// Signalled after every successful update
    pub fn update_notifier(&self) -> Arc<Notify> {
        self.updated.clone()
    }

    /// Validate every payload, then accumulate and persist them as one unit
    /// of work. Returns the stored state after accumulation.
    pub async fn update(&self, payloads: Vec<MetricPayload>) -> EngineResult<Vec<Metric>> {
        let metrics = validation::validate_all(payloads)?;
        self.apply(metrics).instrument(self.span.clone()).await
    }

    pub async fn update_one(&self, payload: MetricPayload) -> EngineResult<Metric> {
        self.update(vec![payload])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StorageError::Corrupt { message: "update returned no metric".into() }.into())
    }

    /// Feed already-typed metrics (restored from a snapshot) through the same
    /// accumulate path. Entries whose name would be rejected by `update` are
    /// skipped with a warning.
    pub async fn restore(&self, metrics: Vec<Metric>) -> EngineResult<Vec<Metric>> {
        let accepted: Vec<Metric> = metrics
            .into_iter()
            .filter(|metric| match validation::validate_name(&metric.id.name) {
                Ok(()) => true,
                Err(e) => {
                    warn!(
                        target: "relay::engine",
                        parent: &self.span,
                        name = %metric.id.name,
                        kind = %metric.kind(),
                        error = %e,
                        "Skipping restored metric with invalid name"
                    );
                    false
                }
            })
            .collect();
        self.apply(accepted).instrument(self.span.clone()).await
    }

    async fn apply(&self, metrics: Vec<Metric>) -> EngineResult<Vec<Metric>> {
        if metrics.is_empty() {
            return Ok(Vec::new());
        }
        let received = metrics.len();
        let incoming = merge_duplicates(metrics)?;
        let keys: Vec<MetricId> = incoming.iter().map(|m| m.id.clone()).collect();

        let saved = self.uow.execute(&keys, &Accumulate { incoming }).await?;
        self.updated.notify_one();

        debug!(target: "relay::engine", received, stored = saved.len(), "Metrics updated");
        Ok(saved)
    }

    pub async fn get(&self, kind: MetricKind, name: &str) -> EngineResult<Metric> {
        let id = MetricId::new(name, kind);
        let filter: MetricFilter = [id.clone()].into_iter().collect();
        let mut found = self.storage.find(&filter).instrument(self.span.clone()).await?;
        found.remove(&id).ok_or_else(|| EngineError::not_found(kind, name))
    }

    /// All metrics ordered by name, then kind
    pub async fn list(&self) -> EngineResult<Vec<Metric>> {
        let all = self.storage.find(&MetricFilter::all()).instrument(self.span.clone()).await?;
        let mut metrics: Vec<Metric> = all.into_values().collect();
        metrics.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(metrics)
    }

    pub async fn ping(&self) -> EngineResult<()> {
        Ok(self.storage.ping().await?)
    }
}
