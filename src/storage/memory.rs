//! In-process map backend.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::Mutex as AsyncMutex;

use super::{BackendKind, Direct, Operation, Storage, UnitOfWork};
use crate::error::StorageResult;
use crate::model::{Metric, MetricFilter, MetricId, MetricMap};

/// Metrics keyed by id behind a reader-writer lock
#[derive(Debug, Default)]
pub struct MemoryStorage {
    metrics: RwLock<HashMap<MetricId, Metric>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.metrics.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.read().is_empty()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn save(&self, metrics: &[Metric]) -> StorageResult<()> {
        let mut stored = self.metrics.write();
        for metric in metrics {
            stored.insert(metric.id.clone(), metric.clone());
        }
        Ok(())
    }

    async fn find(&self, filter: &MetricFilter) -> StorageResult<MetricMap> {
        let stored = self.metrics.read();
        if filter.is_all() {
            return Ok(stored.clone());
        }
        Ok(filter
            .ids()
            .filter_map(|id| stored.get(id).map(|m| (id.clone(), m.clone())))
            .collect())
    }

    async fn ping(&self) -> StorageResult<()> {
        Ok(())
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }
}

// ============================================================================
// PER-KEY UNIT OF WORK
// ============================================================================

/// Serializes operations touching the same ids with one async mutex per id.
/// Keys are locked in sorted order so overlapping batches cannot deadlock.
#[derive(Debug)]
pub struct MemoryUnitOfWork {
    storage: Arc<MemoryStorage>,
    locks: DashMap<MetricId, Arc<AsyncMutex<()>>>,
}

impl MemoryUnitOfWork {
    pub fn new(storage: Arc<MemoryStorage>) -> Self {
        Self { storage, locks: DashMap::new() }
    }

    fn key_lock(&self, id: &MetricId) -> Arc<AsyncMutex<()>> {
        self.locks.entry(id.clone()).or_default().clone()
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn execute(&self, keys: &[MetricId], op: &dyn Operation) -> StorageResult<Vec<Metric>> {
        let mut ordered: Vec<&MetricId> = keys.iter().collect();
        ordered.sort();
        ordered.dedup();

        let mut guards = Vec::with_capacity(ordered.len());
        for id in ordered {
            guards.push(self.key_lock(id).lock_owned().await);
        }

        let mut tx = Direct(self.storage.as_ref());
        op.apply(&mut tx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use futures::FutureExt;

    use crate::storage::Transaction;

    #[tokio::test]
    async fn test_round_trip() {
        let storage = MemoryStorage::new();
        let metric = Metric::gauge("temp", 21.5);
        storage.save(&[metric.clone()]).await.unwrap();

        let filter: MetricFilter = [metric.id.clone()].into_iter().collect();
        let found = storage.find(&filter).await.unwrap();
        assert_eq!(found.get(&metric.id), Some(&metric));
    }

    #[tokio::test]
    async fn test_find_all_returns_distinct_ids() {
        let storage = MemoryStorage::new();
        storage.save(&[Metric::counter("a", 1), Metric::gauge("a", 1.0)]).await.unwrap();
        storage.save(&[Metric::counter("a", 5), Metric::gauge("b", 2.0)]).await.unwrap();

        let all = storage.find(&MetricFilter::all()).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[&MetricId::counter("a")].delta, Some(5));
    }

    #[tokio::test]
    async fn test_find_skips_unknown_ids() {
        let storage = MemoryStorage::new();
        storage.save(&[Metric::counter("a", 1)]).await.unwrap();
        let filter: MetricFilter = [MetricId::counter("missing")].into_iter().collect();
        assert!(storage.find(&filter).await.unwrap().is_empty());
    }

    /// Reads the counter, yields, then writes it back incremented.
    struct SlowIncrement(MetricId);

    impl Operation for SlowIncrement {
        fn apply<'t>(&'t self, tx: &'t mut dyn Transaction) -> BoxFuture<'t, StorageResult<Vec<Metric>>> {
            async move {
                let filter: MetricFilter = [self.0.clone()].into_iter().collect();
                let current = tx.find(&filter).await?.get(&self.0).and_then(|m| m.delta).unwrap_or(0);
                tokio::task::yield_now().await;
                let next = Metric::counter(self.0.name.clone(), current + 1);
                tx.save(&[next.clone()]).await?;
                Ok(vec![next])
            }
            .boxed()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_per_key_lock_prevents_lost_increments() {
        let storage = Arc::new(MemoryStorage::new());
        let uow = Arc::new(MemoryUnitOfWork::new(storage.clone()));
        let id = MetricId::counter("hits");

        let mut tasks = Vec::new();
        for _ in 0..50 {
            let uow = uow.clone();
            let id = id.clone();
            tasks.push(tokio::spawn(async move {
                uow.execute(&[id.clone()], &SlowIncrement(id)).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let found = storage.find(&MetricFilter::all()).await.unwrap();
        assert_eq!(found[&id].delta, Some(50));
    }
}
