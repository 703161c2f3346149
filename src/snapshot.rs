//! Snapshot worker: restore at startup, periodic and final dumps of the live
//! metric set to the snapshot file.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Instrument, Span};

use crate::engine::UpdateEngine;
use crate::error::EngineResult;
use crate::model::{Metric, MetricFilter};
use crate::storage::{SnapshotTarget, Storage};

#[derive(Debug)]
pub struct SnapshotWorker {
    engine: Arc<UpdateEngine>,
    target: SnapshotTarget,
    /// Zero: snapshot after every successful update
    interval: Duration,
    restore: bool,
    span: Span,
}

impl SnapshotWorker {
    pub fn new(engine: Arc<UpdateEngine>, target: SnapshotTarget, interval: Duration, restore: bool, span: Span) -> Self {
        Self { engine, target, interval, restore, span }
    }

    /// Load the snapshot file through the update engine. Returns how many
    /// metrics were stored; zero when restore is off or the file already is
    /// the serving store.
    pub async fn restore(&self) -> EngineResult<usize> {
        if !self.restore {
            return Ok(0);
        }
        if self.target.is_serving_store {
            debug!(target: "relay::snapshot", parent: &self.span, "Snapshot file is the serving store, nothing to restore");
            return Ok(0);
        }

        let restored: Vec<Metric> = self.target.file.find(&MetricFilter::all()).await?.into_values().collect();
        let count = self.engine.restore(restored).await?.len();

        info!(
            target: "relay::snapshot",
            parent: &self.span,
            count,
            path = %self.target.file.path().display(),
            "Restored metrics from snapshot"
        );
        Ok(count)
    }

    /// Dump the live set over the snapshot file (truncate, rewrite, fsync).
    pub async fn save(&self) -> EngineResult<usize> {
        // Holding the file lock keeps writers of a file-backed store out
        // between the read and the rewrite.
        let _lock = self.target.file.lock().await?;
        let live = self.engine.list().await?;
        self.target.file.rewrite(&live)?;

        debug!(target: "relay::snapshot", parent: &self.span, count = live.len(), "Snapshot written");
        Ok(live.len())
    }

    /// Snapshot on every trigger until cancelled, then once more.
    pub async fn run(self, token: CancellationToken) -> EngineResult<()> {
        let span = self.span.clone();
        async move {
            let updated = self.engine.update_notifier();
            let mut ticker = (!self.interval.is_zero()).then(|| {
                let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker
            });

            info!(
                target: "relay::snapshot",
                interval_secs = self.interval.as_secs(),
                path = %self.target.file.path().display(),
                "Snapshot worker started"
            );

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = next_trigger(&mut ticker, &updated) => {
                        if let Err(e) = self.save().await {
                            error!(target: "relay::snapshot", error = %e, "Periodic snapshot failed");
                        }
                    }
                }
            }

            let count = self.save().await?;
            info!(target: "relay::snapshot", count, "Final snapshot written");
            Ok(())
        }
        .instrument(span)
        .await
    }
}

async fn next_trigger(ticker: &mut Option<Interval>, updated: &Notify) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => updated.notified().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    use crate::model::{MetricId, MetricPayload};
    use crate::storage::{Backend, FileStorage};

    fn snapshot_lines(path: &std::path::Path) -> Vec<Metric> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_restore_accumulate_snapshot_with_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        fs::write(&path, "{\"id\":\"x\",\"type\":\"counter\",\"delta\":5}\n").unwrap();

        let backend = Backend::file(Arc::new(FileStorage::open(&path).unwrap()));
        let engine = Arc::new(UpdateEngine::from_backend(&backend, Span::none()));
        let worker =
            SnapshotWorker::new(engine.clone(), backend.snapshot.clone().unwrap(), Duration::from_secs(300), true, Span::none());

        assert_eq!(worker.restore().await.unwrap(), 0);
        engine.update(vec![MetricPayload::counter("x", 2)]).await.unwrap();
        worker.save().await.unwrap();

        assert_eq!(snapshot_lines(&path), vec![Metric::counter("x", 7)]);
    }

    #[tokio::test]
    async fn test_restore_feeds_separate_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        fs::write(&path, "{\"id\":\"x\",\"type\":\"counter\",\"delta\":5}\n{\"id\":\"t\",\"type\":\"gauge\",\"value\":1.5}\n")
            .unwrap();

        let backend = Backend::memory();
        let target = SnapshotTarget { file: Arc::new(FileStorage::open(&path).unwrap()), is_serving_store: false };
        let engine = Arc::new(UpdateEngine::from_backend(&backend, Span::none()));
        let worker = SnapshotWorker::new(engine.clone(), target, Duration::from_secs(300), true, Span::none());

        assert_eq!(worker.restore().await.unwrap(), 2);
        engine.update(vec![MetricPayload::counter("x", 2)]).await.unwrap();
        worker.save().await.unwrap();

        assert_eq!(snapshot_lines(&path), vec![Metric::gauge("t", 1.5), Metric::counter("x", 7)]);
    }

    #[tokio::test]
    async fn test_restore_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        fs::write(&path, "{\"id\":\"x\",\"type\":\"counter\",\"delta\":5}\n").unwrap();

        let backend = Backend::memory();
        let target = SnapshotTarget { file: Arc::new(FileStorage::open(&path).unwrap()), is_serving_store: false };
        let engine = Arc::new(UpdateEngine::from_backend(&backend, Span::none()));
        let worker = SnapshotWorker::new(engine.clone(), target, Duration::from_secs(300), false, Span::none());

        assert_eq!(worker.restore().await.unwrap(), 0);
        assert!(engine.list().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_and_final_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        let backend = Backend::memory();
        let target = SnapshotTarget { file: Arc::new(FileStorage::open(&path).unwrap()), is_serving_store: false };
        let engine = Arc::new(UpdateEngine::from_backend(&backend, Span::none()));
        let token = CancellationToken::new();

        let worker = SnapshotWorker::new(engine.clone(), target, Duration::from_secs(10), false, Span::none());
        let handle = tokio::spawn(worker.run(token.clone()));

        engine.update(vec![MetricPayload::gauge("g", 1.0)]).await.unwrap();
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(snapshot_lines(&path), vec![Metric::gauge("g", 1.0)]);

        engine.update(vec![MetricPayload::counter("c", 3)]).await.unwrap();
        token.cancel();
        handle.await.unwrap().unwrap();

        let lines = snapshot_lines(&path);
        assert_eq!(lines.len(), 2);
        assert!(lines.contains(&Metric::counter("c", 3)));
    }

    #[tokio::test]
    async fn test_zero_interval_snapshots_after_each_update() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        let backend = Backend::memory();
        let target = SnapshotTarget { file: Arc::new(FileStorage::open(&path).unwrap()), is_serving_store: false };
        let engine = Arc::new(UpdateEngine::from_backend(&backend, Span::none()));
        let token = CancellationToken::new();

        let handle = tokio::spawn(
            SnapshotWorker::new(engine.clone(), target, Duration::ZERO, false, Span::none()).run(token.clone()),
        );

        engine.update(vec![MetricPayload::counter("c", 4)]).await.unwrap();
        let mut written = false;
        for _ in 0..200 {
            if snapshot_lines(&path).first().map(|m| &m.id) == Some(&MetricId::counter("c")) {
                written = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(written, "snapshot was not written after update");

        token.cancel();
        handle.await.unwrap().unwrap();
    }
}
