//! Storage backends and the unit-of-work contract shared by all of them.
//!
//! Exactly one backend serves a process. [`open_backend`] picks it once at
//! startup from configuration (database DSN, then file path, then memory) and
//! hands back trait objects, so nothing downstream branches on the backend.

use std::fmt::{self, Debug, Display, Formatter};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::info;

use crate::error::StorageResult;
use crate::model::{Metric, MetricFilter, MetricId, MetricMap};

pub mod file;
pub mod memory;
pub mod postgres;

pub use file::{FileStorage, FileUnitOfWork};
pub use memory::{MemoryStorage, MemoryUnitOfWork};
pub use postgres::{PgStorage, PgUnitOfWork};

// ============================================================================
// STORAGE TRAIT
// ============================================================================

/// Which backend is serving
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Memory,
    File,
    Postgres,
}

impl Display for BackendKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Memory => write!(f, "memory"),
            BackendKind::File => write!(f, "file"),
            BackendKind::Postgres => write!(f, "postgres"),
        }
    }
}

/// Persistence capability set.
///
/// `save` overwrites whatever is stored under each metric's id; accumulation
/// happens above this layer. `find` with an empty filter returns everything.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Storage: Send + Sync {
    async fn save(&self, metrics: &[Metric]) -> StorageResult<()>;

    async fn find(&self, filter: &MetricFilter) -> StorageResult<MetricMap>;

    /// Health check backing `GET /ping`
    async fn ping(&self) -> StorageResult<()>;

    fn kind(&self) -> BackendKind;
}

// ============================================================================
// UNIT OF WORK
// ============================================================================

/// Handle an [`Operation`] reads and writes through while its unit of work
/// is open.
#[async_trait]
pub trait Transaction: Send {
    async fn find(&mut self, filter: &MetricFilter) -> StorageResult<MetricMap>;

    async fn save(&mut self, metrics: &[Metric]) -> StorageResult<()>;
}

/// A read-then-write sequence executed inside a unit of work.
///
/// May run more than once when the unit of work retries.
pub trait Operation: Send + Sync {
    fn apply<'t>(&'t self, tx: &'t mut dyn Transaction) -> BoxFuture<'t, StorageResult<Vec<Metric>>>;
}

/// Runs an [`Operation`] atomically with respect to other writers of the
/// same keys.
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    async fn execute(&self, keys: &[MetricId], op: &dyn Operation) -> StorageResult<Vec<Metric>>;
}

/// Transaction handle for backends whose unit of work is a lock: calls go
/// straight to the storage while the lock is held.
pub(crate) struct Direct<'a>(pub(crate) &'a dyn Storage);

#[async_trait]
impl Transaction for Direct<'_> {
    async fn find(&mut self, filter: &MetricFilter) -> StorageResult<MetricMap> {
        self.0.find(filter).await
    }

    async fn save(&mut self, metrics: &[Metric]) -> StorageResult<()> {
        self.0.save(metrics).await
    }
}

// ============================================================================
// BACKEND FACTORY
// ============================================================================

/// Backend selection inputs
#[derive(Debug, Clone, Default)]
pub struct StorageConfig {
    pub database_dsn: Option<String>,
    pub file_path: Option<PathBuf>,
}

/// File the snapshot worker maintains
#[derive(Debug, Clone)]
pub struct SnapshotTarget {
    pub file: Arc<FileStorage>,
    /// The file is the serving store itself (File backend)
    pub is_serving_store: bool,
}

/// Selected backend, ready to inject into the update engine
pub struct Backend {
    pub storage: Arc<dyn Storage>,
    pub uow: Arc<dyn UnitOfWork>,
    pub snapshot: Option<SnapshotTarget>,
}

impl Debug for Backend {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("kind", &self.storage.kind())
            .field("snapshot", &self.snapshot)
            .finish()
    }
}

impl Backend {
    pub fn memory() -> Self {
        let storage = Arc::new(MemoryStorage::new());
        Self {
            uow: Arc::new(MemoryUnitOfWork::new(storage.clone())),
            storage,
            snapshot: None,
        }
    }

    pub fn file(file: Arc<FileStorage>) -> Self {
        Self {
            uow: Arc::new(FileUnitOfWork::new(file.clone())),
            snapshot: Some(SnapshotTarget { file: file.clone(), is_serving_store: true }),
            storage: file,
        }
    }
}

/// Open the configured backend: DSN, then file, then memory.
pub async fn open_backend(config: &StorageConfig) -> StorageResult<Backend> {
    let dsn = config.database_dsn.as_deref().filter(|dsn| !dsn.is_empty());
    let file_path = config.file_path.as_ref().filter(|path| !path.as_os_str().is_empty());

    let backend = if let Some(dsn) = dsn {
        let storage = Arc::new(PgStorage::connect(dsn).await?);
        let snapshot = match file_path {
            Some(path) => Some(SnapshotTarget {
                file: Arc::new(FileStorage::open(path)?),
                is_serving_store: false,
            }),
            None => None,
        };
        Backend {
            uow: Arc::new(PgUnitOfWork::new(storage.pool().clone())),
            storage,
            snapshot,
        }
    } else if let Some(path) = file_path {
        Backend::file(Arc::new(FileStorage::open(path)?))
    } else {
        Backend::memory()
    };

    info!(
        target: "relay::storage",
        backend = %backend.storage.kind(),
        snapshot = ?backend.snapshot.as_ref().map(|s| s.file.path().display().to_string()),
        "Storage backend opened"
    );

    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_factory_falls_back_to_memory() {
        let backend = open_backend(&StorageConfig::default()).await.unwrap();
        assert_eq!(backend.storage.kind(), BackendKind::Memory);
        assert!(backend.snapshot.is_none());

        let backend = open_backend(&StorageConfig {
            database_dsn: Some(String::new()),
            file_path: Some(PathBuf::new()),
        })
        .await
        .unwrap();
        assert_eq!(backend.storage.kind(), BackendKind::Memory);
    }

    #[tokio::test]
    async fn test_factory_picks_file_when_path_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("metrics.json");
        let backend = open_backend(&StorageConfig { database_dsn: None, file_path: Some(path.clone()) })
            .await
            .unwrap();

        assert_eq!(backend.storage.kind(), BackendKind::File);
        let snapshot = backend.snapshot.unwrap();
        assert!(snapshot.is_serving_store);
        assert_eq!(snapshot.file.path(), path.as_path());
        assert!(path.exists());
    }
}
