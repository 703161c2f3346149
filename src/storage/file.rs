//! Newline-delimited JSON file backend.
//!
//! `save` appends one line per metric; `find` rescans the whole file, later
//! lines overriding earlier ones for the same id. [`FileStorage::rewrite`]
//! compacts the file to one line per id and is what the snapshot worker
//! calls.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tracing::{debug, warn};

use super::{BackendKind, Direct, Operation, Storage, UnitOfWork};
use crate::error::{StorageError, StorageResult};
use crate::model::{Metric, MetricFilter, MetricId, MetricMap};

// ============================================================================
// FILE STORAGE
// ============================================================================

#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    file: Mutex<File>,
    /// Held for a whole read-modify-write sequence
    sequence: AsyncMutex<()>,
}

impl FileStorage {
    /// Open or create the file, creating parent directories as needed.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().read(true).write(true).create(true).open(&path)?;
        debug!(target: "relay::storage", path = %path.display(), "Opened metrics file");
        Ok(Self { path, file: Mutex::new(file), sequence: AsyncMutex::new(()) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Exclusive lock spanning several calls: in-process mutex plus an
    /// advisory `flock` so other processes sharing the file also wait.
    pub async fn lock(&self) -> StorageResult<FileLock<'_>> {
        let guard = self.sequence.lock().await;
        let advisory = AdvisoryLock::acquire(&self.file, &self.path).await?;
        Ok(FileLock { _advisory: advisory, _guard: guard })
    }

    /// Replace the file content with `metrics`, one line each, then fsync.
    pub fn rewrite(&self, metrics: &[Metric]) -> StorageResult<()> {
        let encoded = encode_lines(metrics)?;
        let mut file = self.file.lock();
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(encoded.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    fn read_all(file: &mut File, path: &Path) -> StorageResult<MetricMap> {
        file.seek(SeekFrom::Start(0))?;
        let mut metrics = MetricMap::new();
        // Raw bytes so a line with invalid UTF-8 is skipped like any other
        for (index, line) in BufReader::new(&mut *file).split(b'\n').enumerate() {
            let line = line?;
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<Metric>(&line) {
                Ok(metric) => {
                    metrics.insert(metric.id.clone(), metric);
                }
                Err(e) => warn!(
                    target: "relay::storage",
                    path = %path.display(),
                    line = index + 1,
                    error = %e,
                    "Skipping malformed metrics line"
                ),
            }
        }
        Ok(metrics)
    }
}

fn encode_lines(metrics: &[Metric]) -> StorageResult<String> {
    let mut encoded = String::new();
    for metric in metrics {
        encoded.push_str(&serde_json::to_string(metric)?);
        encoded.push('\n');
    }
    Ok(encoded)
}

#[async_trait]
impl Storage for FileStorage {
    async fn save(&self, metrics: &[Metric]) -> StorageResult<()> {
        if metrics.is_empty() {
            return Ok(());
        }
        let encoded = encode_lines(metrics)?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::End(0))?;
        file.write_all(encoded.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    async fn find(&self, filter: &MetricFilter) -> StorageResult<MetricMap> {
        let mut file = self.file.lock();
        let mut all = Self::read_all(&mut file, &self.path)?;
        if !filter.is_all() {
            all.retain(|id, _| filter.matches(id));
        }
        Ok(all)
    }

    async fn ping(&self) -> StorageResult<()> {
        self.file.lock().metadata()?;
        Ok(())
    }

    fn kind(&self) -> BackendKind {
        BackendKind::File
    }
}

// ============================================================================
// FILE LOCKS
// ============================================================================

/// Guard returned by [`FileStorage::lock`]
#[derive(Debug)]
pub struct FileLock<'a> {
    _advisory: AdvisoryLock,
    _guard: AsyncMutexGuard<'a, ()>,
}

#[cfg(unix)]
#[derive(Debug)]
struct AdvisoryLock {
    fd: std::os::unix::io::RawFd,
}

#[cfg(unix)]
impl AdvisoryLock {
    /// `flock` blocks while another process holds the file, so it runs on
    /// the blocking pool.
    async fn acquire(file: &Mutex<File>, path: &Path) -> StorageResult<Self> {
        use nix::fcntl::{flock, FlockArg};
        use std::os::unix::io::AsRawFd;

        let fd = file.lock().as_raw_fd();
        let resource = path.display().to_string();
        match tokio::task::spawn_blocking(move || flock(fd, FlockArg::LockExclusive)).await {
            Ok(Ok(())) => Ok(Self { fd }),
            Ok(Err(e)) => Err(StorageError::lock(resource, e.to_string())),
            Err(e) => Err(StorageError::lock(resource, e.to_string())),
        }
    }
}

#[cfg(unix)]
impl Drop for AdvisoryLock {
    fn drop(&mut self) {
        use nix::fcntl::{flock, FlockArg};

        if let Err(e) = flock(self.fd, FlockArg::Unlock) {
            warn!(target: "relay::storage", error = %e, "Failed to release file lock");
        }
    }
}

#[cfg(not(unix))]
#[derive(Debug)]
struct AdvisoryLock;

#[cfg(not(unix))]
impl AdvisoryLock {
    async fn acquire(_file: &Mutex<File>, _path: &Path) -> StorageResult<Self> {
        Ok(Self)
    }
}

// ============================================================================
// WHOLE-FILE UNIT OF WORK
// ============================================================================

#[derive(Debug)]
pub struct FileUnitOfWork {
    file: Arc<FileStorage>,
}

impl FileUnitOfWork {
    pub fn new(file: Arc<FileStorage>) -> Self {
        Self { file }
    }
}

#[async_trait]
impl UnitOfWork for FileUnitOfWork {
    async fn execute(&self, _keys: &[MetricId], op: &dyn Operation) -> StorageResult<Vec<Metric>> {
        let _lock = self.file.lock().await?;
        let mut tx = Direct(self.file.as_ref());
        op.apply(&mut tx).await
    }
}
