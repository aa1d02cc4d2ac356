//! File-backed lease store
//!
//! Keeps all tables in one JSON document. Every mutation is a
//! read-modify-write performed under a lock file shared by all processes
//! using the same directory; the document is replaced atomically via a
//! temp file + rename, so a crash leaves either the old or the new tables.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::clock::{Clock, SystemClock};
use super::tables::LeaseTables;
use super::{Assignments, LeaseStore};
use crate::coordinator::state::{Runner, RunnerAddress, ShardId};
use crate::error::{Result, ShardLeaseError};

const DOCUMENT_NAME: &str = "shardlease.json";
const LOCK_NAME: &str = "shardlease.lock";

/// Configuration for the file store
#[derive(Debug, Clone)]
pub struct FileStoreConfig {
    /// Directory holding the document and lock file
    pub dir: PathBuf,
    /// Lease TTL for shard and runner leases
    pub lease_ttl: Duration,
    /// Give up acquiring the lock file after this long
    pub lock_timeout: Duration,
    /// Lock files older than this are considered abandoned
    pub stale_lock_after: Duration,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./shardlease-state"),
            lease_ttl: Duration::from_secs(crate::DEFAULT_LEASE_TTL_SECS),
            lock_timeout: Duration::from_secs(2),
            stale_lock_after: Duration::from_secs(10),
        }
    }
}

/// Lease store persisted as a JSON document on local disk
pub struct FileLeaseStore {
    config: FileStoreConfig,
    document: PathBuf,
    lock_path: PathBuf,
    /// Serialises this process's own writers before they touch the lock file
    local: Mutex<()>,
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
}

impl FileLeaseStore {
    /// Open (creating the directory if needed) with the system clock
    pub async fn open(config: FileStoreConfig) -> Result<Self> {
        Self::open_with_clock(config, Arc::new(SystemClock)).await
    }

    /// Open with an explicit time source
    pub async fn open_with_clock(config: FileStoreConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        tokio::fs::create_dir_all(&config.dir).await.map_err(|e| {
            ShardLeaseError::persistence(format!(
                "Failed to create state dir {}: {}",
                config.dir.display(),
                e
            ))
        })?;

        let ttl = chrono::Duration::from_std(config.lease_ttl).map_err(|e| {
            ShardLeaseError::InvalidConfig {
                reason: format!("lease ttl out of range: {}", e),
            }
        })?;

        Ok(Self {
            document: config.dir.join(DOCUMENT_NAME),
            lock_path: config.dir.join(LOCK_NAME),
            config,
            local: Mutex::new(()),
            clock,
            ttl,
        })
    }

    /// Path of the JSON document
    pub fn document_path(&self) -> &Path {
        &self.document
    }

    async fn read_tables(&self) -> Result<LeaseTables> {
        decode_document(&self.document, tokio::fs::read(&self.document).await)
    }

    /// Read-modify-write under the lock file
    ///
    /// The lock guard moves into the blocking task with the read and the
    /// write, so dropping the returned future never frees the lock while
    /// a write is still in flight.
    async fn update<T, F>(&self, mutate: F) -> Result<T>
    where
        F: FnOnce(&mut LeaseTables, DateTime<Utc>) -> T + Send + 'static,
        T: Send + 'static,
    {
        let _local = self.local.lock().await;
        let lock = self.lock_file().await?;

        let document = self.document.clone();
        let dir = self.config.dir.clone();
        let clock = self.clock.clone();

        tokio::task::spawn_blocking(move || -> Result<T> {
            let _lock = lock;
            let mut tables = decode_document(&document, std::fs::read(&document))?;
            let out = mutate(&mut tables, clock.now());
            write_atomic(&dir, &document, &serde_json::to_vec_pretty(&tables)?)?;
            Ok(out)
        })
        .await
        .map_err(|e| ShardLeaseError::Internal {
            message: format!("Update task failed: {}", e),
        })?
    }

    async fn lock_file(&self) -> Result<LockFile> {
        let deadline = tokio::time::Instant::now() + self.config.lock_timeout;
        let mut delay = Duration::from_millis(2);

        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.lock_path)
            {
                Ok(_) => return Ok(LockFile { path: self.lock_path.clone() }),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if self.lock_is_stale() {
                        warn!("Removing abandoned lock file {}", self.lock_path.display());
                        let _ = std::fs::remove_file(&self.lock_path);
                        continue;
                    }
                }
                Err(e) => {
                    return Err(ShardLeaseError::persistence(format!(
                        "Lock {} failed: {}",
                        self.lock_path.display(),
                        e
                    )))
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(ShardLeaseError::persistence(format!(
                    "Timed out waiting for lock {}",
                    self.lock_path.display()
                )));
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(Duration::from_millis(50));
        }
    }

    fn lock_is_stale(&self) -> bool {
        std::fs::metadata(&self.lock_path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .is_some_and(|age| age > self.config.stale_lock_after)
    }
}

/// Removes the lock file when dropped
struct LockFile {
    path: PathBuf,
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to remove lock file {}: {}", self.path.display(), e);
        }
    }
}

fn decode_document(document: &Path, read: std::io::Result<Vec<u8>>) -> Result<LeaseTables> {
    match read {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(LeaseTables::default()),
        Err(e) => Err(ShardLeaseError::persistence(format!(
            "Read {} failed: {}",
            document.display(),
            e
        ))),
    }
}

fn write_atomic(dir: &Path, document: &Path, bytes: &[u8]) -> Result<()> {
    let persistence = |e: std::io::Error| {
        ShardLeaseError::persistence(format!("Write {} failed: {}", document.display(), e))
    };

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(persistence)?;
    tmp.write_all(bytes).map_err(persistence)?;
    tmp.as_file().sync_all().map_err(persistence)?;
    tmp.persist(document).map_err(|e| persistence(e.error))?;

    debug!("Persisted {} bytes to {}", bytes.len(), document.display());
    Ok(())
}

#[async_trait]
impl LeaseStore for FileLeaseStore {
    async fn get_assignments(&self) -> Result<Assignments> {
        Ok(self.read_tables().await?.assignments)
    }

    async fn save_assignments(&self, entries: &Assignments) -> Result<()> {
        let entries = entries.clone();
        self.update(move |tables, _| tables.save_assignments(&entries)).await
    }

    async fn get_runners(&self) -> Result<BTreeMap<RunnerAddress, Runner>> {
        Ok(self.read_tables().await?.runners())
    }

    async fn save_runners(&self, entries: &[Runner]) -> Result<()> {
        let entries = entries.to_vec();
        self.update(move |tables, _| tables.save_runners(&entries)).await
    }

    async fn remove_runners(&self, addresses: &[RunnerAddress]) -> Result<()> {
        let addresses = addresses.to_vec();
        self.update(move |tables, _| tables.remove_runners(&addresses)).await
    }

    async fn acquire(&self, address: &RunnerAddress, shards: &[ShardId]) -> Result<Vec<ShardId>> {
        let (address, shards, ttl) = (address.clone(), shards.to_vec(), self.ttl);
        self.update(move |tables, now| tables.acquire(&address, &shards, now, ttl)).await
    }

    async fn refresh(&self, address: &RunnerAddress, shards: &[ShardId]) -> Result<Vec<ShardId>> {
        let (address, shards, ttl) = (address.clone(), shards.to_vec(), self.ttl);
        self.update(move |tables, now| tables.refresh(&address, &shards, now, ttl)).await
    }

    async fn release(&self, address: &RunnerAddress, shard: ShardId) -> Result<()> {
        let address = address.clone();
        self.update(move |tables, _| tables.release(&address, shard)).await
    }

    async fn release_all(&self, address: &RunnerAddress) -> Result<()> {
        let address = address.clone();
        self.update(move |tables, _| tables.release_all(&address)).await
    }

    async fn register(&self, runner: &Runner) -> Result<()> {
        let (runner, ttl) = (runner.clone(), self.ttl);
        self.update(move |tables, now| tables.register(&runner, now, ttl)).await
    }

    async fn heartbeat(&self, address: &RunnerAddress) -> Result<bool> {
        let (address, ttl) = (address.clone(), self.ttl);
        self.update(move |tables, now| tables.heartbeat(&address, now, ttl)).await
    }

    async fn runner_expirations(&self) -> Result<BTreeMap<RunnerAddress, DateTime<Utc>>> {
        Ok(self.read_tables().await?.runner_leases)
    }

    async fn lease_owners(&self) -> Result<BTreeMap<ShardId, RunnerAddress>> {
        let now = self.clock.now();
        Ok(self.read_tables().await?.lease_owners(now))
    }
}
