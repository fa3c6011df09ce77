//! File-backed state store
//!
//! Layout under the store root:
//!
//! ```text
//! store.lock          advisory lock serialising read-compare-write
//! items/<id>.json     one record per item
//! leases/<id>.lease   live dispatch leases
//! ```
//!
//! Every write lands in a hidden `*.tmp` file first, is fsynced and then
//! renamed over its target, so a reader sees either the old record or the new
//! one in full. Temp files left behind by a crash are swept on open.

use async_trait::async_trait;
use chrono::Utc;
use fd_lock::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ensure_same_id, sort_catalog, CommitOutcome, Lease, LeaseOwner, StateStore, StoreError};
use crate::pipeline::{ItemId, ItemRecord, Stage};

const ITEMS_DIR: &str = "items";
const LEASES_DIR: &str = "leases";
const LOCK_FILE: &str = "store.lock";
const RECORD_EXT: &str = "json";
const LEASE_EXT: &str = "lease";
const TMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Clone)]
pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    /// Open (creating if needed) the store rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self { root: root.into() };
        let layout = store.clone();
        run_blocking(move || layout.prepare()).await?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn items_dir(&self) -> PathBuf {
        self.root.join(ITEMS_DIR)
    }

    fn leases_dir(&self) -> PathBuf {
        self.root.join(LEASES_DIR)
    }

    fn record_path(&self, id: &ItemId) -> PathBuf {
        self.items_dir().join(format!("{}.{}", id, RECORD_EXT))
    }

    fn lease_path(&self, id: &ItemId) -> PathBuf {
        self.leases_dir().join(format!("{}.{}", id, LEASE_EXT))
    }

    fn prepare(&self) -> Result<(), StoreError> {
        for dir in [self.root.clone(), self.items_dir(), self.leases_dir()] {
            fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        }
        // writers hold the lock for the whole temp-then-rename, so only crash leftovers are swept
        let swept = self.with_lock(|| Ok(sweep_temp_files(&self.items_dir())? + sweep_temp_files(&self.leases_dir())?))?;
        if swept > 0 {
            info!(root = ?self.root, swept, "Removed temp files left by an interrupted write");
        }
        Ok(())
    }

    /// Run `f` while holding the store-wide exclusive lock
    fn with_lock<T>(&self, f: impl FnOnce() -> Result<T, StoreError>) -> Result<T, StoreError> {
        let path = self.root.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;
        let mut lock = RwLock::new(file);
        let _guard = lock.write().map_err(|e| StoreError::io(&path, e))?;
        f()
    }

    fn read_record(&self, id: &ItemId) -> Result<Option<ItemRecord>, StoreError> {
        let path = self.record_path(id);
        let record: Option<ItemRecord> = read_json(&path)?;
        match record {
            Some(record) if &record.id != id => Err(StoreError::Corrupt {
                path,
                reason: format!("file holds record {}", record.id),
            }),
            other => Ok(other),
        }
    }

    fn read_all(&self) -> Result<Vec<ItemRecord>, StoreError> {
        let dir = self.items_dir();
        let mut records = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| StoreError::io(&dir, e))? {
            let entry = entry.map_err(|e| StoreError::io(&dir, e))?;
            let path = entry.path();
            if !is_visible(&path, RECORD_EXT) {
                continue;
            }
            if let Some(record) = read_json::<ItemRecord>(&path)? {
                records.push(record);
            }
        }
        sort_catalog(&mut records);
        Ok(records)
    }

    fn insert_blocking(&self, record: &ItemRecord) -> Result<bool, StoreError> {
        self.with_lock(|| {
            let path = self.record_path(&record.id);
            if path.exists() {
                return Ok(false);
            }
            write_json_atomic(&path, record)?;
            Ok(true)
        })
    }

    fn commit_blocking(
        &self,
        id: &ItemId,
        expected: Stage,
        record: &ItemRecord,
    ) -> Result<CommitOutcome, StoreError> {
        self.with_lock(|| {
            let current = self.read_record(id)?.map(|r| r.stage);
            if current != Some(expected) {
                return Ok(CommitOutcome::Conflict { current });
            }
            write_json_atomic(&self.record_path(id), record)?;
            Ok(CommitOutcome::Committed)
        })
    }

    fn acquire_blocking(
        &self,
        id: &ItemId,
        owner: &LeaseOwner,
        ttl: std::time::Duration,
    ) -> Result<Option<Lease>, StoreError> {
        self.with_lock(|| {
            let path = self.lease_path(id);
            let now = Utc::now();
            if let Some(existing) = read_json::<Lease>(&path)? {
                if !existing.is_expired(now) {
                    return Ok(None);
                }
                warn!(
                    item_id = %id,
                    previous_owner = %existing.owner,
                    expired_at = %existing.expires_at,
                    "Taking over expired lease"
                );
            }
            let lease = Lease::new(id.clone(), owner.clone(), ttl, now);
            write_json_atomic(&path, &lease)?;
            Ok(Some(lease))
        })
    }

    fn release_blocking(&self, lease: &Lease) -> Result<(), StoreError> {
        self.with_lock(|| {
            let path = self.lease_path(&lease.item_id);
            match read_json::<Lease>(&path)? {
                Some(held) if held.owner == lease.owner => match fs::remove_file(&path) {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(StoreError::io(&path, e)),
                },
                Some(held) => {
                    debug!(item_id = %lease.item_id, holder = %held.owner, "Lease already taken over");
                    Ok(())
                }
                None => Ok(()),
            }
        })
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Worker(e.to_string()))?
}

fn is_visible(path: &Path, ext: &str) -> bool {
    let hidden = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(true);
    !hidden && path.extension().and_then(|e| e.to_str()) == Some(ext)
}

fn sweep_temp_files(dir: &Path) -> Result<usize, StoreError> {
    let mut swept = 0;
    for entry in fs::read_dir(dir).map_err(|e| StoreError::io(dir, e))? {
        let path = entry.map_err(|e| StoreError::io(dir, e))?.path();
        let is_tmp = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.ends_with(TMP_SUFFIX))
            .unwrap_or(false);
        if is_tmp {
            fs::remove_file(&path).map_err(|e| StoreError::io(&path, e))?;
            swept += 1;
        }
    }
    Ok(swept)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| StoreError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

/// Write `value` to `path` via temp file, fsync and rename
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let dir = path
        .parent()
        .ok_or_else(|| StoreError::io(path, std::io::Error::new(ErrorKind::InvalidInput, "no parent directory")))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("record");
    let tmp = dir.join(format!(".{}.{}{}", file_name, Uuid::new_v4().simple(), TMP_SUFFIX));

    let bytes = serde_json::to_vec_pretty(value)?;
    let result = (|| {
        let mut file = File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        File::open(dir)?.sync_all()
    })();

    result.map_err(|e| {
        let _ = fs::remove_file(&tmp);
        StoreError::io(path, e)
    })
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self, id: &ItemId) -> Result<Option<ItemRecord>, StoreError> {
        let store = self.clone();
        let id = id.clone();
        run_blocking(move || store.read_record(&id)).await
    }

    async fn list(&self, stage: Stage, limit: Option<usize>) -> Result<Vec<ItemRecord>, StoreError> {
        let mut records = self.list_all().await?;
        records.retain(|r| r.stage == stage);
        if let Some(limit) = limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    async fn list_all(&self) -> Result<Vec<ItemRecord>, StoreError> {
        let store = self.clone();
        run_blocking(move || store.read_all()).await
    }

    async fn insert(&self, record: &ItemRecord) -> Result<bool, StoreError> {
        let store = self.clone();
        let record = record.clone();
        run_blocking(move || store.insert_blocking(&record)).await
    }

    async fn commit(
        &self,
        id: &ItemId,
        expected: Stage,
        record: &ItemRecord,
    ) -> Result<CommitOutcome, StoreError> {
        ensure_same_id(id, record)?;
        let store = self.clone();
        let id = id.clone();
        let record = record.clone();
        run_blocking(move || store.commit_blocking(&id, expected, &record)).await
    }

    async fn acquire_lease(
        &self,
        id: &ItemId,
        owner: &LeaseOwner,
        ttl: std::time::Duration,
    ) -> Result<Option<Lease>, StoreError> {
        let store = self.clone();
        let id = id.clone();
        let owner = owner.clone();
        run_blocking(move || store.acquire_blocking(&id, &owner, ttl)).await
    }

    async fn release_lease(&self, lease: &Lease) -> Result<(), StoreError> {
        let store = self.clone();
        let lease = lease.clone();
        run_blocking(move || store.release_blocking(&lease)).await
    }
}
