//! Durable item state
//!
//! The store maps item ids to their [`ItemRecord`] and is the only shared
//! mutable resource of a migration. Every write goes through
//! [`StateStore::commit`], a compare-and-swap on the stored stage, so several
//! coordinators (in one process or many) can work against the same store.

pub mod file;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

use crate::pipeline::retry::deadline_after;
use crate::pipeline::{InvalidItemId, ItemId, ItemRecord, Stage};

pub use file::FileStateStore;
pub use memory::MemoryStateStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt record at {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error(transparent)]
    InvalidId(#[from] InvalidItemId),

    #[error("record {record} cannot be committed under id {target}")]
    IdMismatch { target: ItemId, record: ItemId },

    #[error("store worker failed: {0}")]
    Worker(String),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result of a compare-and-swap commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// The stored stage no longer matched; `current` is what the store holds
    Conflict { current: Option<Stage> },
}

impl CommitOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, CommitOutcome::Committed)
    }
}

/// Identity of a lease holder: `hostname:pid:uuid`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseOwner(String);

impl LeaseOwner {
    pub fn generate() -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown-host".to_string());
        Self(format!("{}:{}:{}", host, std::process::id(), Uuid::new_v4()))
    }

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LeaseOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Short-lived exclusivity marker for one item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub item_id: ItemId,
    pub owner: LeaseOwner,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(item_id: ItemId, owner: LeaseOwner, ttl: std::time::Duration, now: DateTime<Utc>) -> Self {
        Self {
            item_id,
            owner,
            acquired_at: now,
            expires_at: deadline_after(now, ttl),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Current record for `id`
    async fn load(&self, id: &ItemId) -> Result<Option<ItemRecord>, StoreError>;

    /// Records in `stage`, ascending by catalog order, at most `limit` of them
    async fn list(&self, stage: Stage, limit: Option<usize>) -> Result<Vec<ItemRecord>, StoreError>;

    /// Every record in catalog order
    async fn list_all(&self) -> Result<Vec<ItemRecord>, StoreError>;

    /// Store `record` only if no record with its id exists yet.
    /// Returns whether the record was created.
    async fn insert(&self, record: &ItemRecord) -> Result<bool, StoreError>;

    /// Replace the record for `id` with `record` if its stored stage is still `expected`
    async fn commit(
        &self,
        id: &ItemId,
        expected: Stage,
        record: &ItemRecord,
    ) -> Result<CommitOutcome, StoreError>;

    /// Take the lease on `id` unless a live lease held by someone else exists
    async fn acquire_lease(
        &self,
        id: &ItemId,
        owner: &LeaseOwner,
        ttl: std::time::Duration,
    ) -> Result<Option<Lease>, StoreError>;

    /// Drop `lease`. A lease taken over by another owner after expiry is left alone.
    async fn release_lease(&self, lease: &Lease) -> Result<(), StoreError>;
}

/// Catalog ordering shared by every backend
pub(crate) fn sort_catalog(records: &mut [ItemRecord]) {
    records.sort_by(|a, b| a.catalog_key().cmp(&b.catalog_key()));
}

pub(crate) fn ensure_same_id(id: &ItemId, record: &ItemRecord) -> Result<(), StoreError> {
    if &record.id == id {
        Ok(())
    } else {
        Err(StoreError::IdMismatch {
            target: id.clone(),
            record: record.id.clone(),
        })
    }
}
