use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{ensure_same_id, sort_catalog, CommitOutcome, Lease, LeaseOwner, StateStore, StoreError};
use crate::pipeline::{ItemId, ItemRecord, Stage};

#[derive(Default)]
struct Inner {
    records: HashMap<ItemId, ItemRecord>,
    leases: HashMap<ItemId, Lease>,
}

/// In-process store over a mutex-guarded map.
///
/// Clones share the same state, which lets tests run several coordinators
/// against one store. Also backs `run --dry-run`.
#[derive(Clone, Default)]
pub struct MemoryStateStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with `records`, overwriting nothing
    pub async fn with_records(records: impl IntoIterator<Item = ItemRecord>) -> Self {
        let store = Self::new();
        {
            let mut inner = store.inner.lock().await;
            for record in records {
                inner.records.entry(record.id.clone()).or_insert(record);
            }
        }
        store
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, id: &ItemId) -> Result<Option<ItemRecord>, StoreError> {
        Ok(self.inner.lock().await.records.get(id).cloned())
    }

    async fn list(&self, stage: Stage, limit: Option<usize>) -> Result<Vec<ItemRecord>, StoreError> {
        let mut records: Vec<ItemRecord> = self
            .inner
            .lock()
            .await
            .records
            .values()
            .filter(|r| r.stage == stage)
            .cloned()
            .collect();
        sort_catalog(&mut records);
        if let Some(limit) = limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    async fn list_all(&self) -> Result<Vec<ItemRecord>, StoreError> {
        let mut records: Vec<ItemRecord> = self.inner.lock().await.records.values().cloned().collect();
        sort_catalog(&mut records);
        Ok(records)
    }

    async fn insert(&self, record: &ItemRecord) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.records.contains_key(&record.id) {
            return Ok(false);
        }
        inner.records.insert(record.id.clone(), record.clone());
        Ok(true)
    }

    async fn commit(
        &self,
        id: &ItemId,
        expected: Stage,
        record: &ItemRecord,
    ) -> Result<CommitOutcome, StoreError> {
        ensure_same_id(id, record)?;
        let mut inner = self.inner.lock().await;
        match inner.records.get(id).map(|r| r.stage) {
            Some(current) if current == expected => {
                inner.records.insert(id.clone(), record.clone());
                Ok(CommitOutcome::Committed)
            }
            current => Ok(CommitOutcome::Conflict { current }),
        }
    }

    async fn acquire_lease(
        &self,
        id: &ItemId,
        owner: &LeaseOwner,
        ttl: std::time::Duration,
    ) -> Result<Option<Lease>, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.leases.get(id) {
            if !existing.is_expired(now) {
                return Ok(None);
            }
        }
        let lease = Lease::new(id.clone(), owner.clone(), ttl, now);
        inner.leases.insert(id.clone(), lease.clone());
        Ok(Some(lease))
    }

    async fn release_lease(&self, lease: &Lease) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner
            .leases
            .get(&lease.item_id)
            .map(|held| held.owner == lease.owner)
            .unwrap_or(false)
        {
            inner.leases.remove(&lease.item_id);
        }
        Ok(())
    }
}
