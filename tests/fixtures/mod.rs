//! Shared items, executors and store wrappers for coordinator integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{Barrier, Notify};

use yard_migrator::{
    CommitOutcome, CoordinatorConfig, FailureKind, ItemId, ItemRecord, Lease, LeaseOwner,
    MemoryStateStore, RetryConfig, RetryPolicy, Stage, StageExecutor, StageFailure, StageOutput,
    StateStore, Step, StepTable, StoreError,
};

pub fn catalog_date(offset_days: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2008, 3, 1, 0, 0, 0).unwrap() + ChronoDuration::days(offset_days)
}

pub fn item(id: &str, offset_days: i64) -> ItemRecord {
    let date = catalog_date(offset_days);
    let mut record = ItemRecord::discovered(ItemId::new(id).unwrap(), format!("Episode {}", id), date, date);
    record.sequence = offset_days.max(0) as u64;
    record
}

/// `count` discovered items `ep-000`, `ep-001`, ... one day apart
pub fn items(count: usize) -> Vec<ItemRecord> {
    (0..count).map(|i| item(&format!("ep-{:03}", i), i as i64)).collect()
}

pub fn id(value: &str) -> ItemId {
    ItemId::new(value).unwrap()
}

/// Default ceilings, no backoff delay and no jitter
pub fn fast_policy() -> RetryPolicy {
    RetryPolicy::new(RetryConfig {
        base_delay_secs: 0,
        jitter: false,
        ..RetryConfig::default()
    })
}

pub fn wide_config(concurrency: usize) -> CoordinatorConfig {
    CoordinatorConfig {
        concurrency: StepTable::from_fn(|_| concurrency),
        shutdown_grace_secs: 5,
        ..CoordinatorConfig::default()
    }
}

/// Succeeds after `delay` and records every overlapping execution of one item
#[derive(Default)]
pub struct OverlapRecorder {
    delay: Duration,
    in_flight: Mutex<HashSet<ItemId>>,
    overlaps: AtomicUsize,
    running: AtomicUsize,
    max_running: AtomicUsize,
    calls: Mutex<HashMap<(Step, ItemId), usize>>,
}

impl OverlapRecorder {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    pub fn calls(&self, step: Step, item: &ItemId) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(&(step, item.clone()))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl StageExecutor for OverlapRecorder {
    async fn execute(&self, step: Step, record: &ItemRecord) -> Result<StageOutput, StageFailure> {
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            if !in_flight.insert(record.id.clone()) {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            *self.calls.lock().unwrap().entry((step, record.id.clone())).or_insert(0) += 1;
        }
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;

        self.running.fetch_sub(1, Ordering::SeqCst);
        self.in_flight.lock().unwrap().remove(&record.id);
        Ok(success_for(step, record))
    }
}

/// Output that lets every following step run straight away
pub fn success_for(step: Step, record: &ItemRecord) -> StageOutput {
    let output = StageOutput::new(format!("{}/{}", step, record.id));
    match step {
        Step::Schedule => output.scheduled_for(record.catalog_date),
        _ => output,
    }
}

/// Fails every call with the same kind
pub struct AlwaysFail {
    kind: FailureKind,
    calls: AtomicUsize,
}

impl AlwaysFail {
    pub fn new(kind: FailureKind) -> Self {
        Self {
            kind,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageExecutor for AlwaysFail {
    async fn execute(&self, step: Step, record: &ItemRecord) -> Result<StageOutput, StageFailure> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Err(StageFailure::new(
            self.kind,
            format!("{} of {} failed (call {})", step, record.id, call),
        ))
    }
}

/// Per-item scripted outcomes; success once an item's script runs out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeed,
    Fail(FailureKind),
}

#[derive(Default)]
pub struct Scripted {
    scripts: Mutex<HashMap<ItemId, VecDeque<Outcome>>>,
    calls: AtomicUsize,
}

impl Scripted {
    pub fn new(scripts: impl IntoIterator<Item = (ItemId, Vec<Outcome>)>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into_iter().map(|(id, s)| (id, s.into())).collect()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageExecutor for Scripted {
    async fn execute(&self, step: Step, record: &ItemRecord) -> Result<StageOutput, StageFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&record.id)
            .and_then(|script| script.pop_front())
            .unwrap_or(Outcome::Succeed);

        tokio::task::yield_now().await;
        match next {
            Outcome::Succeed => Ok(success_for(step, record)),
            Outcome::Fail(kind) => Err(StageFailure::new(kind, format!("scripted {} failure", step))),
        }
    }
}

/// Succeeds only once `parties` executions are running at the same time
pub struct Rendezvous {
    barrier: Barrier,
}

impl Rendezvous {
    pub fn new(parties: usize) -> Self {
        Self {
            barrier: Barrier::new(parties),
        }
    }
}

#[async_trait]
impl StageExecutor for Rendezvous {
    async fn execute(&self, step: Step, record: &ItemRecord) -> Result<StageOutput, StageFailure> {
        self.barrier.wait().await;
        Ok(success_for(step, record))
    }
}

/// Never finishes on its own; announces each start
#[derive(Default)]
pub struct Stalled {
    pub started: Notify,
    started_count: AtomicUsize,
}

impl Stalled {
    pub fn started_count(&self) -> usize {
        self.started_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageExecutor for Stalled {
    async fn execute(&self, _step: Step, _record: &ItemRecord) -> Result<StageOutput, StageFailure> {
        self.started_count.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();
        std::future::pending().await
    }
}

/// Sleeps for `delay` and then succeeds
pub struct Slow {
    delay: Duration,
}

impl Slow {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl StageExecutor for Slow {
    async fn execute(&self, step: Step, record: &ItemRecord) -> Result<StageOutput, StageFailure> {
        tokio::time::sleep(self.delay).await;
        Ok(success_for(step, record))
    }
}

fn disk_full() -> StoreError {
    StoreError::Io {
        path: "items".into(),
        source: std::io::Error::new(std::io::ErrorKind::Other, "no space left on device"),
    }
}

/// Memory store whose commits start failing after `healthy_commits` successes
pub struct FailingStore {
    inner: MemoryStateStore,
    healthy_commits: AtomicUsize,
}

impl FailingStore {
    pub fn new(inner: MemoryStateStore, healthy_commits: usize) -> Self {
        Self {
            inner,
            healthy_commits: AtomicUsize::new(healthy_commits),
        }
    }
}

#[async_trait]
impl StateStore for FailingStore {
    async fn load(&self, id: &ItemId) -> Result<Option<ItemRecord>, StoreError> {
        self.inner.load(id).await
    }

    async fn list(&self, stage: Stage, limit: Option<usize>) -> Result<Vec<ItemRecord>, StoreError> {
        self.inner.list(stage, limit).await
    }

    async fn list_all(&self) -> Result<Vec<ItemRecord>, StoreError> {
        self.inner.list_all().await
    }

    async fn insert(&self, record: &ItemRecord) -> Result<bool, StoreError> {
        self.inner.insert(record).await
    }

    async fn commit(&self, id: &ItemId, expected: Stage, record: &ItemRecord) -> Result<CommitOutcome, StoreError> {
        let healthy = self
            .healthy_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if !healthy {
            return Err(disk_full());
        }
        self.inner.commit(id, expected, record).await
    }

    async fn acquire_lease(
        &self,
        id: &ItemId,
        owner: &LeaseOwner,
        ttl: Duration,
    ) -> Result<Option<Lease>, StoreError> {
        self.inner.acquire_lease(id, owner, ttl).await
    }

    async fn release_lease(&self, lease: &Lease) -> Result<(), StoreError> {
        self.inner.release_lease(lease).await
    }
}

/// Memory store whose lease call fails outright for one item and is slow for every other
pub struct LeaseFault {
    inner: MemoryStateStore,
    broken: ItemId,
    delay: Duration,
}

impl LeaseFault {
    pub fn new(inner: MemoryStateStore, broken: ItemId, delay: Duration) -> Self {
        Self { inner, broken, delay }
    }
}

#[async_trait]
impl StateStore for LeaseFault {
    async fn load(&self, id: &ItemId) -> Result<Option<ItemRecord>, StoreError> {
        self.inner.load(id).await
    }

    async fn list(&self, stage: Stage, limit: Option<usize>) -> Result<Vec<ItemRecord>, StoreError> {
        self.inner.list(stage, limit).await
    }

    async fn list_all(&self) -> Result<Vec<ItemRecord>, StoreError> {
        self.inner.list_all().await
    }

    async fn insert(&self, record: &ItemRecord) -> Result<bool, StoreError> {
        self.inner.insert(record).await
    }

    async fn commit(&self, id: &ItemId, expected: Stage, record: &ItemRecord) -> Result<CommitOutcome, StoreError> {
        self.inner.commit(id, expected, record).await
    }

    async fn acquire_lease(
        &self,
        id: &ItemId,
        owner: &LeaseOwner,
        ttl: Duration,
    ) -> Result<Option<Lease>, StoreError> {
        if *id == self.broken {
            return Err(disk_full());
        }
        tokio::time::sleep(self.delay).await;
        self.inner.acquire_lease(id, owner, ttl).await
    }

    async fn release_lease(&self, lease: &Lease) -> Result<(), StoreError> {
        self.inner.release_lease(lease).await
    }
}

/// Memory store that grants every lease, as if each one had already expired.
/// Leaves compare-and-swap as the only guard between coordinators.
pub struct LeaselessStore {
    inner: MemoryStateStore,
}

impl LeaselessStore {
    pub fn new(inner: MemoryStateStore) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl StateStore for LeaselessStore {
    async fn load(&self, id: &ItemId) -> Result<Option<ItemRecord>, StoreError> {
        self.inner.load(id).await
    }

    async fn list(&self, stage: Stage, limit: Option<usize>) -> Result<Vec<ItemRecord>, StoreError> {
        self.inner.list(stage, limit).await
    }

    async fn list_all(&self) -> Result<Vec<ItemRecord>, StoreError> {
        self.inner.list_all().await
    }

    async fn insert(&self, record: &ItemRecord) -> Result<bool, StoreError> {
        self.inner.insert(record).await
    }

    async fn commit(&self, id: &ItemId, expected: Stage, record: &ItemRecord) -> Result<CommitOutcome, StoreError> {
        self.inner.commit(id, expected, record).await
    }

    async fn acquire_lease(
        &self,
        id: &ItemId,
        owner: &LeaseOwner,
        ttl: Duration,
    ) -> Result<Option<Lease>, StoreError> {
        Ok(Some(Lease::new(id.clone(), owner.clone(), ttl, Utc::now())))
    }

    async fn release_lease(&self, _lease: &Lease) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Checks that a record's transition log is one connected path through the
/// stage table, starting at `discovered` and ending at its current stage
pub fn assert_valid_history(record: &ItemRecord) {
    let mut path = vec![Stage::Discovered];
    for entry in &record.transitions {
        assert_eq!(
            path.last().copied(),
            Some(entry.from),
            "{}: transition log is not connected",
            record.id
        );
        path.push(entry.to);
    }
    yard_migrator::pipeline::validate_path(&path)
        .unwrap_or_else(|e| panic!("{}: invalid committed path {:?}: {}", record.id, path, e));
    assert_eq!(path.last().copied(), Some(record.stage), "{}: log ends elsewhere", record.id);

    let stamps: Vec<_> = record.transitions.iter().map(|t| t.at).collect();
    assert!(stamps.windows(2).all(|w| w[0] <= w[1]), "{}: timestamps went backwards", record.id);

    for step in Step::ALL {
        if record.artifact(step).is_some() {
            assert!(record.attempts(step) >= 1, "{}: artifact without attempt", record.id);
        }
    }

    if let Some(step) = record.parked {
        assert_eq!(record.stage, step.source_stage(), "{}: parked away from {}", record.id, step);
        assert!(record.retry.is_none(), "{}: parked item still waits on a retry", record.id);
    }
}
