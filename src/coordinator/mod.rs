//! Pipeline coordinator
//!
//! Selects eligible items per step, dispatches them to the stage executors
//! under a per-item lease and bounded concurrency, and commits each outcome
//! through the store's compare-and-swap.
//!
//! A dispatched step is committed as one path through the transition table
//! (`discovered -> downloading -> downloaded`, `... -> failed`, ...). The
//! durable stage never rests at an in-flight stage; the lease covers the
//! in-flight period instead. An abandoned dispatch therefore leaves the item
//! in the stage it had before dispatch.

pub mod budget;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::catalog::{in_catalog_order, CatalogError, CatalogSource};
use crate::executors::{StageExecutors, StageFailure, StageOutput};
use crate::pipeline::transitions::{ceiling_reached, timeout_failure};
use crate::pipeline::{
    plan_failure, plan_skip, plan_success, FailureKind, ItemId, ItemRecord, RetryPolicy, Stage,
    Step, StepTable, TransitionError,
};
use crate::store::{sort_catalog, CommitOutcome, Lease, LeaseOwner, StateStore, StoreError};
use crate::telemetry::{create_dispatch_span, generate_correlation_id};

pub use budget::{BudgetConfig, ResourceBudget};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("item {0} not found")]
    NotFound(ItemId),
    #[error("item {0} is leased by another coordinator")]
    Busy(ItemId),
    #[error("item {id} changed concurrently (now {current:?})")]
    Conflict { id: ItemId, current: Option<Stage> },
}

/// Only items dated inside the window are dispatched
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogWindow {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl CatalogWindow {
    pub fn contains(&self, date: DateTime<Utc>) -> bool {
        let day = date.date_naive();
        self.start.map(|s| day >= s).unwrap_or(true) && self.end.map(|e| day <= e).unwrap_or(true)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Parallel executor calls per step
    pub concurrency: StepTable<usize>,
    /// Bound on a single executor call per step
    pub timeout_secs: StepTable<u64>,
    pub poll_interval_secs: u64,
    /// How long in-flight work may finish after a stop before it is abandoned
    pub shutdown_grace_secs: u64,
    /// A run stops instead of sleeping towards a deadline further away than this
    pub max_backoff_wait_secs: u64,
    /// Added to the step timeout to form the lease ttl
    pub lease_margin_secs: u64,
    pub catalog_window: CatalogWindow,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            concurrency: StepTable {
                download: 3,
                convert: 2,
                upload: 1,
                schedule: 1,
                publish: 1,
            },
            timeout_secs: StepTable {
                download: 600,
                convert: 1800,
                upload: 3600,
                schedule: 120,
                publish: 120,
            },
            poll_interval_secs: 5,
            shutdown_grace_secs: 30,
            max_backoff_wait_secs: 3600,
            lease_margin_secs: 60,
            catalog_window: CatalogWindow::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn timeout(&self, step: Step) -> Duration {
        Duration::from_secs(*self.timeout_secs.get(step))
    }

    pub fn lease_ttl(&self, step: Step) -> Duration {
        self.timeout(step) + self.shutdown_grace() + Duration::from_secs(self.lease_margin_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn max_backoff_wait(&self) -> Duration {
        Duration::from_secs(self.max_backoff_wait_secs)
    }
}

/// What one `advance` call did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AdvanceReport {
    /// Items handed to the executor
    pub dispatched: usize,
    /// Committed successes
    pub succeeded: usize,
    /// Committed failures that will be retried
    pub retrying: usize,
    /// Committed moves to `skipped`
    pub skipped: usize,
    /// Gave up at schedule or publish; held for an operator
    pub parked: usize,
    /// Lost compare-and-swap races
    pub conflicts: usize,
    /// Outcomes rejected by the transition table
    pub invalid: usize,
    /// Dropped after a stop without committing
    pub abandoned: usize,
    /// Leased by another coordinator
    pub lease_skipped: usize,
    /// Held back by the daily upload budget
    pub budget_deferred: usize,
}

impl AdvanceReport {
    pub fn made_progress(&self) -> bool {
        self.dispatched > 0 || self.skipped > 0
    }

    pub fn absorb(&mut self, other: &AdvanceReport) {
        self.dispatched += other.dispatched;
        self.succeeded += other.succeeded;
        self.retrying += other.retrying;
        self.skipped += other.skipped;
        self.parked += other.parked;
        self.conflicts += other.conflicts;
        self.invalid += other.invalid;
        self.abandoned += other.abandoned;
        self.lease_skipped += other.lease_skipped;
        self.budget_deferred += other.budget_deferred;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StopReason {
    /// Nothing eligible and nothing waiting on a deadline
    Drained,
    /// A stop was requested
    Stopped,
    /// The earliest pending deadline is beyond the wait horizon
    Deferred { next_deadline: DateTime<Utc> },
}

/// Outcome of `run_to_completion`
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub passes: usize,
    pub stop_reason: StopReason,
    pub steps: StepTable<AdvanceReport>,
    /// Items per stage once the run ended
    pub stages: BTreeMap<Stage, usize>,
}

impl RunSummary {
    pub fn count(&self, stage: Stage) -> usize {
        self.stages.get(&stage).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.stages.values().sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscoverySummary {
    pub listed: usize,
    pub registered: usize,
    pub already_known: usize,
}

/// Cloneable handle that stops a running coordinator
#[derive(Debug, Clone)]
pub struct StopHandle {
    token: CancellationToken,
}

impl StopHandle {
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Aborts the executor task when the dispatch is dropped (timeout or abandon)
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Executor outcome travelling back from a dispatch task
struct Dispatched {
    snapshot: ItemRecord,
    outcome: Result<StageOutput, StageFailure>,
}

pub struct Coordinator {
    store: Arc<dyn StateStore>,
    executors: StageExecutors,
    policy: RetryPolicy,
    config: CoordinatorConfig,
    budget: Arc<ResourceBudget>,
    owner: LeaseOwner,
    cancel: CancellationToken,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn StateStore>,
        executors: StageExecutors,
        policy: RetryPolicy,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            executors,
            policy,
            config,
            budget: Arc::new(ResourceBudget::new(&BudgetConfig::default())),
            owner: LeaseOwner::generate(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_budget(mut self, budget: ResourceBudget) -> Self {
        self.budget = Arc::new(budget);
        self
    }

    /// Stop when `token` is cancelled, e.g. by a signal handler
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn owner(&self) -> &LeaseOwner {
        &self.owner
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            token: self.cancel.clone(),
        }
    }

    /// Stop dispatching; in-flight work finishes within the shutdown grace or is abandoned
    pub fn stop(&self) {
        info!(owner = %self.owner, "Stop requested");
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Register catalog entries as `discovered` records. Known ids are left untouched.
    pub async fn discover(&self, source: &dyn CatalogSource) -> Result<DiscoverySummary, CoordinatorError> {
        let entries = in_catalog_order(source.entries().await?)?;
        let now = Utc::now();
        let mut summary = DiscoverySummary {
            listed: entries.len(),
            ..Default::default()
        };

        // sequences are never reused, so late additions get slots of their own
        let mut next_sequence = self
            .store
            .list_all()
            .await?
            .iter()
            .map(|r| r.sequence.saturating_add(1))
            .max()
            .unwrap_or(0);

        for entry in entries {
            let record = entry.into_record(next_sequence, now);
            if self.store.insert(&record).await? {
                debug!(item_id = %record.id, sequence = record.sequence, "Registered item");
                next_sequence += 1;
                summary.registered += 1;
            } else {
                summary.already_known += 1;
            }
        }

        info!(
            listed = summary.listed,
            registered = summary.registered,
            already_known = summary.already_known,
            "Discovery complete"
        );
        Ok(summary)
    }

    pub async fn status(&self, id: &ItemId) -> Result<Option<ItemRecord>, CoordinatorError> {
        Ok(self.store.load(id).await?)
    }

    /// Operator skip of one item, committed with compare-and-swap
    pub async fn skip(&self, id: &ItemId, reason: &str) -> Result<ItemRecord, CoordinatorError> {
        let ttl = Duration::from_secs(self.config.lease_margin_secs);
        let lease = self
            .store
            .acquire_lease(id, &self.owner, ttl)
            .await?
            .ok_or_else(|| CoordinatorError::Busy(id.clone()))?;

        let result = self.skip_leased(id, reason).await;
        let released = self.store.release_lease(&lease).await;
        let record = result?;
        released?;
        Ok(record)
    }

    async fn skip_leased(&self, id: &ItemId, reason: &str) -> Result<ItemRecord, CoordinatorError> {
        let current = self
            .store
            .load(id)
            .await?
            .ok_or_else(|| CoordinatorError::NotFound(id.clone()))?;
        let next = plan_skip(&current, reason, Utc::now())?;
        match self.store.commit(id, current.stage, &next).await? {
            CommitOutcome::Committed => {
                info!(item_id = %id, from = %current.stage, reason, "Item skipped by operator");
                Ok(next)
            }
            CommitOutcome::Conflict { current } => Err(CoordinatorError::Conflict {
                id: id.clone(),
                current,
            }),
        }
    }

    /// Items eligible for `step` at `now`, in catalog order
    async fn eligible(&self, step: Step, now: DateTime<Utc>) -> Result<Vec<ItemRecord>, StoreError> {
        let mut candidates = self.store.list(step.source_stage(), None).await?;
        if step.can_fail_over() {
            candidates.extend(self.store.list(Stage::Failed, None).await?);
            sort_catalog(&mut candidates);
        }
        candidates.retain(|r| self.config.catalog_window.contains(r.catalog_date) && r.is_eligible_for(step, now));
        Ok(candidates)
    }

    /// Dispatch up to `limit` eligible items for `step` and commit their outcomes
    pub async fn advance(&self, step: Step, limit: usize) -> Result<AdvanceReport, CoordinatorError> {
        self.advance_until(step, limit, &self.cancel).await
    }

    /// `advance` that stops dispatching once `stop` is cancelled
    async fn advance_until(
        &self,
        step: Step,
        limit: usize,
        stop: &CancellationToken,
    ) -> Result<AdvanceReport, CoordinatorError> {
        let mut report = AdvanceReport::default();
        if stop.is_cancelled() || limit == 0 {
            return Ok(report);
        }

        let now = Utc::now();
        let candidates = self.eligible(step, now).await?;
        let mut join_set: JoinSet<Dispatched> = JoinSet::new();
        let mut leases: HashMap<ItemId, Lease> = HashMap::new();
        let mut fatal: Option<CoordinatorError> = None;

        for candidate in candidates {
            if report.dispatched >= limit || stop.is_cancelled() {
                break;
            }
            match self.dispatch(step, candidate, stop, &mut join_set, &mut report).await {
                Ok(Some(lease)) => {
                    leases.insert(lease.item_id.clone(), lease);
                }
                Ok(None) => {}
                Err(e) => {
                    error!(step = %step, error = %e, "Store failure while dispatching; draining in-flight work");
                    fatal = Some(e);
                    break;
                }
            }
        }

        if let Err(e) = self.drain(step, join_set, stop, &mut leases, &mut report).await {
            fatal.get_or_insert(e);
        }

        if report.dispatched > 0 || report.skipped > 0 {
            info!(
                step = %step,
                dispatched = report.dispatched,
                succeeded = report.succeeded,
                retrying = report.retrying,
                skipped = report.skipped,
                parked = report.parked,
                conflicts = report.conflicts,
                abandoned = report.abandoned,
                "Step advanced"
            );
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Lease, re-check and spawn one item. Returns the lease when a task was spawned.
    async fn dispatch(
        &self,
        step: Step,
        candidate: ItemRecord,
        stop: &CancellationToken,
        join_set: &mut JoinSet<Dispatched>,
        report: &mut AdvanceReport,
    ) -> Result<Option<Lease>, CoordinatorError> {
        let id = candidate.id.clone();
        let Some(lease) = self
            .store
            .acquire_lease(&id, &self.owner, self.config.lease_ttl(step))
            .await?
        else {
            debug!(item_id = %id, step = %step, "Item leased elsewhere");
            report.lease_skipped += 1;
            return Ok(None);
        };

        if stop.is_cancelled() {
            self.store.release_lease(&lease).await?;
            return Ok(None);
        }

        match self.prepare_leased(step, &id, report).await {
            Ok(Some(snapshot)) => {
                self.spawn_execution(step, snapshot, join_set);
                report.dispatched += 1;
                Ok(Some(lease))
            }
            other => {
                self.store.release_lease(&lease).await?;
                other.map(|_| None)
            }
        }
    }

    /// Re-read a leased item and decide whether it still needs the executor
    async fn prepare_leased(
        &self,
        step: Step,
        id: &ItemId,
        report: &mut AdvanceReport,
    ) -> Result<Option<ItemRecord>, CoordinatorError> {
        let now = Utc::now();
        let Some(current) = self.store.load(id).await? else {
            return Ok(None);
        };
        if !current.is_eligible_for(step, now) {
            debug!(item_id = %id, step = %step, stage = %current.stage, "Item advanced before dispatch");
            return Ok(None);
        }

        if ceiling_reached(&current, step, &self.policy) {
            let reason = format!("{} attempt ceiling reached", step);
            match plan_skip(&current, &reason, now) {
                Ok(next) => self.commit_outcome(step, &current, next, report).await?,
                Err(e) => {
                    error!(item_id = %id, step = %step, error = %e, "Cannot skip item at its attempt ceiling");
                    report.invalid += 1;
                }
            }
            return Ok(None);
        }

        if !self.budget.try_reserve(step, now) {
            debug!(item_id = %id, step = %step, "Daily budget spent");
            report.budget_deferred += 1;
            return Ok(None);
        }

        Ok(Some(current))
    }

    fn spawn_execution(&self, step: Step, snapshot: ItemRecord, join_set: &mut JoinSet<Dispatched>) {
        let executor = self.executors.get(step);
        let timeout = self.config.timeout(step);
        let span = create_dispatch_span(step, &snapshot.id, snapshot.attempts(step) + 1, self.owner.as_str());

        join_set.spawn(
            async move {
                debug!("Dispatching to executor");
                let record = snapshot.clone();
                let task = tokio::spawn(async move { executor.execute(step, &record).await });
                let guard = AbortOnDrop(task.abort_handle());

                let outcome = match tokio::time::timeout(timeout, task).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(join_error)) => Err(StageFailure::transient(format!(
                        "{} executor crashed: {}",
                        step, join_error
                    ))),
                    Err(_) => Err(timeout_failure(step, timeout)),
                };
                drop(guard);

                Dispatched { snapshot, outcome }
            }
            .instrument(span),
        );
    }

    /// Collect in-flight results, honoring a stop with the shutdown grace
    async fn drain(
        &self,
        step: Step,
        mut join_set: JoinSet<Dispatched>,
        stop: &CancellationToken,
        leases: &mut HashMap<ItemId, Lease>,
        report: &mut AdvanceReport,
    ) -> Result<(), CoordinatorError> {
        let mut fatal: Option<CoordinatorError> = None;
        let mut grace_deadline: Option<Instant> = None;

        loop {
            let joined = match grace_deadline {
                None => tokio::select! {
                    joined = join_set.join_next() => joined,
                    _ = stop.cancelled() => {
                        if !join_set.is_empty() {
                            info!(step = %step, in_flight = join_set.len(), "Stop requested; waiting for in-flight work");
                        }
                        grace_deadline = Some(Instant::now() + self.config.shutdown_grace());
                        continue;
                    }
                },
                Some(deadline) => tokio::select! {
                    joined = join_set.join_next() => joined,
                    _ = tokio::time::sleep_until(deadline) => {
                        report.abandoned += join_set.len();
                        warn!(step = %step, abandoned = join_set.len(), "Shutdown grace elapsed; abandoning in-flight work");
                        join_set.abort_all();
                        while join_set.join_next().await.is_some() {}
                        break;
                    }
                },
            };

            let Some(joined) = joined else { break };
            match joined {
                Ok(done) => {
                    let lease = leases.remove(&done.snapshot.id);
                    if let Err(e) = self.settle(step, done, report).await {
                        error!(step = %step, error = %e, "Store failure while committing");
                        fatal.get_or_insert(e);
                    }
                    if let Some(lease) = lease {
                        if let Err(e) = self.store.release_lease(&lease).await {
                            fatal.get_or_insert(e.into());
                        }
                    }
                }
                Err(e) => {
                    // executor panics are caught inside the task; this is an abort
                    debug!(step = %step, error = %e, "Dispatch task ended without a result");
                    report.abandoned += 1;
                }
            }
        }

        // leases of abandoned dispatches
        for (_, lease) in leases.drain() {
            if let Err(e) = self.store.release_lease(&lease).await {
                fatal.get_or_insert(e.into());
            }
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Plan and commit the transition for a finished execution
    async fn settle(&self, step: Step, done: Dispatched, report: &mut AdvanceReport) -> Result<(), CoordinatorError> {
        let Dispatched { snapshot, outcome } = done;
        let now = Utc::now();

        let planned = match &outcome {
            Ok(output) => plan_success(&snapshot, step, output, now),
            Err(failure) => {
                warn!(
                    item_id = %snapshot.id,
                    step = %step,
                    kind = %failure.kind,
                    message = %failure.message,
                    "Stage executor failed"
                );
                if failure.kind == FailureKind::QuotaExhausted && step == Step::Upload {
                    self.budget.mark_exhausted(now);
                }
                plan_failure(&snapshot, step, failure, &self.policy, now)
            }
        };

        match planned {
            Ok(next) => self.commit_outcome(step, &snapshot, next, report).await,
            Err(e) => {
                error!(item_id = %snapshot.id, step = %step, error = %e, "Rejected transition; item left untouched");
                report.invalid += 1;
                Ok(())
            }
        }
    }

    async fn commit_outcome(
        &self,
        step: Step,
        prior: &ItemRecord,
        next: ItemRecord,
        report: &mut AdvanceReport,
    ) -> Result<(), CoordinatorError> {
        match self.store.commit(&prior.id, prior.stage, &next).await? {
            CommitOutcome::Committed => {
                if next.stage == Stage::Skipped {
                    report.skipped += 1;
                } else if next.parked.is_some() {
                    report.parked += 1;
                } else if next.stage == step.target_stage() {
                    report.succeeded += 1;
                } else {
                    report.retrying += 1;
                }
                info!(
                    item_id = %next.id,
                    step = %step,
                    from = %prior.stage,
                    to = %next.stage,
                    attempts = next.attempts(step),
                    "Committed transition"
                );
            }
            CommitOutcome::Conflict { current } => {
                report.conflicts += 1;
                info!(
                    item_id = %prior.id,
                    step = %step,
                    expected = %prior.stage,
                    current = ?current,
                    "Item changed concurrently; discarding result"
                );
            }
        }
        Ok(())
    }

    /// Earliest instant at which waiting work becomes eligible
    async fn next_wakeup(&self, now: DateTime<Utc>, budget_waiting: bool) -> Result<Option<DateTime<Utc>>, StoreError> {
        let records = self.store.list_all().await?;
        let mut next = records
            .iter()
            .filter(|r| {
                !r.stage.is_terminal() && r.parked.is_none() && self.config.catalog_window.contains(r.catalog_date)
            })
            .flat_map(|r| {
                let retry = r.pending_retry(now).map(|retry| retry.not_before);
                let slot = (r.stage == Stage::Scheduled)
                    .then_some(r.scheduled_at)
                    .flatten()
                    .filter(|at| *at > now);
                retry.into_iter().chain(slot)
            })
            .min();

        if budget_waiting {
            let reset = self.budget.next_reset(now);
            next = Some(next.map_or(reset, |at| at.min(reset)));
        }
        Ok(next)
    }

    /// Advance every step until nothing is eligible and nothing waits on a near deadline
    pub async fn run_to_completion(&self, poll_interval: Duration) -> Result<RunSummary, CoordinatorError> {
        let run_id = generate_correlation_id();
        let span = tracing::info_span!("migration_run", run.id = %run_id, owner = %self.owner);
        self.run_passes(run_id, poll_interval).instrument(span).await
    }

    async fn run_passes(&self, run_id: String, poll_interval: Duration) -> Result<RunSummary, CoordinatorError> {
        info!("Migration run started");
        self.budget.seed_from(&self.store.list_all().await?, Utc::now());

        let mut totals: StepTable<AdvanceReport> = StepTable::default();
        let mut passes = 0;
        let limit = |step: Step| *self.config.concurrency.get(step);
        // cancelled by a stop or by the first store failure of any step
        let run_stop = self.cancel.child_token();
        let advance_step = |step: Step| {
            let limit = limit(step);
            let run_stop = &run_stop;
            async move {
                let result = self.advance_until(step, limit, run_stop).await;
                if result.is_err() {
                    run_stop.cancel();
                }
                result
            }
        };

        let stop_reason = loop {
            if self.is_stopped() {
                break StopReason::Stopped;
            }

            let (download, convert, upload, schedule, publish) = tokio::join!(
                advance_step(Step::Download),
                advance_step(Step::Convert),
                advance_step(Step::Upload),
                advance_step(Step::Schedule),
                advance_step(Step::Publish),
            );
            passes += 1;

            let pass = StepTable {
                download: download?,
                convert: convert?,
                upload: upload?,
                schedule: schedule?,
                publish: publish?,
            };
            for step in Step::ALL {
                totals.get_mut(step).absorb(pass.get(step));
            }

            if self.is_stopped() {
                break StopReason::Stopped;
            }
            if Step::ALL.iter().any(|s| pass.get(*s).made_progress()) {
                continue;
            }

            let now = Utc::now();
            let busy_elsewhere = Step::ALL.iter().any(|s| pass.get(*s).lease_skipped > 0);
            let budget_waiting = pass.upload.budget_deferred > 0;
            let wait = match self.next_wakeup(now, budget_waiting).await? {
                Some(at) => {
                    let until = (at - now).to_std().unwrap_or(Duration::ZERO);
                    if until > self.config.max_backoff_wait() && !busy_elsewhere {
                        info!(next_deadline = %at, "Next deadline is beyond the wait horizon");
                        break StopReason::Deferred { next_deadline: at };
                    }
                    until.min(poll_interval)
                }
                None if busy_elsewhere => poll_interval,
                None => break StopReason::Drained,
            };

            debug!(wait_ms = wait.as_millis() as u64, "Waiting for pending work");
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.cancel.cancelled() => {}
            }
        };

        let mut stages: BTreeMap<Stage, usize> = BTreeMap::new();
        for record in self.store.list_all().await? {
            *stages.entry(record.stage).or_insert(0) += 1;
        }

        info!(
            passes,
            reason = ?stop_reason,
            published = stages.get(&Stage::Published).copied().unwrap_or(0),
            skipped = stages.get(&Stage::Skipped).copied().unwrap_or(0),
            "Migration run finished"
        );

        Ok(RunSummary {
            run_id,
            passes,
            stop_reason,
            steps: totals,
            stages,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::{MockStageExecutor, StageExecutor};
    use crate::pipeline::RetryConfig;
    use crate::store::{MemoryStateStore, MockStateStore};
    use chrono::TimeZone;

    fn record(id: &str, day: u32) -> ItemRecord {
        let date = Utc.with_ymd_and_hms(2007, 5, day, 0, 0, 0).unwrap();
        ItemRecord::discovered(ItemId::new(id).unwrap(), id, date, date)
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            base_delay_secs: 0,
            jitter: false,
            ..RetryConfig::default()
        })
    }

    fn coordinator(store: Arc<dyn StateStore>, executor: impl StageExecutor + 'static) -> Coordinator {
        Coordinator::new(
            store,
            StageExecutors::uniform(Arc::new(executor)),
            policy(),
            CoordinatorConfig::default(),
        )
    }

    #[tokio::test]
    async fn advance_without_eligible_items_does_nothing() {
        let store = MemoryStateStore::with_records([record("a", 1)]).await;
        let mut executor = MockStageExecutor::new();
        executor.expect_execute().never();
        let coordinator = coordinator(Arc::new(store.clone()), executor);

        let before = store.list_all().await.unwrap();
        let report = coordinator.advance(Step::Convert, 4).await.unwrap();
        assert_eq!(report, AdvanceReport::default());
        assert_eq!(store.list_all().await.unwrap(), before);
    }

    #[tokio::test]
    async fn dispatch_respects_the_limit_and_catalog_order() {
        let store = MemoryStateStore::with_records([record("c", 3), record("a", 1), record("b", 2)]).await;
        let mut executor = MockStageExecutor::new();
        executor
            .expect_execute()
            .times(2)
            .returning(|_, r| Ok(StageOutput::new(format!("downloads/{}.mp3", r.id))));
        let coordinator = coordinator(Arc::new(store.clone()), executor);

        let report = coordinator.advance(Step::Download, 2).await.unwrap();
        assert_eq!(report.dispatched, 2);
        assert_eq!(report.succeeded, 2);

        let downloaded: Vec<String> = store
            .list(Stage::Downloaded, None)
            .await
            .unwrap()
            .iter()
            .map(|r| r.id.to_string())
            .collect();
        assert_eq!(downloaded, ["a", "b"]);
    }

    #[tokio::test]
    async fn window_excludes_items_outside_the_dates() {
        let store = MemoryStateStore::with_records([record("early", 1), record("late", 20)]).await;
        let mut executor = MockStageExecutor::new();
        executor.expect_execute().times(1).returning(|_, _| Ok(StageOutput::new("x")));
        let mut config = CoordinatorConfig::default();
        config.catalog_window.start = NaiveDate::from_ymd_opt(2007, 5, 10);

        let coordinator = Coordinator::new(
            Arc::new(store.clone()),
            StageExecutors::uniform(Arc::new(executor)),
            policy(),
            config,
        );
        coordinator.advance(Step::Download, 5).await.unwrap();
        let late = store.load(&ItemId::new("late").unwrap()).await.unwrap().unwrap();
        assert_eq!(late.stage, Stage::Downloaded);
    }

    #[tokio::test]
    async fn lowered_ceiling_skips_without_running_the_executor() {
        let mut item = record("a", 1);
        item.stage = Stage::Failed;
        item.attempt_counts.insert(Step::Download, 3);
        item.retry = Some(crate::pipeline::RetryAnnotation {
            step: Step::Download,
            not_before: Utc::now() - chrono::Duration::seconds(1),
        });
        let store = MemoryStateStore::with_records([item]).await;
        let mut executor = MockStageExecutor::new();
        executor.expect_execute().never();

        let report = coordinator(Arc::new(store.clone()), executor)
            .advance(Step::Download, 1)
            .await
            .unwrap();
        assert_eq!(report.dispatched, 0);
        assert_eq!(report.skipped, 1);
        let stored = store.load(&ItemId::new("a").unwrap()).await.unwrap().unwrap();
        assert_eq!(stored.stage, Stage::Skipped);
    }

    #[tokio::test]
    async fn upload_budget_defers_dispatch() {
        let mut items = Vec::new();
        for (n, id) in ["a", "b", "c"].iter().enumerate() {
            let mut item = record(id, n as u32 + 1);
            item.stage = Stage::Converted;
            items.push(item);
        }
        let store = MemoryStateStore::with_records(items).await;
        let mut executor = MockStageExecutor::new();
        executor.expect_execute().times(2).returning(|_, _| Ok(StageOutput::new("yt")));

        let coordinator = coordinator(Arc::new(store.clone()), executor).with_budget(ResourceBudget::daily(2));
        let report = coordinator.advance(Step::Upload, 3).await.unwrap();
        assert_eq!(report.dispatched, 2);
        assert_eq!(report.budget_deferred, 1);
    }

    #[tokio::test]
    async fn store_failures_are_fatal_to_the_advance() {
        let mut store = MockStateStore::new();
        store.expect_list().returning(|_, _| {
            Err(StoreError::io("/state", std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied")))
        });
        let mut executor = MockStageExecutor::new();
        executor.expect_execute().never();

        let err = coordinator(Arc::new(store), executor)
            .advance(Step::Download, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Store(StoreError::Io { .. })));
    }

    #[tokio::test]
    async fn operator_skip_uses_compare_and_swap() {
        let store = MemoryStateStore::with_records([record("a", 1)]).await;
        let coordinator = coordinator(Arc::new(store.clone()), MockStageExecutor::new());

        let skipped = coordinator.skip(&ItemId::new("a").unwrap(), "duplicate upload").await.unwrap();
        assert_eq!(skipped.stage, Stage::Skipped);
        assert_eq!(skipped.status_message, "Skipped: duplicate upload");

        let err = coordinator.skip(&ItemId::new("a").unwrap(), "again").await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Transition(_)));

        let err = coordinator.skip(&ItemId::new("nope").unwrap(), "x").await.unwrap_err();
        assert!(matches!(err, CoordinatorError::NotFound(_)));
    }

    #[tokio::test]
    async fn skip_refuses_leased_items() {
        let store = MemoryStateStore::with_records([record("a", 1)]).await;
        let id = ItemId::new("a").unwrap();
        store
            .acquire_lease(&id, &LeaseOwner::new("other"), Duration::from_secs(60))
            .await
            .unwrap();

        let err = coordinator(Arc::new(store), MockStageExecutor::new())
            .skip(&id, "x")
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Busy(_)));
    }

    #[tokio::test]
    async fn discovery_is_idempotent_and_assigns_sequences() {
        use crate::catalog::CatalogEntry;

        let store = MemoryStateStore::new();
        let coordinator = coordinator(Arc::new(store.clone()), MockStageExecutor::new());
        let day = |d| Utc.with_ymd_and_hms(2004, 11, d, 0, 0, 0).unwrap();
        let catalog = vec![
            CatalogEntry::new("hy-2004-11-25", "Second", day(25)).unwrap(),
            CatalogEntry::new("hy-2004-11-18", "First", day(18)).unwrap(),
        ];

        let first = coordinator.discover(&catalog).await.unwrap();
        assert_eq!(first.registered, 2);
        let second = coordinator.discover(&catalog).await.unwrap();
        assert_eq!(second.registered, 0);
        assert_eq!(second.already_known, 2);

        let later = store.load(&ItemId::new("hy-2004-11-25").unwrap()).await.unwrap().unwrap();
        assert_eq!(later.sequence, 1);
        assert_eq!(later.stage, Stage::Discovered);
    }

    #[tokio::test]
    async fn late_catalog_additions_get_fresh_sequences() {
        use crate::catalog::CatalogEntry;

        let store = MemoryStateStore::new();
        let coordinator = coordinator(Arc::new(store.clone()), MockStageExecutor::new());
        let day = |d| Utc.with_ymd_and_hms(2004, 11, d, 0, 0, 0).unwrap();
        let known = vec![
            CatalogEntry::new("hy-2004-11-18", "First", day(18)).unwrap(),
            CatalogEntry::new("hy-2004-11-25", "Second", day(25)).unwrap(),
        ];
        coordinator.discover(&known).await.unwrap();

        // an older episode turns up in a later scan
        let mut rescanned = known.clone();
        rescanned.push(CatalogEntry::new("hy-2004-11-11", "Found later", day(11)).unwrap());
        let summary = coordinator.discover(&rescanned).await.unwrap();
        assert_eq!((summary.registered, summary.already_known), (1, 2));

        let mut sequences: Vec<_> = store
            .list_all()
            .await
            .unwrap()
            .into_iter()
            .map(|r| (r.id.to_string(), r.sequence))
            .collect();
        sequences.sort();
        assert_eq!(
            sequences,
            [
                ("hy-2004-11-11".to_string(), 2),
                ("hy-2004-11-18".to_string(), 0),
                ("hy-2004-11-25".to_string(), 1),
            ]
        );
    }
}
