//! Stage executor interface and adapters
//!
//! The coordinator treats every pipeline step as an opaque call: it hands the
//! executor a snapshot of one item record and gets back either the artifact
//! the step produced or a classified failure. Executors never see another
//! item's state and never write to the store.

pub mod builtin;
pub mod command;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;

pub use crate::pipeline::FailureKind;
use crate::pipeline::{ItemRecord, Step, StepTable};

pub use builtin::{CalendarScheduleExecutor, ConfirmPublishExecutor};
pub use command::{CommandSpec, CommandStageExecutor};

/// Result of a successful stage execution
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StageOutput {
    /// Where the step's output lives (file path, remote id, ...)
    pub locator: String,
    pub metadata: BTreeMap<String, String>,
    /// Publication slot chosen by a schedule executor
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Publication time reported by a publish executor
    pub published_at: Option<DateTime<Utc>>,
}

impl StageOutput {
    pub fn new(locator: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            ..Default::default()
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn published_on(mut self, at: DateTime<Utc>) -> Self {
        self.published_at = Some(at);
        self
    }
}

/// Classified failure reported by a stage executor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl StageFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::TransientIo, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(FailureKind::InvalidInput, message)
    }

    pub fn quota_exhausted(message: impl Into<String>) -> Self {
        Self::new(FailureKind::QuotaExhausted, message)
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for StageFailure {}

/// One pipeline step's worker.
///
/// Implementations must tolerate being invoked again for the same item when a
/// previous attempt's outcome is unknown (for example after a crash mid-call).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn execute(&self, step: Step, record: &ItemRecord) -> Result<StageOutput, StageFailure>;
}

/// Executor for every step, keyed by the closed `Step` enum
#[derive(Clone)]
pub struct StageExecutors {
    table: StepTable<Arc<dyn StageExecutor>>,
}

impl StageExecutors {
    pub fn new(
        download: Arc<dyn StageExecutor>,
        convert: Arc<dyn StageExecutor>,
        upload: Arc<dyn StageExecutor>,
        schedule: Arc<dyn StageExecutor>,
        publish: Arc<dyn StageExecutor>,
    ) -> Self {
        Self {
            table: StepTable {
                download,
                convert,
                upload,
                schedule,
                publish,
            },
        }
    }

    /// The same executor for every step
    pub fn uniform(executor: Arc<dyn StageExecutor>) -> Self {
        Self {
            table: StepTable::from_fn(|_| executor.clone()),
        }
    }

    pub fn with(mut self, step: Step, executor: Arc<dyn StageExecutor>) -> Self {
        *self.table.get_mut(step) = executor;
        self
    }

    pub fn get(&self, step: Step) -> Arc<dyn StageExecutor> {
        self.table.get(step).clone()
    }
}

/// Runs a synchronous closure on tokio's blocking pool
pub struct BlockingExecutor<F> {
    func: Arc<F>,
}

impl<F> BlockingExecutor<F>
where
    F: Fn(Step, &ItemRecord) -> Result<StageOutput, StageFailure> + Send + Sync + 'static,
{
    pub fn new(func: F) -> Self {
        Self {
            func: Arc::new(func),
        }
    }
}

#[async_trait]
impl<F> StageExecutor for BlockingExecutor<F>
where
    F: Fn(Step, &ItemRecord) -> Result<StageOutput, StageFailure> + Send + Sync + 'static,
{
    async fn execute(&self, step: Step, record: &ItemRecord) -> Result<StageOutput, StageFailure> {
        let func = self.func.clone();
        let record = record.clone();
        tokio::task::spawn_blocking(move || func(step, &record))
            .await
            .map_err(|e| StageFailure::transient(format!("{} worker aborted: {}", step, e)))?
    }
}
