// Pipeline State Machine - closed stage set and the transition table
// Every committed stage change is checked against `Stage::allowed_targets`

pub mod record;
pub mod retry;
pub mod transitions;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub use record::{
    Artifact, ErrorEntry, FailureKind, InvalidItemId, ItemId, ItemRecord, RetryAnnotation,
    TransitionEntry,
};
pub use retry::{RetryConfig, RetryDecision, RetryPolicy};
pub use transitions::{plan_failure, plan_skip, plan_success};

/// Position of an item in the migration pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Discovered,
    Downloading,
    Downloaded,
    Converting,
    Converted,
    Uploading,
    Uploaded,
    Scheduled,
    Published,
    Failed,
    Skipped,
}

impl Stage {
    pub const ALL: [Stage; 11] = [
        Stage::Discovered,
        Stage::Downloading,
        Stage::Downloaded,
        Stage::Converting,
        Stage::Converted,
        Stage::Uploading,
        Stage::Uploaded,
        Stage::Scheduled,
        Stage::Published,
        Stage::Failed,
        Stage::Skipped,
    ];

    /// Stages reachable in a single transition from `self`
    pub fn allowed_targets(self) -> &'static [Stage] {
        match self {
            Stage::Discovered => &[Stage::Downloading, Stage::Skipped],
            Stage::Downloading => &[Stage::Downloaded, Stage::Failed],
            Stage::Downloaded => &[Stage::Converting, Stage::Skipped],
            Stage::Converting => &[Stage::Converted, Stage::Failed],
            Stage::Converted => &[Stage::Uploading, Stage::Skipped],
            Stage::Uploading => &[Stage::Uploaded, Stage::Failed],
            Stage::Uploaded => &[Stage::Scheduled],
            Stage::Scheduled => &[Stage::Published],
            Stage::Failed => &[
                Stage::Downloading,
                Stage::Converting,
                Stage::Uploading,
                Stage::Skipped,
            ],
            Stage::Published | Stage::Skipped => &[],
        }
    }

    pub fn can_transition_to(self, to: Stage) -> bool {
        self.allowed_targets().contains(&to)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Published | Stage::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Discovered => "discovered",
            Stage::Downloading => "downloading",
            Stage::Downloaded => "downloaded",
            Stage::Converting => "converting",
            Stage::Converted => "converted",
            Stage::Uploading => "uploading",
            Stage::Uploaded => "uploaded",
            Stage::Scheduled => "scheduled",
            Stage::Published => "published",
            Stage::Failed => "failed",
            Stage::Skipped => "skipped",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work the coordinator dispatches to a stage executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Download,
    Convert,
    Upload,
    Schedule,
    Publish,
}

impl Step {
    /// Pipeline order
    pub const ALL: [Step; 5] = [
        Step::Download,
        Step::Convert,
        Step::Upload,
        Step::Schedule,
        Step::Publish,
    ];

    /// Stage an item rests in while waiting for this step
    pub fn source_stage(self) -> Stage {
        match self {
            Step::Download => Stage::Discovered,
            Step::Convert => Stage::Downloaded,
            Step::Upload => Stage::Converted,
            Step::Schedule => Stage::Uploaded,
            Step::Publish => Stage::Scheduled,
        }
    }

    /// Stage the item passes through while the executor runs, if the step has one
    pub fn in_flight_stage(self) -> Option<Stage> {
        match self {
            Step::Download => Some(Stage::Downloading),
            Step::Convert => Some(Stage::Converting),
            Step::Upload => Some(Stage::Uploading),
            Step::Schedule | Step::Publish => None,
        }
    }

    pub fn target_stage(self) -> Stage {
        match self {
            Step::Download => Stage::Downloaded,
            Step::Convert => Stage::Converted,
            Step::Upload => Stage::Uploaded,
            Step::Schedule => Stage::Scheduled,
            Step::Publish => Stage::Published,
        }
    }

    /// Whether a failure of this step can move the item into `failed`
    pub fn can_fail_over(self) -> bool {
        self.in_flight_stage().is_some()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Step::Download => "download",
            Step::Convert => "convert",
            Step::Upload => "upload",
            Step::Schedule => "schedule",
            Step::Publish => "publish",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Step {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "download" | "downloading" => Ok(Step::Download),
            "convert" | "converting" => Ok(Step::Convert),
            "upload" | "uploading" => Ok(Step::Upload),
            "schedule" | "scheduled" => Ok(Step::Schedule),
            "publish" | "published" => Ok(Step::Publish),
            other => Err(format!(
                "unknown step '{other}' (expected download, convert, upload, schedule or publish)"
            )),
        }
    }
}

/// Per-step values keyed by the closed `Step` enum
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTable<T> {
    pub download: T,
    pub convert: T,
    pub upload: T,
    pub schedule: T,
    pub publish: T,
}

impl<T> StepTable<T> {
    pub fn get(&self, step: Step) -> &T {
        match step {
            Step::Download => &self.download,
            Step::Convert => &self.convert,
            Step::Upload => &self.upload,
            Step::Schedule => &self.schedule,
            Step::Publish => &self.publish,
        }
    }

    pub fn get_mut(&mut self, step: Step) -> &mut T {
        match step {
            Step::Download => &mut self.download,
            Step::Convert => &mut self.convert,
            Step::Upload => &mut self.upload,
            Step::Schedule => &mut self.schedule,
            Step::Publish => &mut self.publish,
        }
    }

    pub fn from_fn(mut f: impl FnMut(Step) -> T) -> Self {
        Self {
            download: f(Step::Download),
            convert: f(Step::Convert),
            upload: f(Step::Upload),
            schedule: f(Step::Schedule),
            publish: f(Step::Publish),
        }
    }
}

impl<T: Default> Default for StepTable<T> {
    fn default() -> Self {
        Self::from_fn(|_| T::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition { from: Stage, to: Stage },
    #[error("item {id} is in stage {stage}, which is not eligible for {step}")]
    NotEligible { id: String, stage: Stage, step: Step },
}

/// Check that `path` walks only edges of the transition table
pub fn validate_path(path: &[Stage]) -> Result<(), TransitionError> {
    for pair in path.windows(2) {
        let (from, to) = (pair[0], pair[1]);
        if !from.can_transition_to(to) {
            return Err(TransitionError::InvalidTransition { from, to });
        }
    }
    Ok(())
}
