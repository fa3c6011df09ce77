use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;
use thiserror::Error;

use super::{Stage, Step};

static ITEM_ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,199}$").expect("item id pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid item id '{0}': must match [A-Za-z0-9][A-Za-z0-9._-]{{0,199}}")]
pub struct InvalidItemId(pub String);

/// Stable catalog identifier. Doubles as the record's file name, so it is validated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ItemId(String);

impl ItemId {
    pub fn new(id: impl Into<String>) -> Result<Self, InvalidItemId> {
        let id = id.into();
        if ITEM_ID_PATTERN.is_match(&id) {
            Ok(Self(id))
        } else {
            Err(InvalidItemId(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ItemId {
    type Error = InvalidItemId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ItemId> for String {
    fn from(id: ItemId) -> Self {
        id.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Classification of a stage executor failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network or timeout trouble; retried with exponential backoff
    TransientIo,
    /// Malformed upstream data; never retried
    InvalidInput,
    /// Rate or quota limit of an external service; retried after a fixed cooldown
    QuotaExhausted,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureKind::TransientIo => "transient-io",
            FailureKind::InvalidInput => "invalid-input",
            FailureKind::QuotaExhausted => "quota-exhausted",
        })
    }
}

/// Output reference produced by a successful step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub locator: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub at: DateTime<Utc>,
    pub step: Step,
    pub kind: FailureKind,
    pub message: String,
}

/// Which step failed last and when it may be retried
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryAnnotation {
    pub step: Step,
    pub not_before: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionEntry {
    pub from: Stage,
    pub to: Stage,
    pub at: DateTime<Utc>,
}

/// Durable per-item progress record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub id: ItemId,
    pub title: String,
    pub catalog_date: DateTime<Utc>,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub sequence: u64,
    pub stage: Stage,
    #[serde(default)]
    pub attempt_counts: BTreeMap<Step, u32>,
    #[serde(default)]
    pub artifacts: BTreeMap<Step, Artifact>,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub error_history: Vec<ErrorEntry>,
    #[serde(default)]
    pub retry: Option<RetryAnnotation>,
    /// Step that gave up on an item with no `failed` edge (uploaded/scheduled).
    /// Parked items are never dispatched again and wait for an operator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parked: Option<Step>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub transitions: Vec<TransitionEntry>,
    #[serde(default)]
    pub status_message: String,
}

impl ItemRecord {
    /// Fresh record as created by discovery
    pub fn discovered(
        id: ItemId,
        title: impl Into<String>,
        catalog_date: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            title: title.into(),
            catalog_date,
            source_url: None,
            sequence: 0,
            stage: Stage::Discovered,
            attempt_counts: BTreeMap::new(),
            artifacts: BTreeMap::new(),
            last_updated: now,
            error_history: Vec::new(),
            retry: None,
            parked: None,
            scheduled_at: None,
            published_at: None,
            transitions: Vec::new(),
            status_message: "Discovered".to_string(),
        }
    }

    pub fn attempts(&self, step: Step) -> u32 {
        self.attempt_counts.get(&step).copied().unwrap_or(0)
    }

    pub fn artifact(&self, step: Step) -> Option<&Artifact> {
        self.artifacts.get(&step)
    }

    pub fn last_error(&self) -> Option<&ErrorEntry> {
        self.error_history.last()
    }

    /// Retry deadline still ahead of `now`, if any
    pub fn pending_retry(&self, now: DateTime<Utc>) -> Option<&RetryAnnotation> {
        self.retry.as_ref().filter(|r| r.not_before > now)
    }

    /// Natural catalog ordering used by every store listing
    pub fn catalog_key(&self) -> (DateTime<Utc>, &str) {
        (self.catalog_date, self.id.as_str())
    }

    /// Whether `step` may be dispatched for this record at `now`
    pub fn is_eligible_for(&self, step: Step, now: DateTime<Utc>) -> bool {
        if self.parked.is_some() {
            return false;
        }
        let deadline_passed = self
            .retry
            .as_ref()
            .map(|r| r.not_before <= now)
            .unwrap_or(true);

        if self.stage == step.source_stage() {
            if !deadline_passed {
                return false;
            }
            return match step {
                Step::Publish => self.scheduled_at.map(|at| at <= now).unwrap_or(true),
                _ => true,
            };
        }

        self.stage == Stage::Failed
            && self.retry.as_ref().map(|r| r.step == step).unwrap_or(false)
            && deadline_passed
    }
}
