//! Read-only reporting over the store
//!
//! Reports never take leases or write; they work from a snapshot that may be
//! slightly stale but is always internally consistent.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::pipeline::{FailureKind, ItemId, ItemRecord, Stage, Step, StepTable};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StepCounts {
    pub succeeded: usize,
    pub retrying: usize,
    pub skipped: usize,
    pub parked: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedItem {
    pub id: ItemId,
    pub title: String,
    /// Step of the most recent error; `None` when the item never failed
    pub step: Option<Step>,
    pub kind: Option<FailureKind>,
    pub last_error: Option<String>,
    pub status: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub generated_at: DateTime<Utc>,
    pub total: usize,
    pub stages: BTreeMap<Stage, usize>,
    pub steps: StepTable<StepCounts>,
    pub completion_percent: f64,
    pub skipped: Vec<SkippedItem>,
    /// Items held at schedule or publish after a failure that is never retried
    pub parked: Vec<SkippedItem>,
}

impl SkippedItem {
    fn from_record(record: &ItemRecord) -> Self {
        let cause = record.last_error();
        Self {
            id: record.id.clone(),
            title: record.title.clone(),
            step: cause.map(|e| e.step),
            kind: cause.map(|e| e.kind),
            last_error: cause.map(|e| e.message.clone()),
            status: record.status_message.clone(),
            at: record.last_updated,
        }
    }
}

impl MigrationReport {
    pub fn from_records(records: &[ItemRecord], now: DateTime<Utc>) -> Self {
        let mut stages: BTreeMap<Stage, usize> = Stage::ALL.iter().map(|s| (*s, 0)).collect();
        let mut steps: StepTable<StepCounts> = StepTable::default();
        let mut skipped = Vec::new();
        let mut parked = Vec::new();

        for record in records {
            *stages.entry(record.stage).or_insert(0) += 1;

            for step in record.artifacts.keys() {
                steps.get_mut(*step).succeeded += 1;
            }
            if let Some(retry) = record.retry.as_ref().filter(|_| !record.stage.is_terminal()) {
                steps.get_mut(retry.step).retrying += 1;
            }

            if record.stage == Stage::Skipped {
                if let Some(step) = record.last_error().map(|e| e.step) {
                    steps.get_mut(step).skipped += 1;
                }
                skipped.push(SkippedItem::from_record(record));
            } else if let Some(step) = record.parked {
                steps.get_mut(step).parked += 1;
                parked.push(SkippedItem::from_record(record));
            }
        }

        let total = records.len();
        let published = stages.get(&Stage::Published).copied().unwrap_or(0);
        let completion_percent = if total == 0 {
            0.0
        } else {
            published as f64 * 100.0 / total as f64
        };

        Self {
            generated_at: now,
            total,
            stages,
            steps,
            completion_percent,
            skipped,
            parked,
        }
    }

    pub fn count(&self, stage: Stage) -> usize {
        self.stages.get(&stage).copied().unwrap_or(0)
    }
}

impl fmt::Display for MigrationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Migration Progress Report ({})", self.generated_at.format("%Y-%m-%d %H:%M UTC"))?;
        writeln!(f)?;
        writeln!(f, "{:<12} {:>7} {:>9}", "Stage", "Count", "Percent")?;
        for (stage, count) in &self.stages {
            let percent = if self.total == 0 {
                0.0
            } else {
                *count as f64 * 100.0 / self.total as f64
            };
            writeln!(f, "{:<12} {:>7} {:>8.1}%", stage.as_str(), count, percent)?;
        }
        writeln!(f, "{:<12} {:>7}", "total", self.total)?;
        writeln!(f)?;

        writeln!(
            f,
            "{:<10} {:>9} {:>9} {:>8} {:>7}",
            "Step", "Succeeded", "Retrying", "Skipped", "Parked"
        )?;
        for step in Step::ALL {
            let counts = self.steps.get(step);
            writeln!(
                f,
                "{:<10} {:>9} {:>9} {:>8} {:>7}",
                step.as_str(),
                counts.succeeded,
                counts.retrying,
                counts.skipped,
                counts.parked
            )?;
        }
        writeln!(f)?;
        writeln!(f, "Completion: {:.1}%", self.completion_percent)?;

        if !self.skipped.is_empty() {
            writeln!(f)?;
            writeln!(f, "Skipped items:")?;
            for item in &self.skipped {
                match (&item.step, &item.last_error) {
                    (Some(step), Some(error)) => writeln!(f, "  {} [{}] {}", item.id, step, error)?,
                    _ => writeln!(f, "  {} ({})", item.id, item.status)?,
                }
            }
        }

        if !self.parked.is_empty() {
            writeln!(f)?;
            writeln!(f, "Parked items (need an operator):")?;
            for item in &self.parked {
                writeln!(f, "  {} {}", item.id, item.status)?;
            }
        }
        Ok(())
    }
}

/// Local artifact still needed by a later step but missing on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingArtifact {
    pub id: ItemId,
    pub step: Step,
    pub path: PathBuf,
}

/// Check that downloaded and converted files waiting for their next step exist.
/// Relative locators are resolved against `base`.
pub fn verify_artifacts(records: &[ItemRecord], base: &Path) -> Vec<MissingArtifact> {
    let waiting_on = |record: &ItemRecord, next: Step| {
        record.stage == next.source_stage()
            || (record.stage == Stage::Failed && record.retry.as_ref().map(|r| r.step) == Some(next))
    };

    let mut missing = Vec::new();
    for record in records {
        for (produced_by, needed_by) in [(Step::Download, Step::Convert), (Step::Convert, Step::Upload)] {
            if !waiting_on(record, needed_by) {
                continue;
            }
            let Some(artifact) = record.artifact(produced_by) else {
                continue;
            };
            let path = base.join(&artifact.locator);
            if !path.exists() {
                missing.push(MissingArtifact {
                    id: record.id.clone(),
                    step: produced_by,
                    path,
                });
            }
        }
    }
    missing
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::{StageFailure, StageOutput};
    use crate::pipeline::{plan_failure, plan_skip, plan_success, RetryConfig, RetryPolicy};
    use chrono::TimeZone;

    fn discovered(id: &str) -> ItemRecord {
        let date = Utc.with_ymd_and_hms(2008, 1, 3, 0, 0, 0).unwrap();
        ItemRecord::discovered(ItemId::new(id).unwrap(), id, date, date)
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            jitter: false,
            ..RetryConfig::default()
        })
    }

    #[test]
    fn counts_stages_steps_and_skip_causes() {
        let now = Utc::now();
        let downloaded = plan_success(&discovered("a"), Step::Download, &StageOutput::new("a.mp3"), now).unwrap();
        let retrying = plan_failure(
            &discovered("b"),
            Step::Download,
            &StageFailure::transient("timeout"),
            &policy(),
            now,
        )
        .unwrap();
        let broken = plan_failure(
            &discovered("c"),
            Step::Download,
            &StageFailure::invalid_input("no audio track"),
            &policy(),
            now,
        )
        .unwrap();
        let manual = plan_skip(&discovered("d"), "duplicate", now).unwrap();

        let report = MigrationReport::from_records(&[downloaded, retrying, broken, manual], now);
        assert_eq!(report.total, 4);
        assert_eq!(report.count(Stage::Downloaded), 1);
        assert_eq!(report.count(Stage::Failed), 1);
        assert_eq!(report.count(Stage::Skipped), 2);
        assert_eq!(
            report.steps.download,
            StepCounts {
                succeeded: 1,
                retrying: 1,
                skipped: 1,
                parked: 0
            }
        );
        assert_eq!(report.completion_percent, 0.0);

        let causes: Vec<_> = report.skipped.iter().map(|s| (s.id.to_string(), s.last_error.clone())).collect();
        assert!(causes.contains(&("c".to_string(), Some("no audio track".to_string()))));
        assert!(causes.contains(&("d".to_string(), None)));

        let text = report.to_string();
        assert!(text.contains("no audio track"));
        assert!(text.contains("Skipped: duplicate"));
    }

    #[test]
    fn parked_items_are_listed_with_their_cause() {
        let now = Utc::now();
        let mut uploaded = discovered("e");
        uploaded.stage = Stage::Uploaded;
        let parked = plan_failure(
            &uploaded,
            Step::Schedule,
            &StageFailure::invalid_input("video was rejected"),
            &policy(),
            now,
        )
        .unwrap();

        let report = MigrationReport::from_records(&[parked], now);
        assert_eq!(report.count(Stage::Uploaded), 1);
        assert_eq!(report.steps.schedule.parked, 1);
        assert_eq!(report.steps.schedule.retrying, 0);
        assert_eq!(report.parked.len(), 1);
        assert_eq!(report.parked[0].last_error.as_deref(), Some("video was rejected"));
        assert!(report.skipped.is_empty());
        assert!(report.to_string().contains("Parked items"));
    }

    #[test]
    fn report_serializes_stage_names() {
        let report = MigrationReport::from_records(&[discovered("a")], Utc::now());
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["stages"]["discovered"], 1);
        assert_eq!(json["steps"]["download"]["succeeded"], 0);
    }

    #[test]
    fn flags_missing_local_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("present.mp3"), b"id3").unwrap();
        let now = Utc::now();

        let present = plan_success(&discovered("a"), Step::Download, &StageOutput::new("present.mp3"), now).unwrap();
        let gone = plan_success(&discovered("b"), Step::Download, &StageOutput::new("gone.mp3"), now).unwrap();

        let missing = verify_artifacts(&[present, gone], dir.path());
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].id.as_str(), "b");
        assert_eq!(missing[0].step, Step::Download);
    }
}
