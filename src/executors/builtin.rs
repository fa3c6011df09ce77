// Built-in executors for the schedule and publish steps
// Used when no external command is configured for those steps

use async_trait::async_trait;
use chrono::Utc;

use super::{StageExecutor, StageFailure, StageOutput};
use crate::calendar::PublicationCalendar;
use crate::pipeline::{ItemRecord, Step};

/// Assigns each uploaded item the calendar slot of its catalog position
pub struct CalendarScheduleExecutor {
    calendar: PublicationCalendar,
}

impl CalendarScheduleExecutor {
    pub fn new(calendar: PublicationCalendar) -> Self {
        Self { calendar }
    }
}

#[async_trait]
impl StageExecutor for CalendarScheduleExecutor {
    async fn execute(&self, _step: Step, record: &ItemRecord) -> Result<StageOutput, StageFailure> {
        let upload = record.artifact(Step::Upload).ok_or_else(|| {
            StageFailure::invalid_input(format!("{} has no upload artifact to schedule", record.id))
        })?;
        let slot = self.calendar.slot(record.sequence);

        Ok(StageOutput::new(upload.locator.clone())
            .with_metadata("slot", slot.to_rfc3339())
            .scheduled_for(slot))
    }
}

/// Confirms publication once the scheduled slot has passed.
/// The hosting platform flips scheduled videos public on its own.
pub struct ConfirmPublishExecutor;

#[async_trait]
impl StageExecutor for ConfirmPublishExecutor {
    async fn execute(&self, _step: Step, record: &ItemRecord) -> Result<StageOutput, StageFailure> {
        let upload = record.artifact(Step::Upload).ok_or_else(|| {
            StageFailure::invalid_input(format!("{} has no upload artifact to publish", record.id))
        })?;
        let now = Utc::now();

        match record.scheduled_at {
            Some(slot) if slot > now => Err(StageFailure::transient(format!(
                "slot {} has not been reached",
                slot.to_rfc3339()
            ))),
            _ => Ok(StageOutput::new(upload.locator.clone()).published_on(record.scheduled_at.unwrap_or(now))),
        }
    }
}
