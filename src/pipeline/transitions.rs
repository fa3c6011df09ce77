// Transition planning - turns an executor outcome into the next durable record
// Pure functions; the coordinator commits their output through the store's CAS

use chrono::{DateTime, Duration, Utc};

use super::record::{Artifact, ErrorEntry, FailureKind, ItemRecord, RetryAnnotation, TransitionEntry};
use super::retry::{RetryDecision, RetryPolicy};
use super::{validate_path, Stage, Step, TransitionError};
use crate::executors::{StageFailure, StageOutput};

/// Timestamp for the next commit; never moves backwards for an item
fn commit_time(record: &ItemRecord, now: DateTime<Utc>) -> DateTime<Utc> {
    if now > record.last_updated {
        now
    } else {
        record.last_updated + Duration::microseconds(1)
    }
}

fn ensure_eligible(record: &ItemRecord, step: Step) -> Result<(), TransitionError> {
    let from_source = record.stage == step.source_stage();
    let from_failed = record.stage == Stage::Failed
        && record.retry.as_ref().map(|r| r.step == step).unwrap_or(false);

    if record.parked.is_none() && (from_source || from_failed) {
        Ok(())
    } else {
        Err(TransitionError::NotEligible {
            id: record.id.to_string(),
            stage: record.stage,
            step,
        })
    }
}

/// Validate `path` and apply it to `record`, recording every edge
fn walk(record: &mut ItemRecord, path: &[Stage], at: DateTime<Utc>) -> Result<(), TransitionError> {
    validate_path(path)?;
    for pair in path.windows(2) {
        record.transitions.push(TransitionEntry {
            from: pair[0],
            to: pair[1],
            at,
        });
    }
    if let Some(last) = path.last() {
        record.stage = *last;
    }
    Ok(())
}

/// Path a dispatched step takes from `from`, ending in `end`
fn dispatch_path(from: Stage, step: Step, end: &[Stage]) -> Vec<Stage> {
    let mut path = vec![from];
    path.extend(step.in_flight_stage());
    path.extend_from_slice(end);
    path
}

/// Record produced by a successful execution of `step`
pub fn plan_success(
    record: &ItemRecord,
    step: Step,
    output: &StageOutput,
    now: DateTime<Utc>,
) -> Result<ItemRecord, TransitionError> {
    ensure_eligible(record, step)?;

    let at = commit_time(record, now);
    let mut next = record.clone();
    walk(&mut next, &dispatch_path(record.stage, step, &[step.target_stage()]), at)?;

    *next.attempt_counts.entry(step).or_insert(0) += 1;
    next.artifacts.insert(
        step,
        Artifact {
            locator: output.locator.clone(),
            metadata: output.metadata.clone(),
            recorded_at: at,
        },
    );
    next.retry = None;

    match step {
        Step::Schedule => {
            next.scheduled_at.get_or_insert(output.scheduled_at.unwrap_or(at));
        }
        Step::Publish => {
            next.published_at.get_or_insert(output.published_at.unwrap_or(at));
        }
        _ => {}
    }

    next.status_message = format!("{} completed", step);
    next.last_updated = at;
    Ok(next)
}

/// Record produced by a failed execution of `step`, as decided by `policy`
pub fn plan_failure(
    record: &ItemRecord,
    step: Step,
    failure: &StageFailure,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> Result<ItemRecord, TransitionError> {
    ensure_eligible(record, step)?;

    let at = commit_time(record, now);
    let mut next = record.clone();
    let attempted = record.attempts(step).saturating_add(1);
    let decision = policy.decide(step, failure.kind, attempted, at);

    let counts = match decision {
        RetryDecision::RetryAt { counts_as_attempt, .. } => counts_as_attempt,
        RetryDecision::GiveUp { counts_as_attempt } => counts_as_attempt,
    };
    if counts {
        next.attempt_counts.insert(step, attempted);
    }

    next.error_history.push(ErrorEntry {
        at,
        step,
        kind: failure.kind,
        message: failure.message.clone(),
    });

    if step.can_fail_over() {
        match decision {
            RetryDecision::RetryAt { not_before, .. } => {
                walk(&mut next, &dispatch_path(record.stage, step, &[Stage::Failed]), at)?;
                next.retry = Some(RetryAnnotation { step, not_before });
                next.status_message = format!("{} failed ({}): {}", step, failure.kind, failure.message);
            }
            RetryDecision::GiveUp { .. } => {
                walk(
                    &mut next,
                    &dispatch_path(record.stage, step, &[Stage::Failed, Stage::Skipped]),
                    at,
                )?;
                next.retry = None;
                next.status_message = format!(
                    "Skipped after {} failure ({}): {}",
                    step, failure.kind, failure.message
                );
            }
        }
    } else {
        // No `failed` edge out of uploaded/scheduled: the item stays put
        match decision {
            RetryDecision::RetryAt { not_before, .. } => {
                next.retry = Some(RetryAnnotation { step, not_before });
                next.status_message = format!("{} failed ({}): {}", step, failure.kind, failure.message);
            }
            RetryDecision::GiveUp { .. } => {
                next.retry = None;
                next.parked = Some(step);
                next.status_message = format!(
                    "Parked after {} failure ({}): {}",
                    step, failure.kind, failure.message
                );
            }
        }
    }

    next.last_updated = at;
    Ok(next)
}

/// Record moved to `skipped` without running an executor
pub fn plan_skip(
    record: &ItemRecord,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<ItemRecord, TransitionError> {
    let at = commit_time(record, now);
    let mut next = record.clone();
    walk(&mut next, &[record.stage, Stage::Skipped], at)?;
    next.retry = None;
    next.status_message = format!("Skipped: {}", reason);
    next.last_updated = at;
    Ok(next)
}

/// Whether `record` already used up the attempts `policy` allows for `step`
pub fn ceiling_reached(record: &ItemRecord, step: Step, policy: &RetryPolicy) -> bool {
    policy
        .max_attempts(step)
        .map(|max| record.attempts(step) >= max)
        .unwrap_or(false)
}

/// Failure kind used when an execution did not report one itself
pub fn timeout_failure(step: Step, timeout: std::time::Duration) -> StageFailure {
    StageFailure::new(
        FailureKind::TransientIo,
        format!("{} timed out after {}s", step, timeout.as_secs()),
    )
}
