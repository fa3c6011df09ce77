// Retry policy for failed stage executions
// Exponential, bounded backoff per step with a separate fixed cooldown for quota refusals

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::record::FailureKind;
use super::{Step, StepTable};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempt ceiling per step; `None` retries without limit
    pub max_attempts: StepTable<Option<u32>>,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    /// Fixed wait after an external quota refusal
    pub quota_cooldown_secs: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: StepTable {
                download: Some(3),
                convert: Some(2),
                upload: Some(3),
                schedule: None,
                publish: None,
            },
            base_delay_secs: 300,
            max_delay_secs: 3600,
            quota_cooldown_secs: 86_400,
            jitter: true,
        }
    }
}

/// What to do with an item after a failed attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Hold the item and re-dispatch no earlier than `not_before`
    RetryAt {
        not_before: DateTime<Utc>,
        counts_as_attempt: bool,
    },
    /// Give up on the item
    GiveUp { counts_as_attempt: bool },
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn max_attempts(&self, step: Step) -> Option<u32> {
        *self.config.max_attempts.get(step)
    }

    /// Delay before attempt `attempt + 1`, given `attempt` attempts so far
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.base_delay_secs;
        let exponent = attempt.saturating_sub(1).min(32);
        let raw = base.saturating_mul(1u64 << exponent);
        let capped = raw.min(self.config.max_delay_secs);

        if self.config.jitter && capped > 0 {
            let factor: f64 = rand::rng().random_range(0.8..=1.2);
            let jittered = (capped as f64 * factor).round() as u64;
            Duration::from_secs(jittered.min(self.config.max_delay_secs))
        } else {
            Duration::from_secs(capped)
        }
    }

    pub fn quota_cooldown(&self) -> Duration {
        Duration::from_secs(self.config.quota_cooldown_secs)
    }

    /// Decide the fate of an item whose `step` failed with `kind`.
    /// `attempts` is the attempt count including the failed attempt when it counts.
    pub fn decide(
        &self,
        step: Step,
        kind: FailureKind,
        attempts: u32,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        match kind {
            FailureKind::InvalidInput => RetryDecision::GiveUp {
                counts_as_attempt: true,
            },
            FailureKind::QuotaExhausted => RetryDecision::RetryAt {
                not_before: deadline_after(now, self.quota_cooldown()),
                counts_as_attempt: false,
            },
            FailureKind::TransientIo => match self.max_attempts(step) {
                Some(max) if attempts >= max => RetryDecision::GiveUp {
                    counts_as_attempt: true,
                },
                _ => RetryDecision::RetryAt {
                    not_before: deadline_after(now, self.backoff(attempts)),
                    counts_as_attempt: true,
                },
            },
        }
    }
}

/// `now + duration`, saturating at the latest representable instant
pub fn deadline_after(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    ChronoDuration::from_std(duration)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            jitter: false,
            base_delay_secs: 10,
            max_delay_secs: 60,
            ..RetryConfig::default()
        })
    }

    #[test]
    fn backoff_doubles_and_is_bounded() {
        let policy = policy();
        assert_eq!(policy.backoff(1), Duration::from_secs(10));
        assert_eq!(policy.backoff(2), Duration::from_secs(20));
        assert_eq!(policy.backoff(3), Duration::from_secs(40));
        assert_eq!(policy.backoff(4), Duration::from_secs(60));
        assert_eq!(policy.backoff(400), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::new(RetryConfig {
            base_delay_secs: 100,
            max_delay_secs: 1000,
            jitter: true,
            ..RetryConfig::default()
        });
        for _ in 0..50 {
            let delay = policy.backoff(1).as_secs();
            assert!((80..=120).contains(&delay), "delay {delay} out of range");
        }
    }

    #[test]
    fn transient_failures_give_up_at_the_ceiling() {
        let policy = policy();
        let now = Utc::now();

        assert!(matches!(
            policy.decide(Step::Download, FailureKind::TransientIo, 2, now),
            RetryDecision::RetryAt { counts_as_attempt: true, .. }
        ));
        assert_eq!(
            policy.decide(Step::Download, FailureKind::TransientIo, 3, now),
            RetryDecision::GiveUp { counts_as_attempt: true }
        );
        assert_eq!(
            policy.decide(Step::Convert, FailureKind::TransientIo, 2, now),
            RetryDecision::GiveUp { counts_as_attempt: true }
        );
    }

    #[test]
    fn invalid_input_is_never_retried() {
        assert_eq!(
            policy().decide(Step::Upload, FailureKind::InvalidInput, 1, Utc::now()),
            RetryDecision::GiveUp { counts_as_attempt: true }
        );
    }

    #[test]
    fn quota_refusals_wait_for_the_cooldown() {
        let now = Utc::now();
        match policy().decide(Step::Upload, FailureKind::QuotaExhausted, 3, now) {
            RetryDecision::RetryAt { not_before, counts_as_attempt } => {
                assert!(!counts_as_attempt);
                assert_eq!(not_before - now, ChronoDuration::seconds(86_400));
            }
            other => panic!("unexpected decision {other:?}"),
        }
    }

    #[test]
    fn unbounded_steps_keep_retrying() {
        let decision = policy().decide(Step::Schedule, FailureKind::TransientIo, 50, Utc::now());
        assert!(matches!(decision, RetryDecision::RetryAt { .. }));
    }
}
