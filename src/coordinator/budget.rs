// Daily upload budget owned by a coordinator
// The hosting platform caps uploads per day; the ledger keeps the count explicit instead of global

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::info;

use crate::pipeline::{FailureKind, ItemRecord, Step};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Upload dispatches allowed per UTC day; `None` removes the cap
    pub uploads_per_day: Option<u32>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            uploads_per_day: Some(5),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct DayLedger {
    day: NaiveDate,
    used: u32,
    exhausted: bool,
}

impl DayLedger {
    fn fresh(day: NaiveDate) -> Self {
        Self {
            day,
            used: 0,
            exhausted: false,
        }
    }
}

#[derive(Debug)]
pub struct ResourceBudget {
    limit: Option<u32>,
    ledger: Mutex<DayLedger>,
}

impl ResourceBudget {
    pub fn new(config: &BudgetConfig) -> Self {
        Self {
            limit: config.uploads_per_day,
            ledger: Mutex::new(DayLedger::fresh(Utc::now().date_naive())),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(&BudgetConfig {
            uploads_per_day: None,
        })
    }

    pub fn daily(limit: u32) -> Self {
        Self::new(&BudgetConfig {
            uploads_per_day: Some(limit),
        })
    }

    /// Ledger for `now`'s day, rolled over if the day changed
    fn with_ledger<T>(&self, now: DateTime<Utc>, f: impl FnOnce(&mut DayLedger) -> T) -> T {
        let mut ledger = self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let today = now.date_naive();
        if ledger.day != today {
            *ledger = DayLedger::fresh(today);
        }
        f(&mut ledger)
    }

    /// Consume one dispatch of `step` if the budget allows it
    pub fn try_reserve(&self, step: Step, now: DateTime<Utc>) -> bool {
        if step != Step::Upload {
            return true;
        }
        let limit = self.limit;
        self.with_ledger(now, |ledger| {
            if ledger.exhausted || limit.map(|max| ledger.used >= max).unwrap_or(false) {
                return false;
            }
            ledger.used += 1;
            true
        })
    }

    /// The external service refused further work for today
    pub fn mark_exhausted(&self, now: DateTime<Utc>) {
        self.with_ledger(now, |ledger| ledger.exhausted = true);
        info!(day = %now.date_naive(), "Upload budget exhausted for the day");
    }

    /// Uploads still allowed today; `None` when uncapped and not exhausted
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<u32> {
        let limit = self.limit;
        self.with_ledger(now, |ledger| {
            if ledger.exhausted {
                Some(0)
            } else {
                limit.map(|max| max.saturating_sub(ledger.used))
            }
        })
    }

    /// Start of the next budget day
    pub fn next_reset(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        (now.date_naive() + Duration::days(1))
            .and_hms_opt(0, 0, 0)
            .map(|midnight| midnight.and_utc())
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Count uploads already attempted today by earlier runs
    pub fn seed_from(&self, records: &[ItemRecord], now: DateTime<Utc>) {
        let today = now.date_naive();
        let succeeded = records
            .iter()
            .filter_map(|r| r.artifact(Step::Upload))
            .filter(|a| a.recorded_at.date_naive() == today)
            .count();
        let failed = records
            .iter()
            .flat_map(|r| r.error_history.iter())
            .filter(|e| e.step == Step::Upload && e.at.date_naive() == today)
            .filter(|e| e.kind != FailureKind::QuotaExhausted)
            .count();
        let refused = records
            .iter()
            .flat_map(|r| r.error_history.iter())
            .any(|e| e.step == Step::Upload && e.at.date_naive() == today && e.kind == FailureKind::QuotaExhausted);

        let used = u32::try_from(succeeded + failed).unwrap_or(u32::MAX);
        self.with_ledger(now, |ledger| {
            ledger.used = ledger.used.max(used);
            ledger.exhausted |= refused;
        });
    }
}
