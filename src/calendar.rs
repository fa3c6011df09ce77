use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Publication calendar settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarConfig {
    /// First publication slot
    pub start: DateTime<Utc>,
    /// Days between consecutive slots
    pub interval_days: u32,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            start: Utc
                .with_ymd_and_hms(2025, 10, 1, 10, 0, 0)
                .single()
                .unwrap_or_default(),
            interval_days: 7,
        }
    }
}

/// Evenly spaced publication slots, one per catalog position
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicationCalendar {
    start: DateTime<Utc>,
    interval: Duration,
}

impl PublicationCalendar {
    pub fn new(start: DateTime<Utc>, interval: Duration) -> Self {
        Self { start, interval }
    }

    pub fn from_config(config: &CalendarConfig) -> Self {
        Self::new(config.start, Duration::days(i64::from(config.interval_days)))
    }

    pub fn slot(&self, sequence: u64) -> DateTime<Utc> {
        let offset = i32::try_from(sequence)
            .ok()
            .and_then(|n| self.interval.checked_mul(n));
        offset
            .and_then(|delta| self.start.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
