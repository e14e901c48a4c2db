//! Cron expression parsing for scheduled triggers.

use std::str::FromStr;

use anyhow::{Context as AnyhowContext, Result};
use chrono::{DateTime, Utc};
use cron::Schedule;

/// Parsed cron schedule for a `scheduled` trigger.
///
/// Accepts standard cron syntax:
/// ```text
/// ┌───────────── minute (0 - 59)
/// │ ┌───────────── hour (0 - 23)
/// │ │ ┌───────────── day of month (1 - 31)
/// │ │ │ ┌───────────── month (1 - 12)
/// │ │ │ │ ┌───────────── day of week (0 - 6, Sunday = 0)
/// │ │ │ │ │
/// * * * * *
/// ```
#[derive(Debug, Clone)]
pub struct CronSchedule {
    schedule: Schedule,
}

impl CronSchedule {
    pub fn new(expression: &str) -> Result<Self> {
        let schedule = Schedule::from_str(expression)
            .with_context(|| format!("Invalid cron expression: {}", expression))?;
        Ok(Self { schedule })
    }

    /// The next execution time strictly after the given datetime.
    pub fn next_execution(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// Whether a scheduled time falls inside the half-open window
    /// `(after, now]`, the scheduler's tick window.
    pub fn is_due(&self, after: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self.next_execution(after) {
            Some(due) => due <= now,
            None => false,
        }
    }

    /// Validate a cron expression without keeping the schedule.
    pub fn validate(expression: &str) -> Result<()> {
        Schedule::from_str(expression)
            .with_context(|| format!("Invalid cron expression: {}", expression))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn daily_schedule_next_execution() {
        let schedule = CronSchedule::new("0 9 * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap();
        let next = schedule.next_execution(now).unwrap();
        assert_eq!(next.hour(), 9);
        assert_eq!(next.minute(), 0);
    }

    #[test]
    fn due_within_window() {
        let schedule = CronSchedule::new("*/5 * * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2026, 3, 2, 10, 3, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 10, 6, 0).unwrap();
        // 10:05 falls inside the window.
        assert!(schedule.is_due(after, now));

        let now_early = Utc.with_ymd_and_hms(2026, 3, 2, 10, 4, 0).unwrap();
        assert!(!schedule.is_due(after, now_early));
    }

    #[test]
    fn invalid_expression_is_rejected() {
        assert!(CronSchedule::new("not a cron").is_err());
        assert!(CronSchedule::validate("0 9 * * MON-FRI").is_ok());
        assert!(CronSchedule::validate("invalid").is_err());
    }
}
