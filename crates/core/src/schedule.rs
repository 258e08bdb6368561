//! Recurring job definitions.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::clock::{MAX_WINDOW, checked_after};
use crate::error::ConfigError;

/// What makes a schedule fire.
#[derive(Debug, Clone)]
pub enum Trigger {
    /// Fixed period. Ticks are aligned to the Unix epoch so every process
    /// evaluating the schedule agrees on them.
    Interval(Duration),
    /// Cron expression (seconds field first, `cron` crate syntax).
    Cron { expression: String, schedule: Schedule },
}

impl Trigger {
    /// Parse a cron expression, e.g. `"0 */5 * * * *"`.
    pub fn cron(name: &str, expression: &str) -> Result<Self, ConfigError> {
        let schedule = Schedule::from_str(expression).map_err(|e| ConfigError::MalformedSchedule {
            name: name.to_string(),
            reason: format!("invalid cron expression `{expression}`: {e}"),
        })?;
        if schedule.upcoming(Utc).next().is_none() {
            return Err(ConfigError::MalformedSchedule {
                name: name.to_string(),
                reason: format!("cron expression `{expression}` never fires"),
            });
        }
        Ok(Self::Cron {
            expression: expression.to_string(),
            schedule,
        })
    }

    pub fn interval(name: &str, every: Duration) -> Result<Self, ConfigError> {
        if every.is_zero() {
            return Err(ConfigError::MalformedSchedule {
                name: name.to_string(),
                reason: "interval must be greater than zero".to_string(),
            });
        }
        if every > MAX_WINDOW {
            return Err(ConfigError::MalformedSchedule {
                name: name.to_string(),
                reason: "interval exceeds the longest supported window".to_string(),
            });
        }
        Ok(Self::Interval(every))
    }

    /// First occurrence strictly after `after`.
    ///
    /// For intervals, `anchor` is the previous due time; whole periods are
    /// skipped until the result lies in the future, so missed ticks are
    /// dropped rather than replayed.
    pub fn next_after(&self, anchor: Option<DateTime<Utc>>, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Interval(every) => {
                let Some(anchor) = anchor else {
                    return checked_after(after, *every);
                };
                if anchor > after {
                    return Some(anchor);
                }
                let period_ms = i64::try_from(every.as_millis()).ok()?.max(1);
                let behind_ms = (after - anchor).num_milliseconds();
                let periods = behind_ms / period_ms + 1;
                let ahead = chrono::Duration::try_milliseconds(periods.checked_mul(period_ms)?)?;
                anchor.checked_add_signed(ahead)
            }
            Trigger::Cron { schedule, .. } => schedule.after(&after).next(),
        }
    }
}

/// A recurring trigger bound to a job type and default payload.
///
/// Immutable once registered.
#[derive(Debug, Clone)]
pub struct ScheduleDefinition {
    pub name: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub trigger: Trigger,
    pub max_attempts: Option<u32>,
}

impl ScheduleDefinition {
    pub fn cron(
        name: impl Into<String>,
        job_type: impl Into<String>,
        expression: &str,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        let trigger = Trigger::cron(&name, expression)?;
        Self::build(name, job_type.into(), trigger)
    }

    pub fn every(
        name: impl Into<String>,
        job_type: impl Into<String>,
        period: Duration,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        let trigger = Trigger::interval(&name, period)?;
        Self::build(name, job_type.into(), trigger)
    }

    fn build(name: String, job_type: String, trigger: Trigger) -> Result<Self, ConfigError> {
        if name.trim().is_empty() {
            return Err(ConfigError::MalformedSchedule {
                name,
                reason: "schedule name must not be empty".to_string(),
            });
        }
        if job_type.trim().is_empty() {
            return Err(ConfigError::MalformedSchedule {
                name,
                reason: "job type must not be empty".to_string(),
            });
        }
        Ok(Self {
            name,
            job_type,
            payload: serde_json::Value::Null,
            trigger,
            max_attempts: None,
        })
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Unique key for the occurrence due at `due`, shared by every process
    /// evaluating this schedule.
    pub fn occurrence_key(&self, due: DateTime<Utc>) -> String {
        format!("schedule:{}:{}", self.name, due.timestamp_millis())
    }
}
