//! Job model and its state machine.
//!
//! ```text
//! WAITING --claim--> ACTIVE
//! ACTIVE  --success--> COMPLETED
//! ACTIVE  --recoverable failure, attempts < max--> DELAYED
//! DELAYED --due time reached--> WAITING
//! ACTIVE  --recoverable failure, attempts == max--> FAILED
//! ACTIVE  --permanent failure--> FAILED
//! WAITING --pause--> PAUSED --resume--> WAITING
//! FAILED  --operator requeue--> WAITING
//! ```
//!
//! Stores persist whatever these methods produce; they never invent
//! transitions of their own.

use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;
use crate::clock::{MAX_WINDOW, checked_after};
use crate::error::{ConfigError, TransitionError};
use crate::id::{JobId, WorkerId};

/// Attempts granted to a job when neither the enqueue options nor the policy say otherwise.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, eligible once `run_at` has passed
    Waiting,
    /// Claimed by exactly one worker
    Active,
    Completed,
    /// Exhausted retries or failed permanently
    Failed,
    /// Backing off after a recoverable failure
    Delayed,
    /// Held back by an operator
    Paused,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Waiting,
        JobStatus::Active,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Delayed,
        JobStatus::Paused,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Waiting, Active)
                | (Active, Completed)
                | (Active, Delayed)
                | (Active, Failed)
                | (Delayed, Waiting)
                | (Waiting, Paused)
                | (Paused, Waiting)
                | (Failed, Waiting)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Delayed => "delayed",
            JobStatus::Paused => "paused",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ConfigError::InvalidValue {
                name: "JobStatus".to_string(),
                reason: format!("unknown status `{s}`"),
            })
    }
}

/// Whether a failed attempt may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Recoverable,
    Permanent,
}

/// Record of a job execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Per-enqueue overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub max_attempts: Option<u32>,
    /// Earliest time the job may run.
    pub run_at: Option<DateTime<Utc>>,
    /// Relative alternative to `run_at`; ignored when `run_at` is set.
    pub delay: Option<Duration>,
    /// Rejects the enqueue if a job with the same key already exists.
    pub unique_key: Option<String>,
    pub backoff: Option<BackoffPolicy>,
}

impl EnqueueOptions {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_run_at(mut self, at: DateTime<Utc>) -> Self {
        self.run_at = Some(at);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_unique_key(mut self, key: impl Into<String>) -> Self {
        self.unique_key = Some(key.into());
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Reject delays and backoff policies the engine cannot schedule.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.delay.is_some_and(|d| d > MAX_WINDOW) {
            return Err(ConfigError::InvalidValue {
                name: "delay".to_string(),
                reason: "exceeds the longest supported window".to_string(),
            });
        }
        if let Some(backoff) = &self.backoff {
            backoff.check().map_err(|reason| ConfigError::InvalidValue {
                name: "backoff".to_string(),
                reason: reason.to_string(),
            })?;
        }
        Ok(())
    }
}

/// A background job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Logical type, used to route to a registered processor
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    /// Number of times the job has been claimed
    pub attempts: u32,
    pub max_attempts: u32,
    /// Next time the job is eligible to run
    pub run_at: DateTime<Utc>,
    /// Owning worker while ACTIVE
    pub owner: Option<WorkerId>,
    /// Ownership expires at this time unless the owner heartbeats
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Start of the current attempt
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub unique_key: Option<String>,
    pub backoff: BackoffPolicy,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Execution history (one record per finished attempt)
    pub history: Vec<JobAttemptRecord>,
}

impl Job {
    /// Create a WAITING job eligible immediately.
    pub fn new(job_type: impl Into<String>, payload: serde_json::Value, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            job_type: job_type.into(),
            payload,
            status: JobStatus::Waiting,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            run_at: now,
            owner: None,
            lease_expires_at: None,
            started_at: None,
            last_error: None,
            unique_key: None,
            backoff: BackoffPolicy::default(),
            created_at: now,
            updated_at: now,
            history: Vec::new(),
        }
    }

    /// Apply enqueue options on top of the given defaults.
    ///
    /// A job whose first run lies in the future starts out DELAYED. A delay
    /// past the representable range parks the job at the end of time.
    pub fn with_options(
        mut self,
        options: &EnqueueOptions,
        default_max_attempts: u32,
        default_backoff: BackoffPolicy,
    ) -> Self {
        self.max_attempts = options.max_attempts.unwrap_or(default_max_attempts).max(1);
        self.backoff = options.backoff.unwrap_or(default_backoff);
        self.unique_key = options.unique_key.clone();
        if let Some(at) = options.run_at {
            self.run_at = at;
        } else if let Some(delay) = options.delay {
            self.run_at = checked_after(self.created_at, delay).unwrap_or(DateTime::<Utc>::MAX_UTC);
        }
        if self.status == JobStatus::Waiting && self.run_at > self.created_at {
            self.status = JobStatus::Delayed;
        }
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_unique_key(mut self, key: impl Into<String>) -> Self {
        self.unique_key = Some(key.into());
        self
    }

    /// Whether a WAITING job may be claimed at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Waiting && self.run_at <= now
    }

    /// Whether an ACTIVE job's owner has stopped heartbeating.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Active && self.lease_expires_at.is_some_and(|at| at <= now)
    }

    pub fn is_owned_by(&self, worker: &WorkerId) -> bool {
        self.owner.as_ref() == Some(worker)
    }

    fn transition(&mut self, to: JobStatus, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    /// WAITING -> ACTIVE under `owner`, starting a new attempt.
    pub fn claim(
        &mut self,
        owner: WorkerId,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.transition(JobStatus::Active, now)?;
        self.attempts += 1;
        self.owner = Some(owner);
        self.started_at = Some(now);
        self.lease_expires_at = Some(lease_until);
        Ok(())
    }

    /// Extend the lease of an ACTIVE job.
    pub fn renew_lease(&mut self, lease_until: DateTime<Utc>, now: DateTime<Utc>) {
        if self.status == JobStatus::Active {
            self.lease_expires_at = Some(lease_until);
            self.updated_at = now;
        }
    }

    /// ACTIVE -> COMPLETED.
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(JobStatus::Completed, now)?;
        self.record_attempt(now, None);
        self.release_ownership();
        Ok(())
    }

    /// ACTIVE -> DELAYED or FAILED.
    ///
    /// A recoverable failure backs off while attempts remain; otherwise, and
    /// for permanent failures, the job fails for good. Returns the new status.
    pub fn fail(
        &mut self,
        error: impl Into<String>,
        kind: FailureKind,
        now: DateTime<Utc>,
    ) -> Result<JobStatus, TransitionError> {
        let retry = kind == FailureKind::Recoverable && self.attempts < self.max_attempts;
        let next = if retry {
            JobStatus::Delayed
        } else {
            JobStatus::Failed
        };
        self.transition(next, now)?;

        let error = error.into();
        self.record_attempt(now, Some(error.clone()));
        self.last_error = Some(error);
        self.release_ownership();

        if retry {
            let delay = self
                .backoff
                .delay_for_attempt(self.attempts.saturating_sub(1));
            self.run_at = checked_after(now, delay).unwrap_or(DateTime::<Utc>::MAX_UTC);
        }
        Ok(next)
    }

    /// DELAYED -> WAITING once the backoff has elapsed. Returns false if not yet due.
    pub fn promote(&mut self, now: DateTime<Utc>) -> Result<bool, TransitionError> {
        if self.status == JobStatus::Delayed && self.run_at > now {
            return Ok(false);
        }
        self.transition(JobStatus::Waiting, now)?;
        Ok(true)
    }

    /// WAITING -> PAUSED.
    pub fn pause(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(JobStatus::Paused, now)
    }

    /// PAUSED -> WAITING.
    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.status != JobStatus::Paused {
            return Err(TransitionError {
                from: self.status,
                to: JobStatus::Waiting,
            });
        }
        self.transition(JobStatus::Waiting, now)
    }

    /// FAILED -> WAITING (operator action). Resets the attempt budget.
    pub fn requeue(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.status != JobStatus::Failed {
            return Err(TransitionError {
                from: self.status,
                to: JobStatus::Waiting,
            });
        }
        self.transition(JobStatus::Waiting, now)?;
        self.attempts = 0;
        self.last_error = None;
        self.run_at = now;
        Ok(())
    }

    fn record_attempt(&mut self, now: DateTime<Utc>, error: Option<String>) {
        let started_at = self.started_at.unwrap_or(now);
        self.history.push(JobAttemptRecord {
            attempt: self.attempts,
            started_at,
            finished_at: now,
            success: error.is_none(),
            error,
            duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
        });
    }

    fn release_ownership(&mut self) {
        self.owner = None;
        self.lease_expires_at = None;
        self.started_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn worker() -> WorkerId {
        WorkerId::new("worker-1")
    }

    fn job(now: DateTime<Utc>) -> Job {
        Job::new("email.send", serde_json::json!({"to": "ops@example.com"}), now)
            .with_backoff(BackoffPolicy::exponential(
                Duration::from_secs(1),
                Duration::from_secs(60),
            ))
    }

    #[test]
    fn job_lifecycle() {
        let now = Utc::now();
        let mut job = job(now);

        assert_eq!(job.status, JobStatus::Waiting);
        assert_eq!(job.attempts, 0);

        job.claim(worker(), now, now + ChronoDuration::minutes(5)).unwrap();
        assert_eq!(job.status, JobStatus::Active);
        assert_eq!(job.attempts, 1);
        assert!(job.is_owned_by(&worker()));

        job.complete(now + ChronoDuration::seconds(2)).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.owner.is_none());
        assert_eq!(job.history.len(), 1);
        assert!(job.history[0].success);
        assert_eq!(job.history[0].duration_ms, 2000);
    }

    #[test]
    fn recoverable_failures_back_off_until_attempts_run_out() {
        let now = Utc::now();
        let mut job = job(now).with_max_attempts(3);
        let lease = now + ChronoDuration::minutes(5);

        job.claim(worker(), now, lease).unwrap();
        assert_eq!(job.fail("boom", FailureKind::Recoverable, now).unwrap(), JobStatus::Delayed);
        assert_eq!(job.run_at, now + ChronoDuration::seconds(1));

        assert!(job.promote(now + ChronoDuration::seconds(1)).unwrap());
        job.claim(worker(), now, lease).unwrap();
        assert_eq!(job.fail("boom", FailureKind::Recoverable, now).unwrap(), JobStatus::Delayed);
        assert_eq!(job.run_at, now + ChronoDuration::seconds(2));

        assert!(job.promote(now + ChronoDuration::seconds(2)).unwrap());
        job.claim(worker(), now, lease).unwrap();
        assert_eq!(job.fail("boom", FailureKind::Recoverable, now).unwrap(), JobStatus::Failed);

        assert_eq!(job.attempts, 3);
        assert_eq!(job.last_error.as_deref(), Some("boom"));
        assert_eq!(job.history.len(), 3);
    }

    #[test]
    fn permanent_failure_skips_retries() {
        let now = Utc::now();
        let mut job = job(now).with_max_attempts(5);

        job.claim(worker(), now, now).unwrap();
        assert_eq!(
            job.fail("bad payload", FailureKind::Permanent, now).unwrap(),
            JobStatus::Failed
        );
        assert_eq!(job.attempts, 1);
    }

    #[test]
    fn delayed_job_is_not_promoted_early() {
        let now = Utc::now();
        let mut job = job(now);
        job.claim(worker(), now, now).unwrap();
        job.fail("boom", FailureKind::Recoverable, now).unwrap();

        assert!(!job.promote(now).unwrap());
        assert_eq!(job.status, JobStatus::Delayed);
    }

    #[test]
    fn terminal_states_reject_engine_transitions() {
        let now = Utc::now();
        let mut job = job(now);
        job.claim(worker(), now, now).unwrap();
        job.complete(now).unwrap();

        assert!(job.claim(worker(), now, now).is_err());
        assert!(job.fail("late", FailureKind::Recoverable, now).is_err());
        assert!(job.requeue(now).is_err());
    }

    #[test]
    fn pause_resume_and_requeue() {
        let now = Utc::now();
        let mut job = job(now).with_max_attempts(1);

        job.pause(now).unwrap();
        assert_eq!(job.status, JobStatus::Paused);
        assert!(job.claim(worker(), now, now).is_err());
        job.resume(now).unwrap();

        job.claim(worker(), now, now).unwrap();
        job.fail("boom", FailureKind::Recoverable, now).unwrap();
        assert_eq!(job.status, JobStatus::Failed);

        job.requeue(now).unwrap();
        assert_eq!(job.status, JobStatus::Waiting);
        assert_eq!(job.attempts, 0);
        assert!(job.last_error.is_none());
    }

    #[test]
    fn resume_only_applies_to_paused_jobs() {
        let now = Utc::now();
        let mut job = job(now);
        let err = job.resume(now).unwrap_err();
        assert_eq!(err.from, JobStatus::Waiting);
    }

    #[test]
    fn options_override_defaults() {
        let now = Utc::now();
        let options = EnqueueOptions::default()
            .with_max_attempts(7)
            .with_delay(Duration::from_secs(30))
            .with_unique_key("nightly:2024-01-01");
        let job = Job::new("report", serde_json::Value::Null, now).with_options(
            &options,
            DEFAULT_MAX_ATTEMPTS,
            BackoffPolicy::default(),
        );

        assert_eq!(job.max_attempts, 7);
        assert_eq!(job.run_at, now + ChronoDuration::seconds(30));
        assert_eq!(job.unique_key.as_deref(), Some("nightly:2024-01-01"));
        assert_eq!(job.status, JobStatus::Delayed);
        assert!(!job.is_due(now));
    }

    #[test]
    fn oversized_delays_are_rejected_and_never_overflow() {
        let now = Utc::now();
        let huge = Duration::from_millis(10_000_000_000_000_000);
        let options = EnqueueOptions::default().with_delay(huge);
        assert!(matches!(
            options.validate(),
            Err(ConfigError::InvalidValue { ref name, .. }) if name == "delay"
        ));
        assert!(EnqueueOptions::default()
            .with_backoff(BackoffPolicy::fixed(huge))
            .validate()
            .is_err());

        // Even unvalidated, the job is parked rather than overflowing.
        let job = Job::new("report", serde_json::Value::Null, now).with_options(
            &options,
            DEFAULT_MAX_ATTEMPTS,
            BackoffPolicy::default(),
        );
        assert_eq!(job.run_at, DateTime::<Utc>::MAX_UTC);
        assert_eq!(job.status, JobStatus::Delayed);

        let mut job = Job::new("report", serde_json::Value::Null, now)
            .with_backoff(BackoffPolicy::fixed(huge));
        job.claim(worker(), now, now).unwrap();
        assert_eq!(
            job.fail("boom", FailureKind::Recoverable, now).unwrap(),
            JobStatus::Delayed
        );
        assert_eq!(job.run_at, DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn immediate_jobs_start_waiting() {
        let now = Utc::now();
        let job = Job::new("report", serde_json::Value::Null, now).with_options(
            &EnqueueOptions::default(),
            DEFAULT_MAX_ATTEMPTS,
            BackoffPolicy::default(),
        );
        assert_eq!(job.status, JobStatus::Waiting);
        assert!(job.is_due(now));
    }

    #[test]
    fn status_strings_round_trip() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
    }
}
