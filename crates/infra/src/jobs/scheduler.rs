//! Per-cycle housekeeping: recurring schedules, backoff promotion and lease
//! recovery.
//!
//! Schedule ticks are deduplicated across processes by the job store's unique
//! keys, so every process may run a scheduler against the same store.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use forgeq_core::{
    AuditEvent, ConfigError, EngineResult, EnqueueOptions, FailureKind, JobStatus,
    ScheduleDefinition,
};

use super::registry::ProcessorRegistry;
use crate::engine::EngineContext;

/// What one scheduler cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Schedule occurrences turned into jobs
    pub materialized: usize,
    /// DELAYED jobs moved back to WAITING
    pub promoted: usize,
    /// ACTIVE jobs whose owner stopped heartbeating
    pub recovered: usize,
}

#[derive(Debug)]
struct ScheduleEntry {
    definition: ScheduleDefinition,
    next_due: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct Scheduler {
    ctx: EngineContext,
    registry: Arc<ProcessorRegistry>,
    entries: Vec<ScheduleEntry>,
}

impl Scheduler {
    /// Fails when two definitions share a name or a definition targets an
    /// unregistered job type.
    pub fn new(
        ctx: EngineContext,
        registry: Arc<ProcessorRegistry>,
        definitions: Vec<ScheduleDefinition>,
    ) -> Result<Self, ConfigError> {
        let mut names = HashSet::new();
        let now = ctx.now();
        let mut entries = Vec::with_capacity(definitions.len());
        for definition in definitions {
            if !names.insert(definition.name.clone()) {
                return Err(ConfigError::DuplicateSchedule(definition.name));
            }
            if !registry.contains(&definition.job_type) {
                return Err(ConfigError::MalformedSchedule {
                    reason: format!("job type `{}` is not registered", definition.job_type),
                    name: definition.name,
                });
            }
            let next_due = definition
                .trigger
                .next_after(Some(DateTime::<Utc>::UNIX_EPOCH), now);
            entries.push(ScheduleEntry {
                definition,
                next_due,
            });
        }
        Ok(Self {
            ctx,
            registry,
            entries,
        })
    }

    /// Next due time of the named schedule.
    pub fn next_due(&self, name: &str) -> Option<DateTime<Utc>> {
        self.entries
            .iter()
            .find(|e| e.definition.name == name)
            .and_then(|e| e.next_due)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run one cycle. Store errors are logged and retried next cycle.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let now = self.ctx.now();
        let mut report = CycleReport {
            materialized: self.materialize(now).await,
            ..CycleReport::default()
        };

        match self.ctx.store().promote_due(now).await {
            Ok(n) => report.promoted = n,
            Err(e) => warn!(error = %e, "failed to promote delayed jobs"),
        }

        match self.recover_expired_leases(now).await {
            Ok(n) => report.recovered = n,
            Err(e) => warn!(error = %e, "failed to recover expired leases"),
        }

        if report.materialized + report.promoted + report.recovered > 0 {
            debug!(
                materialized = report.materialized,
                promoted = report.promoted,
                recovered = report.recovered,
                "scheduler cycle"
            );
            self.ctx.wake().notify_one();
        }
        report
    }

    /// Enqueue one job per schedule whose due time has passed, then move the
    /// schedule to its next future occurrence. Missed ticks are not replayed.
    async fn materialize(&mut self, now: DateTime<Utc>) -> usize {
        let mut materialized = 0;
        for i in 0..self.entries.len() {
            let Some(due) = self.entries[i].next_due.filter(|due| *due <= now) else {
                continue;
            };
            let definition = &self.entries[i].definition;

            let mut options = EnqueueOptions::default().with_unique_key(definition.occurrence_key(due));
            if let Some(max_attempts) = definition.max_attempts {
                options = options.with_max_attempts(max_attempts);
            }
            let enqueued = match self.ctx.build_job(
                self.registry.policy(&definition.job_type),
                definition.job_type.clone(),
                definition.payload.clone(),
                &options,
            ) {
                Ok(job) => self.ctx.enqueue_job(job).await,
                Err(e) => Err(e),
            };

            match enqueued {
                Ok(job_id) => {
                    info!(schedule = %definition.name, job_id = %job_id, due = %due, "schedule fired");
                    materialized += 1;
                }
                Err(e) if is_duplicate_tick(&e) => {
                    debug!(schedule = %definition.name, due = %due, "occurrence already enqueued elsewhere");
                }
                Err(e) => {
                    warn!(schedule = %definition.name, error = %e, "failed to enqueue scheduled job");
                    continue;
                }
            }

            let entry = &mut self.entries[i];
            entry.next_due = entry.definition.trigger.next_after(Some(due), now);
        }
        materialized
    }

    /// Treat every ACTIVE job with an expired lease as a recoverable failure of
    /// its current attempt.
    async fn recover_expired_leases(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        let expired = self
            .ctx
            .store()
            .expired_leases(now, self.ctx.config().lease_recovery_batch)
            .await?;

        let mut recovered = 0;
        for mut job in expired {
            let Some(expired_lease) = job.lease_expires_at else {
                continue;
            };
            let previous_owner = job.owner.clone();
            let status = job.fail("lease expired", FailureKind::Recoverable, now)?;
            let swapped = self
                .ctx
                .store()
                .reclaim_expired(&job, previous_owner.as_ref(), expired_lease)
                .await?;
            if !swapped {
                // The owner finished or heartbeated in the meantime.
                continue;
            }
            recovered += 1;
            warn!(
                job_id = %job.id,
                job_type = %job.job_type,
                owner = ?previous_owner,
                status = %status,
                "recovered job with expired lease"
            );

            let event = if status == JobStatus::Failed {
                AuditEvent::JobFailed {
                    job_id: job.id,
                    job_type: job.job_type.clone(),
                    attempt: job.attempts,
                    error: "lease expired".to_string(),
                }
            } else {
                AuditEvent::JobRetryScheduled {
                    job_id: job.id,
                    job_type: job.job_type.clone(),
                    attempt: job.attempts,
                    error: "lease expired".to_string(),
                }
            };
            self.ctx.hook().record(&event);
        }
        Ok(recovered)
    }
}

fn is_duplicate_tick(err: &forgeq_core::EngineError) -> bool {
    matches!(err, forgeq_core::EngineError::Database(db) if db.is_conflict())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{Duration as ChronoDuration, TimeZone};
    use forgeq_core::{ManualClock, WorkerId};
    use serde_json::json;

    use super::*;
    use crate::config::EngineConfig;
    use crate::jobs::{HandlerError, JobContext, JobPolicy, JobQuery};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 30).unwrap()
    }

    fn registry() -> Arc<ProcessorRegistry> {
        let mut registry = ProcessorRegistry::new();
        registry
            .register_fn("report", JobPolicy::default(), |_ctx: JobContext| async {
                Ok::<(), HandlerError>(())
            })
            .unwrap();
        Arc::new(registry)
    }

    fn ctx(clock: &ManualClock) -> EngineContext {
        EngineContext::in_memory_with_clock(EngineConfig::default(), Arc::new(clock.clone()))
    }

    #[tokio::test]
    async fn interval_schedule_fires_once_per_period_without_backfill() {
        let clock = ManualClock::new(start());
        let ctx = ctx(&clock);
        let every_minute =
            ScheduleDefinition::every("minutely", "report", Duration::from_secs(60)).unwrap();
        let mut scheduler = Scheduler::new(ctx.clone(), registry(), vec![every_minute]).unwrap();

        let first_due = Utc.with_ymd_and_hms(2024, 6, 1, 9, 1, 0).unwrap();
        assert_eq!(scheduler.next_due("minutely"), Some(first_due));
        assert_eq!(scheduler.run_cycle().await.materialized, 0);

        clock.set(first_due);
        assert_eq!(scheduler.run_cycle().await.materialized, 1);
        assert_eq!(scheduler.run_cycle().await.materialized, 0);

        // Ten minutes pass unobserved: one job, not ten.
        clock.advance(ChronoDuration::minutes(10));
        assert_eq!(scheduler.run_cycle().await.materialized, 1);
        assert_eq!(
            scheduler.next_due("minutely"),
            Some(Utc.with_ymd_and_hms(2024, 6, 1, 9, 12, 0).unwrap())
        );

        let jobs = ctx.list(&JobQuery::all().with_job_type("report"), 100).await.unwrap();
        assert_eq!(jobs.len(), 2);
    }

    #[tokio::test]
    async fn two_schedulers_share_each_occurrence() {
        let clock = ManualClock::new(start());
        let ctx = ctx(&clock);
        let definition =
            ScheduleDefinition::every("minutely", "report", Duration::from_secs(60)).unwrap();
        let mut a = Scheduler::new(ctx.clone(), registry(), vec![definition.clone()]).unwrap();
        let mut b = Scheduler::new(ctx.clone(), registry(), vec![definition]).unwrap();

        clock.advance(ChronoDuration::seconds(30));
        let fired = a.run_cycle().await.materialized + b.run_cycle().await.materialized;
        assert_eq!(fired, 1);
        assert_eq!(ctx.stats().await.unwrap().total(), 1);
    }

    #[tokio::test]
    async fn cron_schedule_and_payload() {
        let clock = ManualClock::new(start());
        let ctx = ctx(&clock);
        let nightly = ScheduleDefinition::cron("nightly", "report", "0 0 2 * * *")
            .unwrap()
            .with_payload(json!({ "kind": "daily" }))
            .with_max_attempts(5);
        let mut scheduler = Scheduler::new(ctx.clone(), registry(), vec![nightly]).unwrap();

        clock.set(Utc.with_ymd_and_hms(2024, 6, 2, 2, 0, 0).unwrap());
        assert_eq!(scheduler.run_cycle().await.materialized, 1);

        let jobs = ctx.list(&JobQuery::all(), 10).await.unwrap();
        assert_eq!(jobs[0].payload, json!({ "kind": "daily" }));
        assert_eq!(jobs[0].max_attempts, 5);
        assert!(jobs[0].unique_key.as_deref().unwrap().starts_with("schedule:nightly:"));
    }

    #[test]
    fn duplicate_and_unregistered_schedules_fail_fast() {
        let clock = ManualClock::new(start());
        let def = ScheduleDefinition::every("s", "report", Duration::from_secs(5)).unwrap();
        let err = Scheduler::new(ctx(&clock), registry(), vec![def.clone(), def]).unwrap_err();
        assert_eq!(err, ConfigError::DuplicateSchedule("s".into()));

        let orphan = ScheduleDefinition::every("o", "missing", Duration::from_secs(5)).unwrap();
        let err = Scheduler::new(ctx(&clock), registry(), vec![orphan]).unwrap_err();
        assert!(matches!(err, ConfigError::MalformedSchedule { ref name, .. } if name == "o"));
    }

    #[tokio::test]
    async fn expired_leases_are_retried_or_failed() {
        let clock = ManualClock::new(start());
        let ctx = ctx(&clock);
        let mut scheduler = Scheduler::new(ctx.clone(), registry(), vec![]).unwrap();

        let options = EnqueueOptions::default().with_max_attempts(2);
        let job = ctx.build_job(None, "report", json!({}), &options).unwrap();
        let id = ctx.enqueue_job(job).await.unwrap();

        let dead = WorkerId::new("crashed");
        let types = vec!["report".to_string()];
        let now = ctx.now();
        ctx.store()
            .claim_next(&dead, &types, now, now + ChronoDuration::seconds(10))
            .await
            .unwrap()
            .unwrap();

        clock.advance(ChronoDuration::seconds(10));
        let report = scheduler.run_cycle().await;
        assert_eq!(report.recovered, 1);
        let job = ctx.job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Delayed);
        assert_eq!(job.last_error.as_deref(), Some("lease expired"));
        assert!(job.owner.is_none());

        // Second attempt also dies: the budget is spent.
        clock.set(job.run_at);
        scheduler.run_cycle().await;
        let now = ctx.now();
        ctx.store()
            .claim_next(&dead, &types, now, now + ChronoDuration::seconds(10))
            .await
            .unwrap()
            .unwrap();
        clock.advance(ChronoDuration::seconds(11));
        assert_eq!(scheduler.run_cycle().await.recovered, 1);
        let job = ctx.job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 2);
    }

    #[tokio::test]
    async fn late_heartbeat_cannot_revive_an_expired_lease() {
        let clock = ManualClock::new(start());
        let ctx = ctx(&clock);
        let mut scheduler = Scheduler::new(ctx.clone(), registry(), vec![]).unwrap();

        let job = ctx
            .build_job(None, "report", json!({}), &EnqueueOptions::default())
            .unwrap();
        let id = ctx.enqueue_job(job).await.unwrap();
        let slow = WorkerId::new("slow");
        let now = ctx.now();
        ctx.store()
            .claim_next(&slow, &["report".to_string()], now, now + ChronoDuration::seconds(10))
            .await
            .unwrap()
            .unwrap();

        clock.advance(ChronoDuration::seconds(12));
        let now = ctx.now();
        let renewed = ctx
            .store()
            .extend_lease(id, &slow, now + ChronoDuration::seconds(10), now)
            .await
            .unwrap();
        assert!(!renewed);

        assert_eq!(scheduler.run_cycle().await.recovered, 1);
        let job = ctx.job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Delayed);
        assert!(job.owner.is_none());
    }
}
