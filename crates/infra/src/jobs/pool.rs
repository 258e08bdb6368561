//! Worker pool: claims due jobs and runs them on tokio tasks.
//!
//! ## Capacity
//!
//! - One process-wide semaphore with `max_workers` permits
//! - One semaphore per job type with the policy's concurrency (1 for singletons)
//!
//! A job is only claimed once both permits are available, so the store never
//! hands this process work it cannot start right away.
//!
//! ## Isolation
//!
//! Each handler runs in its own task. A panic or a timeout becomes a
//! recoverable failure of that attempt; the loop itself never sees it.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, error, info, info_span, warn};

use forgeq_core::clock::checked_after;
use forgeq_core::{AuditEvent, Job, JobStatus};

use super::registry::{HandlerError, JobContext, ProcessorRegistry, Registration};
use super::scheduler::Scheduler;
use crate::engine::EngineContext;
use crate::lock::LockGuard;

/// Attempts at recording a job's outcome before leaving it to lease recovery.
const FINISH_RETRIES: u32 = 3;

/// How shutdown went.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Jobs executing when shutdown was requested
    pub in_flight: usize,
    /// Jobs still executing when the drain timeout hit; left ACTIVE
    pub abandoned: usize,
}

pub struct WorkerPool {
    ctx: EngineContext,
    registry: Arc<ProcessorRegistry>,
    scheduler: Scheduler,
    job_types: Vec<String>,
    global: Arc<Semaphore>,
    per_type: HashMap<String, Arc<Semaphore>>,
}

impl WorkerPool {
    pub fn new(ctx: EngineContext, registry: Arc<ProcessorRegistry>, scheduler: Scheduler) -> Self {
        let job_types = registry.job_types();
        let per_type = job_types
            .iter()
            .filter_map(|t| {
                let policy = registry.policy(t)?;
                Some((t.clone(), Arc::new(Semaphore::new(policy.effective_concurrency()))))
            })
            .collect();
        let global = Arc::new(Semaphore::new(ctx.config().max_workers));
        Self {
            ctx,
            registry,
            scheduler,
            job_types,
            global,
            per_type,
        }
    }

    /// Poll and dispatch until `shutdown` flips to true, then drain.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> DrainReport {
        let mut in_flight: JoinSet<()> = JoinSet::new();
        let mut ticker = tokio::time::interval(self.ctx.config().poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let wake = self.ctx.wake().clone();

        info!(
            worker_id = %self.ctx.worker_id(),
            job_types = ?self.job_types,
            max_workers = self.ctx.config().max_workers,
            "worker pool started"
        );

        while !*shutdown.borrow() {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.scheduler.run_cycle().await;
                    self.dispatch(&mut in_flight).await;
                }
                _ = wake.notified() => {
                    self.dispatch(&mut in_flight).await;
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    log_join(joined);
                    self.dispatch(&mut in_flight).await;
                }
            }
        }

        self.drain(in_flight).await
    }

    /// Claim and spawn jobs while capacity remains.
    async fn dispatch(&self, in_flight: &mut JoinSet<()>) {
        loop {
            let Ok(global) = self.global.clone().try_acquire_owned() else {
                return;
            };
            let ready: Vec<String> = self
                .job_types
                .iter()
                .filter(|t| {
                    self.per_type
                        .get(*t)
                        .is_some_and(|s| s.available_permits() > 0)
                })
                .cloned()
                .collect();
            if ready.is_empty() {
                return;
            }

            let now = self.ctx.now();
            let Some(lease_until) = checked_after(now, self.ctx.config().job_lease) else {
                error!(lease = ?self.ctx.config().job_lease, "job lease is out of range; not claiming");
                return;
            };
            let job = match self
                .ctx
                .store()
                .claim_next(self.ctx.worker_id(), &ready, now, lease_until)
                .await
            {
                Ok(Some(job)) => job,
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "job claim failed");
                    return;
                }
            };

            let (Some(registration), Some(semaphore)) = (
                self.registry.registration(&job.job_type),
                self.per_type.get(&job.job_type),
            ) else {
                // Only registered types are ever requested from the store.
                error!(job_id = %job.id, job_type = %job.job_type, "claimed a job with no processor");
                continue;
            };
            // This loop is the only acquirer, so the permit seen above is still there.
            let Ok(slot) = semaphore.clone().acquire_owned().await else {
                return;
            };

            self.ctx.hook().record(&AuditEvent::JobStarted {
                job_id: job.id,
                job_type: job.job_type.clone(),
                attempt: job.attempts,
                worker: self.ctx.worker_id().clone(),
            });
            debug!(job_id = %job.id, job_type = %job.job_type, attempt = job.attempts, "job claimed");

            let span = info_span!("job", job_id = %job.id, job_type = %job.job_type, attempt = job.attempts);
            let ctx = self.ctx.clone();
            let registration = registration.clone();
            in_flight.spawn(
                async move {
                    execute(ctx, registration, job, [global, slot]).await;
                }
                .instrument(span),
            );
        }
    }

    async fn drain(&self, mut in_flight: JoinSet<()>) -> DrainReport {
        let timeout = self.ctx.config().drain_timeout;
        let mut report = DrainReport {
            in_flight: in_flight.len(),
            abandoned: 0,
        };
        info!(in_flight = report.in_flight, timeout_ms = timeout.as_millis() as u64, "draining worker pool");

        let drained = tokio::time::timeout(timeout, async {
            while let Some(joined) = in_flight.join_next().await {
                log_join(joined);
            }
        })
        .await;

        if drained.is_err() {
            report.abandoned = in_flight.len();
            warn!(
                abandoned = report.abandoned,
                "drain timeout reached; remaining jobs stay ACTIVE until their leases expire"
            );
            in_flight.abort_all();
            while in_flight.join_next().await.is_some() {}
        }
        info!(?report, "worker pool stopped");
        report
    }
}

impl core::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("job_types", &self.job_types)
            .field("available", &self.global.available_permits())
            .finish_non_exhaustive()
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(error = %e, "job task panicked outside the handler");
        }
    }
}

/// Aborts the wrapped task when dropped, so a cancelled supervisor never
/// leaves a handler running unobserved.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn execute(
    ctx: EngineContext,
    registration: Registration,
    job: Job,
    _permits: [OwnedSemaphorePermit; 2],
) {
    let started = Instant::now();
    let outcome = run_attempt(&ctx, &registration, &job).await;
    finish(&ctx, job, outcome, started.elapsed()).await;
}

async fn run_attempt(
    ctx: &EngineContext,
    registration: &Registration,
    job: &Job,
) -> Result<(), HandlerError> {
    let policy = &registration.policy;
    let guard = if policy.singleton {
        let guard = LockGuard::acquire(
            ctx.locks().clone(),
            format!("job:{}", job.job_type),
            ctx.worker_id().as_str(),
            policy.lock_ttl,
        )
        .await?;
        Some(guard)
    } else {
        None
    };

    let result = supervise(ctx, registration, job, guard.as_ref()).await;

    if let Some(guard) = guard {
        let key = guard.key().to_string();
        if let Err(e) = guard.release().await {
            warn!(lock_key = %key, error = %e, "failed to release job lock; it will expire");
        }
    }
    result
}

/// Run the handler to completion, timeout or panic, heartbeating meanwhile.
async fn supervise(
    ctx: &EngineContext,
    registration: &Registration,
    job: &Job,
    guard: Option<&LockGuard>,
) -> Result<(), HandlerError> {
    let policy = &registration.policy;
    let job_ctx = JobContext {
        job_id: job.id,
        job_type: job.job_type.clone(),
        payload: job.payload.clone(),
        attempt: job.attempts,
        max_attempts: job.max_attempts,
        worker: ctx.worker_id().clone(),
        sagas: ctx.sagas().clone(),
    };
    let processor = registration.processor.clone();
    let mut handler = AbortOnDrop(tokio::spawn(
        async move { processor.process(job_ctx).await }.in_current_span(),
    ));

    let every = heartbeat_interval(ctx.config().job_lease, guard.map(|_| policy.lock_ttl));
    let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let timeout = policy.timeout;
    let deadline = async move {
        match timeout {
            Some(t) => tokio::time::sleep(t).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            joined = &mut handler.0 => {
                return match joined {
                    Ok(result) => result,
                    Err(e) if e.is_panic() => Err(HandlerError::recoverable(format!(
                        "handler panicked: {}",
                        panic_message(e.into_panic())
                    ))),
                    Err(e) => Err(HandlerError::recoverable(format!("handler aborted: {e}"))),
                };
            }
            _ = &mut deadline => {
                return Err(HandlerError::recoverable(format!(
                    "timed out after {}ms",
                    timeout.unwrap_or_default().as_millis()
                )));
            }
            _ = heartbeat.tick() => {
                beat(ctx, job, guard, policy.lock_ttl).await;
            }
        }
    }
}

/// Half the shortest of the job lease and lock TTL.
fn heartbeat_interval(lease: Duration, lock_ttl: Option<Duration>) -> Duration {
    let shortest = lock_ttl.map_or(lease, |ttl| ttl.min(lease));
    (shortest / 2).max(Duration::from_millis(1))
}

async fn beat(ctx: &EngineContext, job: &Job, guard: Option<&LockGuard>, lock_ttl: Duration) {
    let now = ctx.now();
    let extended = match checked_after(now, ctx.config().job_lease) {
        Some(lease_until) => {
            ctx.store()
                .extend_lease(job.id, ctx.worker_id(), lease_until, now)
                .await
        }
        None => Ok(false),
    };
    match extended {
        Ok(true) => {}
        Ok(false) => warn!("job lease lost; another worker may take this job over"),
        Err(e) => warn!(error = %e, "failed to extend job lease"),
    }
    if let Some(guard) = guard {
        if let Err(e) = guard.renew(lock_ttl).await {
            warn!(lock_key = %guard.key(), error = %e, "failed to renew job lock");
        }
    }
}

/// Apply the attempt outcome through a compare-and-set on (ACTIVE, this worker).
async fn finish(
    ctx: &EngineContext,
    mut job: Job,
    outcome: Result<(), HandlerError>,
    elapsed: Duration,
) {
    let now = ctx.now();
    let attempt = job.attempts;
    let event = match &outcome {
        Ok(()) => match job.complete(now) {
            Ok(()) => AuditEvent::JobCompleted {
                job_id: job.id,
                job_type: job.job_type.clone(),
                attempt,
                elapsed,
            },
            Err(e) => {
                error!(error = %e, "cannot complete job");
                return;
            }
        },
        Err(failure) => match job.fail(failure.message(), failure.kind(), now) {
            Ok(JobStatus::Delayed) => AuditEvent::JobRetryScheduled {
                job_id: job.id,
                job_type: job.job_type.clone(),
                attempt,
                error: failure.to_string(),
            },
            Ok(_) => AuditEvent::JobFailed {
                job_id: job.id,
                job_type: job.job_type.clone(),
                attempt,
                error: failure.to_string(),
            },
            Err(e) => {
                error!(error = %e, "cannot fail job");
                return;
            }
        },
    };

    let owner = ctx.worker_id();
    for retry in 1..=FINISH_RETRIES {
        match ctx
            .store()
            .compare_and_set(&job, JobStatus::Active, Some(owner))
            .await
        {
            Ok(true) => {
                ctx.hook().record(&event);
                match &outcome {
                    Ok(()) => info!(elapsed_ms = elapsed.as_millis() as u64, "job completed"),
                    Err(failure) => warn!(
                        status = %job.status,
                        error = %failure,
                        run_at = %job.run_at,
                        "job attempt failed"
                    ),
                }
                if job.status == JobStatus::Waiting {
                    ctx.wake().notify_one();
                }
                return;
            }
            Ok(false) => {
                warn!("job ownership lost before the outcome was recorded; outcome dropped");
                return;
            }
            Err(e) => {
                warn!(retry, error = %e, "failed to record job outcome");
                if retry < FINISH_RETRIES {
                    tokio::time::sleep(Duration::from_millis(50 * u64::from(retry))).await;
                }
            }
        }
    }
    error!("giving up on recording job outcome; lease recovery will retry the job");
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
