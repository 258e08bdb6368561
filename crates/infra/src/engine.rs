//! Engine context: the explicitly constructed bundle of collaborators.
//!
//! Nothing in the engine is global. Two contexts over two stores are two
//! independent engines, which is what the tests rely on.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::info;

use forgeq_core::{
    AuditEvent, DatabaseError, EngineResult, EnqueueOptions, Job, JobId, JobStatus,
    SharedAuditHook, SharedClock, SystemClock, TransitionError, WorkerId,
};
use forgeq_observability::TracingAuditHook;
use forgeq_saga::{InMemorySagaJournal, SagaJournal, SagaOrchestrator};

use crate::config::EngineConfig;
use crate::jobs::{InMemoryJobStore, JobPolicy, JobQuery, JobStats, SharedJobStore};
use crate::lock::{InMemoryLockService, SharedLockService};

#[derive(Clone)]
pub struct EngineContext {
    config: Arc<EngineConfig>,
    store: SharedJobStore,
    locks: SharedLockService,
    sagas: SagaOrchestrator,
    hook: SharedAuditHook,
    clock: SharedClock,
    wake: Arc<Notify>,
}

impl EngineContext {
    pub fn new(
        config: EngineConfig,
        store: SharedJobStore,
        locks: SharedLockService,
        journal: Arc<dyn SagaJournal>,
    ) -> Self {
        let hook: SharedAuditHook = Arc::new(TracingAuditHook::new());
        Self {
            config: Arc::new(config),
            store,
            locks,
            sagas: SagaOrchestrator::new(journal).with_audit_hook(hook.clone()),
            hook,
            clock: Arc::new(SystemClock),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Everything in process memory.
    pub fn in_memory(config: EngineConfig) -> Self {
        Self::in_memory_with_clock(config, Arc::new(SystemClock))
    }

    pub fn in_memory_with_clock(config: EngineConfig, clock: SharedClock) -> Self {
        Self::new(
            config,
            Arc::new(InMemoryJobStore::new()),
            Arc::new(InMemoryLockService::with_clock(clock.clone())),
            Arc::new(InMemorySagaJournal::new()),
        )
        .with_clock(clock)
    }

    pub fn with_audit_hook(mut self, hook: SharedAuditHook) -> Self {
        self.sagas = self.sagas.with_audit_hook(hook.clone());
        self.hook = hook;
        self
    }

    /// Time source for leases, backoff and schedules. Lock services carry
    /// their own clock and are not affected.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.sagas = self.sagas.with_clock(clock.clone());
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &SharedJobStore {
        &self.store
    }

    pub fn locks(&self) -> &SharedLockService {
        &self.locks
    }

    pub fn sagas(&self) -> &SagaOrchestrator {
        &self.sagas
    }

    pub fn hook(&self) -> &SharedAuditHook {
        &self.hook
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.config.worker_id
    }

    /// Wakes the dispatcher ahead of its next poll tick.
    pub(crate) fn wake(&self) -> &Arc<Notify> {
        &self.wake
    }

    /// Build a job with defaults taken from `policy` first, then the engine config.
    /// Explicit options win over both.
    pub fn build_job(
        &self,
        policy: Option<&JobPolicy>,
        job_type: impl Into<String>,
        payload: serde_json::Value,
        options: &EnqueueOptions,
    ) -> EngineResult<Job> {
        options.validate()?;
        let max_attempts = policy
            .and_then(|p| p.max_attempts)
            .unwrap_or(self.config.default_max_attempts);
        let backoff = policy.and_then(|p| p.backoff).unwrap_or(self.config.backoff);
        Ok(Job::new(job_type, payload, self.now()).with_options(options, max_attempts, backoff))
    }

    pub async fn enqueue_job(&self, job: Job) -> EngineResult<JobId> {
        let job_type = job.job_type.clone();
        let status = job.status;
        let id = self.store.enqueue(job).await?;

        self.hook.record(&AuditEvent::JobEnqueued {
            job_id: id,
            job_type: job_type.clone(),
        });
        info!(job_id = %id, job_type = %job_type, status = %status, "job enqueued");
        if status == JobStatus::Waiting {
            self.wake.notify_one();
        }
        Ok(id)
    }

    pub async fn job(&self, id: JobId) -> EngineResult<Option<Job>> {
        Ok(self.store.get(id).await?)
    }

    pub async fn list(&self, query: &JobQuery, limit: usize) -> EngineResult<Vec<Job>> {
        Ok(self.store.list(query, limit).await?)
    }

    pub async fn stats(&self) -> EngineResult<JobStats> {
        Ok(self.store.stats().await?)
    }

    /// Delete up to `limit` COMPLETED or FAILED jobs that finished more than
    /// `older_than` ago. Their unique keys become usable again.
    pub async fn purge_finished(
        &self,
        older_than: std::time::Duration,
        limit: usize,
    ) -> EngineResult<usize> {
        let now = self.now();
        let Some(cutoff) = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
        else {
            return Ok(0);
        };
        let purged = self.store.purge_finished(cutoff, limit).await?;
        if purged > 0 {
            info!(purged, cutoff = %cutoff, "purged finished jobs");
        }
        Ok(purged)
    }

    /// WAITING -> PAUSED.
    pub async fn pause(&self, id: JobId) -> EngineResult<Job> {
        self.operator_transition(id, "pause", Job::pause).await
    }

    /// PAUSED -> WAITING.
    pub async fn resume(&self, id: JobId) -> EngineResult<Job> {
        let job = self.operator_transition(id, "resume", Job::resume).await?;
        self.wake.notify_one();
        Ok(job)
    }

    /// FAILED -> WAITING with a fresh attempt budget.
    pub async fn requeue(&self, id: JobId) -> EngineResult<Job> {
        let job = self.operator_transition(id, "requeue", Job::requeue).await?;
        self.wake.notify_one();
        Ok(job)
    }

    async fn operator_transition<F>(&self, id: JobId, action: &str, apply: F) -> EngineResult<Job>
    where
        F: FnOnce(&mut Job, DateTime<Utc>) -> Result<(), TransitionError>,
    {
        let mut job = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| DatabaseError::not_found(format!("job {id}")))?;
        let expected_status = job.status;
        let expected_owner = job.owner.clone();

        apply(&mut job, self.now())?;
        let swapped = self
            .store
            .compare_and_set(&job, expected_status, expected_owner.as_ref())
            .await?;
        if !swapped {
            return Err(DatabaseError::conflict(format!(
                "job {id} changed while applying {action}"
            ))
            .into());
        }

        info!(job_id = %id, action, status = %job.status, "operator action applied");
        Ok(job)
    }
}

impl core::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EngineContext")
            .field("worker_id", &self.config.worker_id)
            .field("store_backend", &self.config.store_backend)
            .field("lock_backend", &self.config.lock_backend)
            .finish_non_exhaustive()
    }
}
