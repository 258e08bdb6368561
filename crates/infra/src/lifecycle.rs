//! Engine lifecycle: UNINITIALIZED -> INITIALIZED -> RUNNING -> SHUTTING_DOWN -> STOPPED.
//!
//! ```text
//! initialize()  wire store, locks and saga journal; nothing polls yet
//! start()       freeze the registry, spawn the worker pool
//! shutdown()    stop claiming, drain in-flight jobs, close connections
//! ```

use std::future::Future;
use std::sync::Arc;

use sqlx::PgPool;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use forgeq_core::{ConfigError, EngineResult, EnqueueOptions, Job, JobId, ScheduleDefinition};
use forgeq_saga::{InMemorySagaJournal, Saga, SagaError, SagaInstance, SagaJournal, SagaStep};

use crate::config::{EngineConfig, LockBackend, StoreBackend};
use crate::db;
use crate::engine::EngineContext;
use crate::jobs::{
    DrainReport, HandlerError, InMemoryJobStore, JobContext, JobPolicy, JobProcessor, JobQuery,
    JobStats, PostgresJobStore, ProcessorRegistry, Scheduler, SharedJobStore, WorkerPool,
};
use crate::lock::{InMemoryLockService, PostgresLockService, SharedLockService};
use crate::saga::PostgresSagaJournal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Uninitialized,
    Initialized,
    Running,
    ShuttingDown,
    Stopped,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        }
    }
}

impl core::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of [`LifecycleManager::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// State the manager was in when shutdown was requested
    pub previous: LifecycleState,
    pub drain: DrainReport,
}

struct RunningPool {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<DrainReport>,
}

struct Inner {
    state: LifecycleState,
    ctx: Option<EngineContext>,
    pg: Option<PgPool>,
    /// Registrations made before start
    registry: ProcessorRegistry,
    schedules: Vec<ScheduleDefinition>,
    /// Shared immutably once running
    frozen: Option<Arc<ProcessorRegistry>>,
    pool: Option<RunningPool>,
}

impl Inner {
    fn require_state(&self, allowed: &[LifecycleState], expected: &str) -> EngineResult<()> {
        if allowed.contains(&self.state) {
            return Ok(());
        }
        Err(ConfigError::InvalidState {
            expected: expected.to_string(),
            actual: self.state.to_string(),
        }
        .into())
    }

    fn context(&self) -> EngineResult<EngineContext> {
        self.ctx.clone().ok_or_else(|| {
            ConfigError::InvalidState {
                expected: "initialized".to_string(),
                actual: self.state.to_string(),
            }
            .into()
        })
    }

    fn policy(&self, job_type: &str) -> Option<JobPolicy> {
        match &self.frozen {
            Some(registry) => registry.policy(job_type).cloned(),
            None => self.registry.policy(job_type).cloned(),
        }
    }

    async fn release_connections(&mut self) {
        if let Some(pool) = self.pg.take() {
            pool.close().await;
            info!("postgres pool closed");
        }
    }
}

/// Owns one engine instance from wiring to shutdown.
///
/// All methods take `&self`; share the manager behind an `Arc` to call
/// `shutdown_on_signal` from a separate task.
pub struct LifecycleManager {
    inner: Mutex<Inner>,
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: LifecycleState::Uninitialized,
                ctx: None,
                pg: None,
                registry: ProcessorRegistry::new(),
                schedules: Vec::new(),
                frozen: None,
                pool: None,
            }),
        }
    }

    pub async fn state(&self) -> LifecycleState {
        self.inner.lock().await.state
    }

    pub async fn context(&self) -> Option<EngineContext> {
        self.inner.lock().await.ctx.clone()
    }

    /// Connect the backends selected by `config`. Starts no polling.
    pub async fn initialize(&self, config: EngineConfig) -> EngineResult<()> {
        config.validate()?;
        let mut inner = self.inner.lock().await;
        inner.require_state(&[LifecycleState::Uninitialized], "uninitialized")?;

        let (ctx, pg) = connect_backends(config).await?;
        install(&mut inner, ctx, pg);
        Ok(())
    }

    /// Wire caller-provided store and lock service; sagas are journaled in memory.
    pub async fn initialize_with(
        &self,
        config: EngineConfig,
        store: SharedJobStore,
        locks: SharedLockService,
    ) -> EngineResult<()> {
        config.validate()?;
        let journal: Arc<dyn SagaJournal> = Arc::new(InMemorySagaJournal::new());
        self.initialize_with_context(EngineContext::new(config, store, locks, journal))
            .await
    }

    pub async fn initialize_with_context(&self, ctx: EngineContext) -> EngineResult<()> {
        let mut inner = self.inner.lock().await;
        inner.require_state(&[LifecycleState::Uninitialized], "uninitialized")?;
        install(&mut inner, ctx, None);
        Ok(())
    }

    /// Register a processor ahead of [`LifecycleManager::start`].
    pub async fn register<P>(
        &self,
        job_type: impl Into<String>,
        processor: P,
        policy: JobPolicy,
    ) -> EngineResult<()>
    where
        P: JobProcessor + 'static,
    {
        let mut inner = self.inner.lock().await;
        inner.require_state(
            &[LifecycleState::Uninitialized, LifecycleState::Initialized],
            "not yet started",
        )?;
        inner.registry.register(job_type, processor, policy)?;
        Ok(())
    }

    pub async fn register_fn<F, Fut>(
        &self,
        job_type: impl Into<String>,
        policy: JobPolicy,
        f: F,
    ) -> EngineResult<()>
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let mut inner = self.inner.lock().await;
        inner.require_state(
            &[LifecycleState::Uninitialized, LifecycleState::Initialized],
            "not yet started",
        )?;
        inner.registry.register_fn(job_type, policy, f)?;
        Ok(())
    }

    /// Add a recurring schedule ahead of [`LifecycleManager::start`].
    pub async fn schedule_recurring(&self, definition: ScheduleDefinition) -> EngineResult<()> {
        let mut inner = self.inner.lock().await;
        inner.require_state(
            &[LifecycleState::Uninitialized, LifecycleState::Initialized],
            "not yet started",
        )?;
        if inner.schedules.iter().any(|s| s.name == definition.name) {
            return Err(ConfigError::DuplicateSchedule(definition.name).into());
        }
        inner.schedules.push(definition);
        Ok(())
    }

    /// Freeze registrations and start polling.
    ///
    /// `processors` and `schedules` are added to anything registered earlier.
    /// Any configuration error leaves the manager INITIALIZED.
    pub async fn start(
        &self,
        processors: ProcessorRegistry,
        schedules: Vec<ScheduleDefinition>,
    ) -> EngineResult<()> {
        let mut inner = self.inner.lock().await;
        inner.require_state(&[LifecycleState::Initialized], "initialized")?;
        let ctx = inner.context()?;

        let mut registry = inner.registry.clone();
        registry.merge(processors)?;
        let registry = Arc::new(registry);

        let mut all_schedules = inner.schedules.clone();
        all_schedules.extend(schedules);
        let scheduler = Scheduler::new(ctx.clone(), registry.clone(), all_schedules)?;

        if registry.is_empty() {
            warn!("starting with no registered processors; no job will be claimed");
        }
        report_unfinished_sagas(&ctx).await;
        info!(
            worker_id = %ctx.worker_id(),
            processors = registry.len(),
            schedules = scheduler.len(),
            "engine starting"
        );

        let (shutdown, rx) = watch::channel(false);
        let pool = WorkerPool::new(ctx, registry.clone(), scheduler);
        let handle = tokio::spawn(pool.run(rx));

        inner.frozen = Some(registry);
        inner.pool = Some(RunningPool { shutdown, handle });
        inner.state = LifecycleState::Running;
        Ok(())
    }

    /// Stop claiming, drain in-flight jobs up to the configured timeout, then
    /// release connections. Idempotent.
    pub async fn shutdown(&self) -> ShutdownReport {
        let (previous, pool) = {
            let mut inner = self.inner.lock().await;
            let previous = inner.state;
            match previous {
                LifecycleState::Stopped | LifecycleState::ShuttingDown => {
                    return ShutdownReport {
                        previous,
                        drain: DrainReport::default(),
                    };
                }
                LifecycleState::Uninitialized | LifecycleState::Initialized => {
                    inner.release_connections().await;
                    inner.state = LifecycleState::Stopped;
                    info!(previous = %previous, "engine stopped");
                    return ShutdownReport {
                        previous,
                        drain: DrainReport::default(),
                    };
                }
                LifecycleState::Running => {
                    inner.state = LifecycleState::ShuttingDown;
                    (previous, inner.pool.take())
                }
            }
        };
        info!("engine shutting down");

        let drain = match pool {
            Some(pool) => {
                // A closed channel also stops the pool.
                let _ = pool.shutdown.send(true);
                match pool.handle.await {
                    Ok(report) => report,
                    Err(e) => {
                        error!(error = %e, "worker pool task failed");
                        DrainReport::default()
                    }
                }
            }
            None => DrainReport::default(),
        };

        let mut inner = self.inner.lock().await;
        inner.release_connections().await;
        inner.state = LifecycleState::Stopped;
        info!(
            in_flight = drain.in_flight,
            abandoned = drain.abandoned,
            "engine stopped"
        );
        ShutdownReport { previous, drain }
    }

    /// Wait for Ctrl-C or SIGTERM, then [`LifecycleManager::shutdown`].
    pub async fn shutdown_on_signal(&self) -> ShutdownReport {
        wait_for_signal().await;
        self.shutdown().await
    }

    pub async fn enqueue(
        &self,
        job_type: impl Into<String>,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> EngineResult<JobId> {
        let job_type = job_type.into();
        let (ctx, policy) = {
            let inner = self.inner.lock().await;
            inner.require_state(
                &[LifecycleState::Initialized, LifecycleState::Running],
                "initialized or running",
            )?;
            (inner.context()?, inner.policy(&job_type))
        };
        let job = ctx.build_job(policy.as_ref(), job_type, payload, &options)?;
        ctx.enqueue_job(job).await
    }

    pub async fn run_saga(&self, saga: Saga) -> Result<SagaInstance, SagaError> {
        let ctx = self.saga_context().await?;
        ctx.sagas().run(saga).await
    }

    pub async fn run_saga_steps(
        &self,
        name: impl Into<String>,
        steps: Vec<Arc<dyn SagaStep>>,
    ) -> Result<SagaInstance, SagaError> {
        let ctx = self.saga_context().await?;
        ctx.sagas().run_steps(name, steps).await
    }

    async fn saga_context(&self) -> Result<EngineContext, SagaError> {
        let inner = self.inner.lock().await;
        match (&inner.ctx, inner.state) {
            (Some(ctx), LifecycleState::Initialized | LifecycleState::Running) => Ok(ctx.clone()),
            (_, state) => Err(SagaError::Unavailable(format!("engine is {state}"))),
        }
    }

    pub async fn pause(&self, id: JobId) -> EngineResult<Job> {
        self.operator_context().await?.pause(id).await
    }

    pub async fn resume(&self, id: JobId) -> EngineResult<Job> {
        self.operator_context().await?.resume(id).await
    }

    pub async fn requeue(&self, id: JobId) -> EngineResult<Job> {
        self.operator_context().await?.requeue(id).await
    }

    pub async fn job(&self, id: JobId) -> EngineResult<Option<Job>> {
        self.operator_context().await?.job(id).await
    }

    pub async fn list(&self, query: &JobQuery, limit: usize) -> EngineResult<Vec<Job>> {
        self.operator_context().await?.list(query, limit).await
    }

    pub async fn stats(&self) -> EngineResult<JobStats> {
        self.operator_context().await?.stats().await
    }

    pub async fn purge_finished(
        &self,
        older_than: std::time::Duration,
        limit: usize,
    ) -> EngineResult<usize> {
        self.operator_context()
            .await?
            .purge_finished(older_than, limit)
            .await
    }

    /// Journaled sagas that never reached a terminal state. After a crash
    /// these are the instances that need remediation.
    pub async fn unfinished_sagas(&self) -> EngineResult<Vec<SagaInstance>> {
        let ctx = self.operator_context().await?;
        Ok(ctx.sagas().journal().list_active().await?)
    }

    async fn operator_context(&self) -> EngineResult<EngineContext> {
        self.inner.lock().await.context()
    }
}

impl core::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LifecycleManager").finish_non_exhaustive()
    }
}

/// Sagas are not resumed automatically; surface the ones left mid-flight.
async fn report_unfinished_sagas(ctx: &EngineContext) {
    match ctx.sagas().journal().list_active().await {
        Ok(unfinished) => {
            for instance in &unfinished {
                warn!(
                    saga_id = %instance.id,
                    saga = %instance.name,
                    status = %instance.status,
                    "saga journaled as unfinished; it may need remediation"
                );
            }
        }
        Err(e) => warn!(error = %e, "failed to list unfinished sagas"),
    }
}

fn install(inner: &mut Inner, ctx: EngineContext, pg: Option<PgPool>) {
    info!(
        worker_id = %ctx.worker_id(),
        store = ?ctx.config().store_backend,
        locks = ?ctx.config().lock_backend,
        "engine initialized"
    );
    inner.ctx = Some(ctx);
    inner.pg = pg;
    inner.state = LifecycleState::Initialized;
}

async fn connect_backends(config: EngineConfig) -> EngineResult<(EngineContext, Option<PgPool>)> {
    let needs_postgres = config.store_backend == StoreBackend::Postgres
        || config.lock_backend == LockBackend::Postgres;
    let pg = if needs_postgres {
        let url = config
            .database_url
            .as_deref()
            .ok_or_else(|| ConfigError::Missing(crate::config::ENV_DATABASE_URL.to_string()))?;
        Some(db::connect(url, config.pg_max_connections).await?)
    } else {
        None
    };

    let (store, journal): (SharedJobStore, Arc<dyn SagaJournal>) = match (&pg, config.store_backend) {
        (Some(pool), StoreBackend::Postgres) => {
            let store = PostgresJobStore::new(pool.clone());
            store.ensure_schema().await?;
            let journal = PostgresSagaJournal::new(pool.clone());
            journal.ensure_schema().await?;
            (Arc::new(store), Arc::new(journal))
        }
        _ => (
            Arc::new(InMemoryJobStore::new()),
            Arc::new(InMemorySagaJournal::new()),
        ),
    };

    let locks: SharedLockService = match (&pg, config.lock_backend) {
        (Some(pool), LockBackend::Postgres) => {
            let locks = PostgresLockService::new(pool.clone());
            locks.ensure_schema().await?;
            Arc::new(locks)
        }
        (_, LockBackend::Redis) => redis_locks(&config).await?,
        _ => Arc::new(InMemoryLockService::new()),
    };

    Ok((EngineContext::new(config, store, locks, journal), pg))
}

#[cfg(feature = "redis")]
async fn redis_locks(config: &EngineConfig) -> EngineResult<SharedLockService> {
    let url = config
        .redis_url
        .as_deref()
        .ok_or_else(|| ConfigError::Missing(crate::config::ENV_REDIS_URL.to_string()))?;
    let locks = crate::lock::RedisLockService::connect(url).await?;
    Ok(Arc::new(locks))
}

#[cfg(not(feature = "redis"))]
async fn redis_locks(_config: &EngineConfig) -> EngineResult<SharedLockService> {
    Err(ConfigError::InvalidValue {
        name: crate::config::ENV_LOCK_BACKEND.to_string(),
        reason: "redis lock backend requires the `redis` feature".to_string(),
    }
    .into())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl-C"),
        _ = terminate => info!("received SIGTERM"),
    }
}
