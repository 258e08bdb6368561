//! Processor registry: job type -> handler + execution policy.
//!
//! Built once at startup and frozen (shared behind an `Arc`) when the engine
//! starts. Registering a type twice is a configuration error, never an
//! overwrite.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use thiserror::Error;

use forgeq_core::clock::MAX_WINDOW;
use forgeq_core::{
    BackoffPolicy, ConfigError, DatabaseError, FailureKind, JobId, LockAcquisitionError, WorkerId,
};
use forgeq_saga::{SagaError, SagaOrchestrator};

pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30);

/// Outcome of a failed processor run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    /// Retry with backoff while attempts remain.
    #[error("recoverable: {0}")]
    Recoverable(String),

    /// Fail the job immediately.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn recoverable(msg: impl Into<String>) -> Self {
        Self::Recoverable(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Recoverable(_) => FailureKind::Recoverable,
            Self::Permanent(_) => FailureKind::Permanent,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Recoverable(msg) | Self::Permanent(msg) => msg,
        }
    }
}

impl From<DatabaseError> for HandlerError {
    fn from(err: DatabaseError) -> Self {
        Self::Recoverable(err.to_string())
    }
}

impl From<LockAcquisitionError> for HandlerError {
    fn from(err: LockAcquisitionError) -> Self {
        Self::Recoverable(err.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Permanent(format!("invalid payload: {err}"))
    }
}

impl From<SagaError> for HandlerError {
    fn from(err: SagaError) -> Self {
        match err {
            SagaError::Journal(_) | SagaError::Unavailable(_) => Self::Recoverable(err.to_string()),
            other => Self::Permanent(other.to_string()),
        }
    }
}

/// Execution policy of one job type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPolicy {
    /// Concurrent executions of this type within one process.
    pub max_concurrency: usize,
    /// Overrides the engine default when set.
    pub max_attempts: Option<u32>,
    /// Overrides the engine default when set.
    pub backoff: Option<BackoffPolicy>,
    /// Run at most one job of this type across all processes, guarded by the
    /// lock `job:<type>`.
    pub singleton: bool,
    /// TTL of the singleton lock; renewed at half this interval. Keep it above
    /// the expected execution time.
    pub lock_ttl: Duration,
    pub timeout: Option<Duration>,
}

impl Default for JobPolicy {
    fn default() -> Self {
        Self {
            max_concurrency: 1,
            max_attempts: None,
            backoff: None,
            singleton: false,
            lock_ttl: DEFAULT_LOCK_TTL,
            timeout: None,
        }
    }
}

impl JobPolicy {
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn singleton(mut self) -> Self {
        self.singleton = true;
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Permits per process: singletons never run twice in one process either.
    pub fn effective_concurrency(&self) -> usize {
        if self.singleton { 1 } else { self.max_concurrency }
    }

    pub fn validate(&self, job_type: &str) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidPolicy {
            job_type: job_type.to_string(),
            reason: reason.to_string(),
        };
        if job_type.trim().is_empty() {
            return Err(invalid("job type must not be empty"));
        }
        if self.max_concurrency == 0 {
            return Err(invalid("max_concurrency must be at least 1"));
        }
        if self.max_attempts == Some(0) {
            return Err(invalid("max_attempts must be at least 1"));
        }
        if self.lock_ttl.is_zero() {
            return Err(invalid("lock_ttl must be positive"));
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(invalid("timeout must be positive"));
        }
        if self.lock_ttl > MAX_WINDOW || self.timeout.is_some_and(|t| t > MAX_WINDOW) {
            return Err(invalid("lock_ttl and timeout must not exceed the longest supported window"));
        }
        if let Some(backoff) = &self.backoff {
            backoff.check().map_err(invalid)?;
        }
        Ok(())
    }
}

/// What a processor sees of the job it runs.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub job_type: String,
    pub payload: serde_json::Value,
    /// 1-based attempt number.
    pub attempt: u32,
    pub max_attempts: u32,
    pub worker: WorkerId,
    pub sagas: SagaOrchestrator,
}

impl JobContext {
    /// Decode the payload. A payload that does not fit is a permanent failure.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

#[async_trait::async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, ctx: JobContext) -> Result<(), HandlerError>;
}

/// Adapts an async closure into a [`JobProcessor`].
pub struct FnProcessor<F> {
    f: F,
}

impl<F> FnProcessor<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait::async_trait]
impl<F, Fut> JobProcessor for FnProcessor<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn process(&self, ctx: JobContext) -> Result<(), HandlerError> {
        (self.f)(ctx).await
    }
}

#[derive(Clone)]
pub(crate) struct Registration {
    pub(crate) processor: Arc<dyn JobProcessor>,
    pub(crate) policy: JobPolicy,
}

#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    entries: HashMap<String, Registration>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P>(
        &mut self,
        job_type: impl Into<String>,
        processor: P,
        policy: JobPolicy,
    ) -> Result<(), ConfigError>
    where
        P: JobProcessor + 'static,
    {
        self.register_shared(job_type, Arc::new(processor), policy)
    }

    pub fn register_fn<F, Fut>(
        &mut self,
        job_type: impl Into<String>,
        policy: JobPolicy,
        f: F,
    ) -> Result<(), ConfigError>
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.register(job_type, FnProcessor::new(f), policy)
    }

    pub fn register_shared(
        &mut self,
        job_type: impl Into<String>,
        processor: Arc<dyn JobProcessor>,
        policy: JobPolicy,
    ) -> Result<(), ConfigError> {
        let job_type = job_type.into();
        policy.validate(&job_type)?;
        if self.entries.contains_key(&job_type) {
            return Err(ConfigError::DuplicateJobType(job_type));
        }
        self.entries
            .insert(job_type, Registration { processor, policy });
        Ok(())
    }

    /// Move every registration of `other` into `self`, failing on the first
    /// type both define.
    pub fn merge(&mut self, other: ProcessorRegistry) -> Result<(), ConfigError> {
        for (job_type, registration) in other.entries {
            if self.entries.contains_key(&job_type) {
                return Err(ConfigError::DuplicateJobType(job_type));
            }
            self.entries.insert(job_type, registration);
        }
        Ok(())
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobProcessor>> {
        self.entries.get(job_type).map(|r| r.processor.clone())
    }

    pub fn policy(&self, job_type: &str) -> Option<&JobPolicy> {
        self.entries.get(job_type).map(|r| &r.policy)
    }

    pub(crate) fn registration(&self, job_type: &str) -> Option<&Registration> {
        self.entries.get(job_type)
    }

    /// Registered types, sorted.
    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.entries.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.entries.contains_key(job_type)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl core::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}
