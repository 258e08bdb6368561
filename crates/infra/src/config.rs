//! Engine configuration.
//!
//! Defaults suit local development against in-memory backends. Production
//! deployments set the `FORGEQ_*` environment variables (plus `DATABASE_URL` /
//! `REDIS_URL`) and call [`EngineConfig::from_env`].

use core::str::FromStr;
use std::time::Duration;

use forgeq_core::clock::MAX_WINDOW;
use forgeq_core::{BackoffPolicy, ConfigError, DEFAULT_MAX_ATTEMPTS, WorkerId};

pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_REDIS_URL: &str = "REDIS_URL";
pub const ENV_STORE_BACKEND: &str = "FORGEQ_STORE_BACKEND";
pub const ENV_LOCK_BACKEND: &str = "FORGEQ_LOCK_BACKEND";
pub const ENV_WORKER_ID: &str = "FORGEQ_WORKER_ID";
pub const ENV_MAX_WORKERS: &str = "FORGEQ_MAX_WORKERS";
pub const ENV_POLL_INTERVAL_MS: &str = "FORGEQ_POLL_INTERVAL_MS";
pub const ENV_DRAIN_TIMEOUT_MS: &str = "FORGEQ_DRAIN_TIMEOUT_MS";
pub const ENV_JOB_LEASE_MS: &str = "FORGEQ_JOB_LEASE_MS";
pub const ENV_DEFAULT_MAX_ATTEMPTS: &str = "FORGEQ_DEFAULT_MAX_ATTEMPTS";
pub const ENV_BACKOFF_BASE_MS: &str = "FORGEQ_BACKOFF_BASE_MS";
pub const ENV_BACKOFF_MAX_MS: &str = "FORGEQ_BACKOFF_MAX_MS";
pub const ENV_PG_MAX_CONNECTIONS: &str = "FORGEQ_PG_MAX_CONNECTIONS";

/// Where jobs (and saga journals) are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreBackend {
    #[default]
    Memory,
    Postgres,
}

impl FromStr for StoreBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "in-memory" => Ok(Self::Memory),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            other => Err(ConfigError::InvalidValue {
                name: ENV_STORE_BACKEND.to_string(),
                reason: format!("unknown store backend `{other}`"),
            }),
        }
    }
}

/// Which lock service backs singleton execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockBackend {
    #[default]
    Memory,
    Postgres,
    Redis,
}

impl FromStr for LockBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "in-memory" => Ok(Self::Memory),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "redis" => Ok(Self::Redis),
            other => Err(ConfigError::InvalidValue {
                name: ENV_LOCK_BACKEND.to_string(),
                reason: format!("unknown lock backend `{other}`"),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Identity this process claims jobs and locks under
    pub worker_id: WorkerId,
    pub store_backend: StoreBackend,
    pub lock_backend: LockBackend,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    /// Process-wide ceiling on concurrently executing jobs
    pub max_workers: usize,
    pub poll_interval: Duration,
    /// How long shutdown waits for in-flight jobs
    pub drain_timeout: Duration,
    /// Lease granted on claim; renewed by heartbeats at half this period
    pub job_lease: Duration,
    pub default_max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub pg_max_connections: u32,
    /// Max expired leases recovered per scheduler cycle
    pub lease_recovery_batch: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_id: WorkerId::generate(),
            store_backend: StoreBackend::Memory,
            lock_backend: LockBackend::Memory,
            database_url: None,
            redis_url: None,
            max_workers: 16,
            poll_interval: Duration::from_millis(500),
            drain_timeout: Duration::from_secs(30),
            job_lease: Duration::from_secs(60),
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: BackoffPolicy::default(),
            pg_max_connections: 10,
            lease_recovery_batch: 100,
        }
    }
}

impl EngineConfig {
    /// Load from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load using an arbitrary variable lookup (the environment, a map in tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        if let Some(value) = get(ENV_STORE_BACKEND) {
            config.store_backend = value.parse()?;
        }
        if let Some(value) = get(ENV_LOCK_BACKEND) {
            config.lock_backend = value.parse()?;
        }
        config.database_url = get(ENV_DATABASE_URL);
        config.redis_url = get(ENV_REDIS_URL);
        if let Some(value) = get(ENV_WORKER_ID) {
            config.worker_id = WorkerId::new(value);
        }
        if let Some(value) = get(ENV_MAX_WORKERS) {
            config.max_workers = parse_number(ENV_MAX_WORKERS, &value)?;
        }
        if let Some(value) = get(ENV_POLL_INTERVAL_MS) {
            config.poll_interval = parse_millis(ENV_POLL_INTERVAL_MS, &value)?;
        }
        if let Some(value) = get(ENV_DRAIN_TIMEOUT_MS) {
            config.drain_timeout = parse_millis(ENV_DRAIN_TIMEOUT_MS, &value)?;
        }
        if let Some(value) = get(ENV_JOB_LEASE_MS) {
            config.job_lease = parse_millis(ENV_JOB_LEASE_MS, &value)?;
        }
        if let Some(value) = get(ENV_DEFAULT_MAX_ATTEMPTS) {
            config.default_max_attempts = parse_number(ENV_DEFAULT_MAX_ATTEMPTS, &value)?;
        }
        if let Some(value) = get(ENV_BACKOFF_BASE_MS) {
            config.backoff.base_delay = parse_millis(ENV_BACKOFF_BASE_MS, &value)?;
        }
        if let Some(value) = get(ENV_BACKOFF_MAX_MS) {
            config.backoff.max_delay = parse_millis(ENV_BACKOFF_MAX_MS, &value)?;
        }
        if let Some(value) = get(ENV_PG_MAX_CONNECTIONS) {
            config.pg_max_connections = parse_number(ENV_PG_MAX_CONNECTIONS, &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(invalid(ENV_MAX_WORKERS, "must be at least 1"));
        }
        if self.poll_interval.is_zero() {
            return Err(invalid(ENV_POLL_INTERVAL_MS, "must be greater than zero"));
        }
        if self.job_lease.is_zero() {
            return Err(invalid(ENV_JOB_LEASE_MS, "must be greater than zero"));
        }
        for (name, window) in [
            (ENV_POLL_INTERVAL_MS, self.poll_interval),
            (ENV_DRAIN_TIMEOUT_MS, self.drain_timeout),
            (ENV_JOB_LEASE_MS, self.job_lease),
        ] {
            if window > MAX_WINDOW {
                return Err(invalid(name, "exceeds the longest supported window"));
            }
        }
        if self.default_max_attempts == 0 {
            return Err(invalid(ENV_DEFAULT_MAX_ATTEMPTS, "must be at least 1"));
        }
        if let Err(reason) = self.backoff.check() {
            let name = if self.backoff.base_delay > self.backoff.max_delay {
                ENV_BACKOFF_BASE_MS
            } else {
                ENV_BACKOFF_MAX_MS
            };
            return Err(invalid(name, reason));
        }
        if self.worker_id.as_str().trim().is_empty() {
            return Err(invalid(ENV_WORKER_ID, "must not be empty"));
        }

        let needs_postgres = self.store_backend == StoreBackend::Postgres
            || self.lock_backend == LockBackend::Postgres;
        if needs_postgres {
            if self.database_url.is_none() {
                return Err(ConfigError::Missing(ENV_DATABASE_URL.to_string()));
            }
            if self.pg_max_connections == 0 {
                return Err(invalid(ENV_PG_MAX_CONNECTIONS, "must be at least 1"));
            }
        }
        if self.lock_backend == LockBackend::Redis {
            if !cfg!(feature = "redis") {
                return Err(invalid(
                    ENV_LOCK_BACKEND,
                    "redis lock backend requires the `redis` feature",
                ));
            }
            if self.redis_url.is_none() {
                return Err(ConfigError::Missing(ENV_REDIS_URL.to_string()));
            }
        }
        Ok(())
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<WorkerId>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_store_backend(mut self, backend: StoreBackend) -> Self {
        self.store_backend = backend;
        self
    }

    pub fn with_lock_backend(mut self, backend: LockBackend) -> Self {
        self.lock_backend = backend;
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_job_lease(mut self, lease: Duration) -> Self {
        self.job_lease = lease;
        self
    }

    pub fn with_default_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_pg_max_connections(mut self, max_connections: u32) -> Self {
        self.pg_max_connections = max_connections;
        self
    }
}

fn invalid(name: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_number<T: FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(name, &format!("`{value}` is not a valid number")))
}

fn parse_millis(name: &str, value: &str) -> Result<Duration, ConfigError> {
    parse_number::<u64>(name, value).map(Duration::from_millis)
}
