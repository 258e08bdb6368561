//! `forgeq-infra`: the running engine with its storage adapters, distributed locks,
//! the worker pool and the lifecycle manager.
//!
//! In-memory adapters serve tests and single-process deployments; Postgres
//! (and, with the `redis` feature, Redis for locks) back multi-process ones.
//! Processes coordinate only through the job store's atomic claim and the
//! lock service.

pub mod config;
pub mod db;
pub mod engine;
pub mod jobs;
pub mod lifecycle;
pub mod lock;
pub mod saga;

pub use config::{EngineConfig, LockBackend, StoreBackend};
pub use engine::EngineContext;
pub use jobs::{
    DrainReport, HandlerError, InMemoryJobStore, JobContext, JobPolicy, JobProcessor, JobQuery,
    JobStats, JobStore, PostgresJobStore, ProcessorRegistry, SharedJobStore,
};
pub use lifecycle::{LifecycleManager, LifecycleState, ShutdownReport};
pub use lock::{
    InMemoryLockService, LockGuard, LockRecord, LockService, PostgresLockService,
    SharedLockService, with_lock,
};
#[cfg(feature = "redis")]
pub use lock::RedisLockService;
pub use saga::PostgresSagaJournal;
