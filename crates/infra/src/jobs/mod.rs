//! Background job system: storage, processors, scheduling and the worker pool.
//!
//! ## Components
//!
//! - `JobStore`: durable queue with atomic claim and compare-and-set transitions
//! - `ProcessorRegistry`: job type -> processor + execution policy
//! - `Scheduler`: recurring schedules, backoff promotion, lease recovery
//! - `WorkerPool`: claims due jobs within capacity and supervises handlers

pub mod pool;
pub mod postgres;
pub mod registry;
pub mod scheduler;
pub mod store;

pub use pool::{DrainReport, WorkerPool};
pub use postgres::PostgresJobStore;
pub use registry::{
    DEFAULT_LOCK_TTL, FnProcessor, HandlerError, JobContext, JobPolicy, JobProcessor,
    ProcessorRegistry,
};
pub use scheduler::{CycleReport, Scheduler};
pub use store::{InMemoryJobStore, JobQuery, JobStats, JobStore, SharedJobStore};
