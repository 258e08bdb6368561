//! `forgeq-core`: engine foundation building blocks.
//!
//! Pure types only: identifiers, the job state machine, retry policies,
//! schedule definitions and the error taxonomy. No I/O happens here.

pub mod audit;
pub mod backoff;
pub mod clock;
pub mod error;
pub mod id;
pub mod job;
pub mod schedule;

pub use audit::{AuditEvent, AuditHook, NoopAuditHook, RecordingAuditHook, SharedAuditHook};
pub use backoff::{BackoffPolicy, BackoffStrategy};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{
    ConfigError, DatabaseError, EngineError, EngineResult, LockAcquisitionError, LockFailure,
    SagaStepError, TransitionError,
};
pub use id::{JobId, LockToken, SagaId, WorkerId};
pub use job::{
    DEFAULT_MAX_ATTEMPTS, EnqueueOptions, FailureKind, Job, JobAttemptRecord, JobStatus,
};
pub use schedule::{ScheduleDefinition, Trigger};
