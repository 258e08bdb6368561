//! Engine error model.
//!
//! Each failure family is its own type so callers can match on exactly what
//! went wrong; [`EngineError`] is the umbrella returned from the public engine
//! surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::id::SagaId;
use crate::job::JobStatus;

/// Result type used across the engine surface.
pub type EngineResult<T> = Result<T, EngineError>;

/// Failure of the backing job/lock/saga store.
///
/// Retried by the caller layer with backoff; never silently swallowed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DatabaseError {
    /// The store could not be reached or the operation failed in transit.
    #[error("store unavailable during {operation}: {message}")]
    Unavailable { operation: String, message: String },

    /// A uniqueness or conditional-write conflict.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The addressed record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A stored record could not be decoded.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl DatabaseError {
    pub fn unavailable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unavailable {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// Why a lock could not be acquired or renewed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LockFailure {
    /// Another holder owns a non-expired record.
    #[error("held by {holder} until {expires_at}")]
    Held {
        holder: String,
        expires_at: DateTime<Utc>,
    },

    /// The presented token no longer owns the lock (expired or taken over).
    #[error("lock token is stale")]
    StaleToken,

    /// The requested TTL cannot be turned into an expiry time.
    #[error("ttl of {0:?} is out of range")]
    TtlOutOfRange(std::time::Duration),

    /// The lock backend failed.
    #[error(transparent)]
    Store(#[from] DatabaseError),
}

/// Lock contention. Recoverable: callers retry later or yield.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("failed to acquire lock `{key}`: {cause}")]
pub struct LockAcquisitionError {
    pub key: String,
    #[source]
    pub cause: LockFailure,
}

impl LockAcquisitionError {
    pub fn new(key: impl Into<String>, cause: impl Into<LockFailure>) -> Self {
        Self {
            key: key.into(),
            cause: cause.into(),
        }
    }

    pub fn held(key: impl Into<String>, holder: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self::new(
            key,
            LockFailure::Held {
                holder: holder.into(),
                expires_at,
            },
        )
    }

    pub fn stale(key: impl Into<String>) -> Self {
        Self::new(key, LockFailure::StaleToken)
    }

    pub fn ttl_out_of_range(key: impl Into<String>, ttl: std::time::Duration) -> Self {
        Self::new(key, LockFailure::TtlOutOfRange(ttl))
    }
}

/// Business-logic failure inside a saga step. Triggers compensation.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("saga {saga_id} step {step_index} (`{step_name}`) failed: {message}")]
pub struct SagaStepError {
    pub saga_id: SagaId,
    pub step_index: usize,
    pub step_name: String,
    pub message: String,
}

/// Startup/registration misconfiguration. Fatal: aborts startup.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("job type `{0}` is already registered")]
    DuplicateJobType(String),

    #[error("schedule `{0}` is already registered")]
    DuplicateSchedule(String),

    #[error("malformed schedule `{name}`: {reason}")]
    MalformedSchedule { name: String, reason: String },

    #[error("invalid policy for job type `{job_type}`: {reason}")]
    InvalidPolicy { job_type: String, reason: String },

    #[error("invalid value for {name}: {reason}")]
    InvalidValue { name: String, reason: String },

    #[error("missing required setting {0}")]
    Missing(String),

    #[error("engine is {actual}, expected {expected}")]
    InvalidState { expected: String, actual: String },
}

/// A job transition the state machine does not allow.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid job transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Umbrella error for the engine surface.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    LockAcquisition(#[from] LockAcquisitionError),

    #[error(transparent)]
    SagaStep(#[from] SagaStepError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl EngineError {
    /// Whether retrying the same operation later can succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Database(_) | Self::LockAcquisition(_))
    }
}
