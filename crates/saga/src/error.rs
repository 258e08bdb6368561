use thiserror::Error;

use forgeq_core::{DatabaseError, SagaStepError};

use crate::instance::SagaInstance;

#[derive(Debug, Error)]
pub enum SagaError {
    /// A step failed; compensation has already run. Inspect the instance for
    /// per-step outcomes.
    #[error("{source}")]
    StepFailed {
        source: SagaStepError,
        instance: Box<SagaInstance>,
    },

    #[error("saga {} was cancelled", .instance.id)]
    Cancelled { instance: Box<SagaInstance> },

    #[error("saga can no longer be cancelled")]
    NotCancellable,

    #[error("saga journal failure: {0}")]
    Journal(#[from] DatabaseError),

    /// No orchestrator is available (engine not initialized or already stopped).
    #[error("saga orchestrator unavailable: {0}")]
    Unavailable(String),
}

impl SagaError {
    /// The final instance, when the run got far enough to produce one.
    pub fn instance(&self) -> Option<&SagaInstance> {
        match self {
            Self::StepFailed { instance, .. } | Self::Cancelled { instance } => Some(instance),
            Self::NotCancellable | Self::Journal(_) | Self::Unavailable(_) => None,
        }
    }
}
