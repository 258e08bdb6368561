//! `forgeq-saga`: ordered multi-step workflows with automatic compensation.
//!
//! A [`Saga`] is an ordered list of [`SagaStep`]s sharing a [`SagaContext`].
//! The [`SagaOrchestrator`] runs them one after another; when a step fails,
//! completed steps are compensated in reverse order. Every transition is
//! written to a [`SagaJournal`].

pub mod cancel;
pub mod error;
pub mod instance;
pub mod journal;
pub mod orchestrator;
pub mod step;

pub use cancel::SagaCancelHandle;
pub use error::SagaError;
pub use instance::{SagaInstance, SagaStatus, SagaStepRecord, StepStatus};
pub use journal::{InMemorySagaJournal, SagaJournal};
pub use orchestrator::{Saga, SagaOrchestrator};
pub use step::{FnStep, SagaContext, SagaStep};
