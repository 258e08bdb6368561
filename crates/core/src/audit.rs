//! Lifecycle events emitted for logging/audit collaborators.
//!
//! The engine reports what happened; deciding whether it was allowed is the
//! calling application's job.

use std::sync::Arc;
use std::time::Duration;

use crate::id::{JobId, SagaId, WorkerId};

#[derive(Debug, Clone, PartialEq)]
pub enum AuditEvent {
    JobEnqueued {
        job_id: JobId,
        job_type: String,
    },
    JobStarted {
        job_id: JobId,
        job_type: String,
        attempt: u32,
        worker: WorkerId,
    },
    JobCompleted {
        job_id: JobId,
        job_type: String,
        attempt: u32,
        elapsed: Duration,
    },
    JobRetryScheduled {
        job_id: JobId,
        job_type: String,
        attempt: u32,
        error: String,
    },
    JobFailed {
        job_id: JobId,
        job_type: String,
        attempt: u32,
        error: String,
    },
    SagaStarted {
        saga_id: SagaId,
        name: String,
        steps: usize,
    },
    SagaStepCompleted {
        saga_id: SagaId,
        step_index: usize,
        step_name: String,
    },
    SagaStepSkipped {
        saga_id: SagaId,
        step_index: usize,
        step_name: String,
    },
    SagaStepFailed {
        saga_id: SagaId,
        step_index: usize,
        step_name: String,
        error: String,
    },
    SagaStepCompensated {
        saga_id: SagaId,
        step_index: usize,
        step_name: String,
    },
    SagaCompensationFailed {
        saga_id: SagaId,
        step_index: usize,
        step_name: String,
        error: String,
    },
    SagaFinished {
        saga_id: SagaId,
        name: String,
        status: String,
    },
}

/// Receiver of [`AuditEvent`]s. Must not block.
pub trait AuditHook: Send + Sync {
    fn record(&self, event: &AuditEvent);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAuditHook;

impl AuditHook for NoopAuditHook {
    fn record(&self, _event: &AuditEvent) {}
}

impl<H> AuditHook for Arc<H>
where
    H: AuditHook + ?Sized,
{
    fn record(&self, event: &AuditEvent) {
        (**self).record(event)
    }
}

/// Shared hook handle.
pub type SharedAuditHook = Arc<dyn AuditHook>;

/// Keeps every event in memory; useful for assertions and debugging.
#[derive(Debug, Default)]
pub struct RecordingAuditHook {
    events: std::sync::Mutex<Vec<AuditEvent>>,
}

impl RecordingAuditHook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of recorded events, oldest first.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl AuditHook for RecordingAuditHook {
    fn record(&self, event: &AuditEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
