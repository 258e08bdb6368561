use forgeq_core::{AuditEvent, AuditHook};

/// Writes every [`AuditEvent`] to `tracing` under the `forgeq::audit` target.
///
/// Failures are logged at `warn`/`error`, everything else at `info`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditHook;

impl TracingAuditHook {
    pub fn new() -> Self {
        Self
    }
}

impl AuditHook for TracingAuditHook {
    fn record(&self, event: &AuditEvent) {
        match event {
            AuditEvent::JobEnqueued { job_id, job_type } => {
                ::tracing::info!(target: "forgeq::audit", %job_id, %job_type, "job enqueued");
            }
            AuditEvent::JobStarted {
                job_id,
                job_type,
                attempt,
                worker,
            } => {
                ::tracing::info!(target: "forgeq::audit", %job_id, %job_type, attempt, %worker, "job started");
            }
            AuditEvent::JobCompleted {
                job_id,
                job_type,
                attempt,
                elapsed,
            } => {
                ::tracing::info!(
                    target: "forgeq::audit",
                    %job_id,
                    %job_type,
                    attempt,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "job completed"
                );
            }
            AuditEvent::JobRetryScheduled {
                job_id,
                job_type,
                attempt,
                error,
            } => {
                ::tracing::warn!(target: "forgeq::audit", %job_id, %job_type, attempt, %error, "job retry scheduled");
            }
            AuditEvent::JobFailed {
                job_id,
                job_type,
                attempt,
                error,
            } => {
                ::tracing::error!(target: "forgeq::audit", %job_id, %job_type, attempt, %error, "job failed");
            }
            AuditEvent::SagaStarted {
                saga_id,
                name,
                steps,
            } => {
                ::tracing::info!(target: "forgeq::audit", %saga_id, saga = %name, steps, "saga started");
            }
            AuditEvent::SagaStepCompleted {
                saga_id,
                step_index,
                step_name,
            } => {
                ::tracing::info!(target: "forgeq::audit", %saga_id, step_index, step = %step_name, "saga step completed");
            }
            AuditEvent::SagaStepSkipped {
                saga_id,
                step_index,
                step_name,
            } => {
                ::tracing::info!(target: "forgeq::audit", %saga_id, step_index, step = %step_name, "saga step skipped");
            }
            AuditEvent::SagaStepFailed {
                saga_id,
                step_index,
                step_name,
                error,
            } => {
                ::tracing::warn!(target: "forgeq::audit", %saga_id, step_index, step = %step_name, %error, "saga step failed");
            }
            AuditEvent::SagaStepCompensated {
                saga_id,
                step_index,
                step_name,
            } => {
                ::tracing::info!(target: "forgeq::audit", %saga_id, step_index, step = %step_name, "saga step compensated");
            }
            AuditEvent::SagaCompensationFailed {
                saga_id,
                step_index,
                step_name,
                error,
            } => {
                ::tracing::error!(
                    target: "forgeq::audit",
                    %saga_id,
                    step_index,
                    step = %step_name,
                    %error,
                    "saga compensation failed; manual remediation required"
                );
            }
            AuditEvent::SagaFinished {
                saga_id,
                name,
                status,
            } => {
                ::tracing::info!(target: "forgeq::audit", %saga_id, saga = %name, %status, "saga finished");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use forgeq_core::{JobId, SharedAuditHook, WorkerId};

    use super::*;

    #[test]
    fn records_every_event_kind_without_a_subscriber() {
        let hook: SharedAuditHook = Arc::new(TracingAuditHook::new());
        let job_id = JobId::new();
        hook.record(&AuditEvent::JobEnqueued {
            job_id,
            job_type: "email".into(),
        });
        hook.record(&AuditEvent::JobStarted {
            job_id,
            job_type: "email".into(),
            attempt: 1,
            worker: WorkerId::new("w-1"),
        });
        hook.record(&AuditEvent::JobCompleted {
            job_id,
            job_type: "email".into(),
            attempt: 1,
            elapsed: Duration::from_millis(12),
        });
    }
}
