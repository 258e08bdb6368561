//! Saga orchestrator.
//!
//! Runs steps strictly in order. When a step fails (or the saga is cancelled
//! at a step boundary) every step that completed is compensated in reverse
//! order; a failing compensation is recorded and the rollback carries on with
//! the earlier steps.

use std::any::Any;
use std::sync::Arc;

use tracing::{debug, info, warn};

use forgeq_core::{
    AuditEvent, DatabaseError, NoopAuditHook, SagaId, SagaStepError, SharedAuditHook,
    SharedClock, SystemClock,
};

use crate::cancel::SagaCancelHandle;
use crate::error::SagaError;
use crate::instance::{SagaInstance, SagaStatus, StepStatus};
use crate::journal::{InMemorySagaJournal, SagaJournal};
use crate::step::{SagaContext, SagaStep};

/// A saga ready to run: a name, ordered steps and the shared context.
pub struct Saga {
    id: SagaId,
    name: String,
    steps: Vec<Arc<dyn SagaStep>>,
    context: SagaContext,
    cancel: SagaCancelHandle,
}

impl Saga {
    pub fn new(name: impl Into<String>) -> Self {
        let id = SagaId::new();
        Self {
            id,
            name: name.into(),
            steps: Vec::new(),
            context: SagaContext::new(id),
            cancel: SagaCancelHandle::new(),
        }
    }

    pub fn from_steps(name: impl Into<String>, steps: Vec<Arc<dyn SagaStep>>) -> Self {
        let mut saga = Self::new(name);
        saga.steps = steps;
        saga
    }

    pub fn step(mut self, step: impl SagaStep + 'static) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    pub fn shared_step(mut self, step: Arc<dyn SagaStep>) -> Self {
        self.steps.push(step);
        self
    }

    pub fn id(&self) -> SagaId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Context handed to every step; seed input values here before running.
    pub fn context(&self) -> &SagaContext {
        &self.context
    }

    pub fn cancel_handle(&self) -> SagaCancelHandle {
        self.cancel.clone()
    }
}

impl core::fmt::Debug for Saga {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Saga")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("steps", &self.steps.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Execute,
    Compensate,
}

/// Drives sagas and journals every transition.
#[derive(Clone)]
pub struct SagaOrchestrator {
    journal: Arc<dyn SagaJournal>,
    hook: SharedAuditHook,
    clock: SharedClock,
}

impl SagaOrchestrator {
    pub fn new(journal: Arc<dyn SagaJournal>) -> Self {
        Self {
            journal,
            hook: Arc::new(NoopAuditHook),
            clock: Arc::new(SystemClock),
        }
    }

    /// Orchestrator backed by an [`InMemorySagaJournal`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemorySagaJournal::new()))
    }

    pub fn with_audit_hook(mut self, hook: SharedAuditHook) -> Self {
        self.hook = hook;
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn journal(&self) -> &Arc<dyn SagaJournal> {
        &self.journal
    }

    /// Build and run a saga from an ordered list of steps.
    pub async fn run_steps(
        &self,
        name: impl Into<String>,
        steps: Vec<Arc<dyn SagaStep>>,
    ) -> Result<SagaInstance, SagaError> {
        self.run(Saga::from_steps(name, steps)).await
    }

    /// Run a saga to a terminal state.
    ///
    /// Returns the COMPLETED instance, or an error carrying the FAILED or
    /// CANCELLED instance once compensation has finished.
    #[tracing::instrument(skip_all, fields(saga_id = %saga.id, saga = %saga.name))]
    pub async fn run(&self, saga: Saga) -> Result<SagaInstance, SagaError> {
        let Saga {
            id,
            name,
            steps,
            context,
            cancel,
        } = saga;

        let mut run = Run {
            orchestrator: self,
            instance: SagaInstance::new(
                id,
                name.clone(),
                steps.iter().map(|step| step.name().to_string()),
                self.clock.now(),
            ),
            context,
            journal_error: None,
        };
        run.persist().await;
        self.hook.record(&AuditEvent::SagaStarted {
            saga_id: id,
            name: name.clone(),
            steps: steps.len(),
        });
        info!(steps = steps.len(), "saga started");

        let mut failure: Option<SagaStepError> = None;
        let mut cancelled = cancel.is_requested();

        if !cancelled {
            run.instance.status = SagaStatus::Running;
            run.persist().await;

            for (index, step) in steps.iter().enumerate() {
                if cancel.is_requested() || (step.is_irreversible() && !cancel.seal()) {
                    cancelled = true;
                    break;
                }

                if !step.applies(&run.context).await {
                    run.mark(index, StepStatus::Skipped, None);
                    run.persist().await;
                    self.hook.record(&AuditEvent::SagaStepSkipped {
                        saga_id: id,
                        step_index: index,
                        step_name: step.name().to_string(),
                    });
                    debug!(step_index = index, step = step.name(), "saga step skipped");
                    continue;
                }

                run.mark(index, StepStatus::Running, None);
                run.persist().await;

                match invoke(step.clone(), run.context.clone(), Phase::Execute).await {
                    Ok(()) => {
                        run.mark(index, StepStatus::Completed, None);
                        run.persist().await;
                        self.hook.record(&AuditEvent::SagaStepCompleted {
                            saga_id: id,
                            step_index: index,
                            step_name: step.name().to_string(),
                        });
                        debug!(step_index = index, step = step.name(), "saga step completed");
                    }
                    Err(message) => {
                        warn!(step_index = index, step = step.name(), error = %message, "saga step failed");
                        run.mark(index, StepStatus::Failed, Some(message.clone()));
                        let error = SagaStepError {
                            saga_id: id,
                            step_index: index,
                            step_name: step.name().to_string(),
                            message,
                        };
                        run.instance.failure = Some(error.clone());
                        run.persist().await;
                        self.hook.record(&AuditEvent::SagaStepFailed {
                            saga_id: id,
                            step_index: index,
                            step_name: error.step_name.clone(),
                            error: error.message.clone(),
                        });
                        failure = Some(error);
                        break;
                    }
                }
            }

            if failure.is_none() && !cancelled && !cancel.seal() {
                cancelled = true;
            }
        }
        cancel.seal();

        if failure.is_some() || cancelled {
            run.compensate(&steps).await;
        }

        run.instance.status = if failure.is_some() {
            SagaStatus::Failed
        } else if cancelled {
            SagaStatus::Cancelled
        } else {
            SagaStatus::Completed
        };
        run.instance.finished_at = Some(self.clock.now());
        run.persist().await;
        if let Err(e) = self.journal.archive(&run.instance).await {
            warn!(error = %e, "failed to archive saga");
            run.journal_error.get_or_insert(e);
        }

        let status = run.instance.status;
        self.hook.record(&AuditEvent::SagaFinished {
            saga_id: id,
            name,
            status: status.to_string(),
        });
        if run.instance.needs_remediation() {
            warn!(%status, "saga finished with incomplete compensation");
        } else {
            info!(%status, "saga finished");
        }

        let Run {
            instance,
            journal_error,
            ..
        } = run;
        match (failure, status) {
            (Some(source), _) => Err(SagaError::StepFailed {
                source,
                instance: Box::new(instance),
            }),
            (None, SagaStatus::Cancelled) => Err(SagaError::Cancelled {
                instance: Box::new(instance),
            }),
            (None, _) => match journal_error {
                Some(e) => Err(SagaError::Journal(e)),
                None => Ok(instance),
            },
        }
    }
}

impl core::fmt::Debug for SagaOrchestrator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SagaOrchestrator")
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

/// Mutable state of one saga run.
struct Run<'a> {
    orchestrator: &'a SagaOrchestrator,
    instance: SagaInstance,
    context: SagaContext,
    journal_error: Option<DatabaseError>,
}

impl Run<'_> {
    fn mark(&mut self, index: usize, status: StepStatus, error: Option<String>) {
        let now = self.orchestrator.clock.now();
        if let Some(record) = self.instance.step_mut(index) {
            match status {
                StepStatus::Running | StepStatus::Compensating => {
                    record.started_at = Some(now);
                    record.finished_at = None;
                }
                _ => record.finished_at = Some(now),
            }
            record.status = status;
            if error.is_some() {
                record.error = error;
            }
        }
    }

    async fn persist(&mut self) {
        self.instance.updated_at = self.orchestrator.clock.now();
        self.instance.context = self.context.snapshot();
        if let Err(e) = self.orchestrator.journal.save(&self.instance).await {
            warn!(error = %e, "failed to journal saga transition");
            self.journal_error.get_or_insert(e);
        }
    }

    /// Compensate every COMPLETED step, last first.
    async fn compensate(&mut self, steps: &[Arc<dyn SagaStep>]) {
        let completed: Vec<usize> = self
            .instance
            .steps
            .iter()
            .filter(|record| record.status == StepStatus::Completed)
            .map(|record| record.index)
            .collect();

        for index in completed.into_iter().rev() {
            let Some(step) = steps.get(index) else {
                continue;
            };
            let saga_id = self.instance.id;

            self.instance.status = SagaStatus::Compensating;
            self.mark(index, StepStatus::Compensating, None);
            self.persist().await;

            match invoke(step.clone(), self.context.clone(), Phase::Compensate).await {
                Ok(()) => {
                    self.mark(index, StepStatus::Compensated, None);
                    self.orchestrator.hook.record(&AuditEvent::SagaStepCompensated {
                        saga_id,
                        step_index: index,
                        step_name: step.name().to_string(),
                    });
                    debug!(step_index = index, step = step.name(), "saga step compensated");
                }
                Err(message) => {
                    warn!(
                        step_index = index,
                        step = step.name(),
                        error = %message,
                        "saga compensation failed, continuing with earlier steps"
                    );
                    self.mark(index, StepStatus::CompensationFailed, Some(message.clone()));
                    self.orchestrator.hook.record(&AuditEvent::SagaCompensationFailed {
                        saga_id,
                        step_index: index,
                        step_name: step.name().to_string(),
                        error: message,
                    });
                }
            }
            self.persist().await;
        }
    }
}

/// Run one phase of a step in its own task so a panic becomes a step failure.
async fn invoke(step: Arc<dyn SagaStep>, ctx: SagaContext, phase: Phase) -> Result<(), String> {
    let handle = tokio::spawn(async move {
        match phase {
            Phase::Execute => step.execute(&ctx).await,
            Phase::Compensate => step.compensate(&ctx).await,
        }
    });
    match handle.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("{e:#}")),
        Err(join) if join.is_panic() => Err(format!("panicked: {}", panic_message(join.into_panic()))),
        Err(join) => Err(join.to_string()),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use forgeq_core::RecordingAuditHook;

    use super::*;
    use crate::step::FnStep;

    type Log = Arc<Mutex<Vec<String>>>;

    fn new_log() -> Log {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    /// Step that logs `do:<name>` / `undo:<name>`, optionally failing either phase.
    fn logged(name: &'static str, log: &Log, fail_action: bool, fail_compensation: bool) -> FnStep {
        let action_log = log.clone();
        let undo_log = log.clone();
        FnStep::new(name, move |_ctx| {
            let log = action_log.clone();
            async move {
                log.lock().unwrap().push(format!("do:{name}"));
                if fail_action {
                    anyhow::bail!("{name} exploded");
                }
                Ok(())
            }
        })
        .with_compensation(move |_ctx| {
            let log = undo_log.clone();
            async move {
                log.lock().unwrap().push(format!("undo:{name}"));
                if fail_compensation {
                    anyhow::bail!("could not undo {name}");
                }
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn successful_saga_completes_every_step_in_order() {
        let log = new_log();
        let journal = Arc::new(InMemorySagaJournal::new());
        let orchestrator = SagaOrchestrator::new(journal.clone());

        let saga = Saga::new("order")
            .step(logged("reserve", &log, false, false))
            .step(logged("charge", &log, false, false))
            .step(logged("ship", &log, false, false));

        let instance = orchestrator.run(saga).await.unwrap();

        assert_eq!(instance.status, SagaStatus::Completed);
        assert_eq!(instance.step_statuses(), vec![StepStatus::Completed; 3]);
        assert_eq!(entries(&log), vec!["do:reserve", "do:charge", "do:ship"]);
        assert!(instance.finished_at.is_some());

        let stored = journal.load(instance.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SagaStatus::Completed);
        assert!(journal.list_active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failing_middle_step_compensates_only_prior_steps() {
        let log = new_log();
        let orchestrator = SagaOrchestrator::in_memory();
        let saga = Saga::new("order")
            .step(logged("reserve", &log, false, false))
            .step(logged("charge", &log, true, false))
            .step(logged("ship", &log, false, false));
        let saga_id = saga.id();

        let err = orchestrator.run(saga).await.unwrap_err();
        let SagaError::StepFailed { source, instance } = err else {
            panic!("expected StepFailed");
        };

        assert_eq!(source.saga_id, saga_id);
        assert_eq!(source.step_index, 1);
        assert_eq!(source.step_name, "charge");
        assert!(source.message.contains("charge exploded"));
        assert_eq!(instance.status, SagaStatus::Failed);
        assert_eq!(
            instance.step_statuses(),
            vec![StepStatus::Compensated, StepStatus::Failed, StepStatus::Pending]
        );
        assert_eq!(instance.failure.as_ref(), Some(&source));
        assert_eq!(entries(&log), vec!["do:reserve", "do:charge", "undo:reserve"]);
        assert!(!instance.needs_remediation());
    }

    #[tokio::test]
    async fn compensation_continues_past_a_failing_compensation() {
        let log = new_log();
        let orchestrator = SagaOrchestrator::in_memory();
        let saga = Saga::new("transfer")
            .step(logged("debit", &log, false, false))
            .step(logged("credit", &log, false, true))
            .step(logged("notify", &log, false, false))
            .step(logged("settle", &log, true, false));

        let err = orchestrator.run(saga).await.unwrap_err();
        let instance = err.instance().unwrap();

        assert_eq!(
            entries(&log),
            vec![
                "do:debit",
                "do:credit",
                "do:notify",
                "do:settle",
                "undo:notify",
                "undo:credit",
                "undo:debit",
            ]
        );
        assert_eq!(
            instance.step_statuses(),
            vec![
                StepStatus::Compensated,
                StepStatus::CompensationFailed,
                StepStatus::Compensated,
                StepStatus::Failed,
            ]
        );
        assert_eq!(instance.status, SagaStatus::Failed);
        assert!(instance.needs_remediation());
        assert!(instance.steps[1].error.as_deref().unwrap().contains("could not undo credit"));
    }

    #[tokio::test]
    async fn skipped_steps_are_not_compensated() {
        let log = new_log();
        let orchestrator = SagaOrchestrator::in_memory();
        let saga = Saga::new("order")
            .step(logged("reserve", &log, false, false))
            .step(logged("gift_wrap", &log, false, false).when(|_| false))
            .step(logged("charge", &log, true, false));

        let err = orchestrator.run(saga).await.unwrap_err();
        let instance = err.instance().unwrap();

        assert_eq!(
            instance.step_statuses(),
            vec![StepStatus::Compensated, StepStatus::Skipped, StepStatus::Failed]
        );
        assert_eq!(entries(&log), vec!["do:reserve", "do:charge", "undo:reserve"]);
    }

    #[tokio::test]
    async fn compensations_see_values_produced_by_actions() {
        let seen = new_log();
        let seen_in_undo = seen.clone();
        let orchestrator = SagaOrchestrator::in_memory();

        let saga = Saga::new("order")
            .step(
                FnStep::new("reserve", |ctx| async move {
                    ctx.set("reservation", "res-7")?;
                    Ok(())
                })
                .with_compensation(move |ctx| {
                    let seen = seen_in_undo.clone();
                    async move {
                        let reservation: String = ctx.get("reservation").unwrap_or_default();
                        seen.lock().unwrap().push(reservation);
                        Ok(())
                    }
                }),
            )
            .step(FnStep::new("charge", |_ctx| async { anyhow::bail!("card declined") }));
        saga.context().set("customer", "c-1").unwrap();

        let err = orchestrator.run(saga).await.unwrap_err();

        assert_eq!(entries(&seen), vec!["res-7"]);
        let instance = err.instance().unwrap();
        assert_eq!(instance.context["customer"], "c-1");
        assert_eq!(instance.context["reservation"], "res-7");
    }

    #[tokio::test]
    async fn cancelled_before_start_runs_nothing() {
        let log = new_log();
        let orchestrator = SagaOrchestrator::in_memory();
        let saga = Saga::new("order").step(logged("reserve", &log, false, false));
        saga.cancel_handle().cancel().unwrap();

        let err = orchestrator.run(saga).await.unwrap_err();
        let SagaError::Cancelled { instance } = err else {
            panic!("expected Cancelled");
        };

        assert_eq!(instance.status, SagaStatus::Cancelled);
        assert_eq!(instance.step_statuses(), vec![StepStatus::Pending]);
        assert!(entries(&log).is_empty());
    }

    #[tokio::test]
    async fn cancellation_mid_run_compensates_completed_steps() {
        let log = new_log();
        let orchestrator = SagaOrchestrator::in_memory();
        let saga = Saga::new("order");
        let handle = saga.cancel_handle();
        let action_log = log.clone();

        let saga = saga
            .step(
                FnStep::new("reserve", move |_ctx| {
                    let handle = handle.clone();
                    let log = action_log.clone();
                    async move {
                        log.lock().unwrap().push("do:reserve".to_string());
                        handle.cancel()?;
                        Ok(())
                    }
                })
                .with_compensation({
                    let log = log.clone();
                    move |_ctx| {
                        let log = log.clone();
                        async move {
                            log.lock().unwrap().push("undo:reserve".to_string());
                            Ok(())
                        }
                    }
                }),
            )
            .step(logged("charge", &log, false, false));

        let err = orchestrator.run(saga).await.unwrap_err();
        let instance = err.instance().unwrap();

        assert!(matches!(err, SagaError::Cancelled { .. }));
        assert_eq!(
            instance.step_statuses(),
            vec![StepStatus::Compensated, StepStatus::Pending]
        );
        assert_eq!(entries(&log), vec!["do:reserve", "undo:reserve"]);
    }

    #[tokio::test]
    async fn cancel_is_refused_once_irreversible_work_started() {
        let outcomes = new_log();
        let orchestrator = SagaOrchestrator::in_memory();
        let saga = Saga::new("payout");
        let handle = saga.cancel_handle();
        let step_handle = handle.clone();
        let step_outcomes = outcomes.clone();

        let saga = saga
            .step(FnStep::new("wire_funds", |_ctx| async { Ok(()) }).irreversible())
            .step(FnStep::new("record", move |_ctx| {
                let handle = step_handle.clone();
                let outcomes = step_outcomes.clone();
                async move {
                    let refused = matches!(handle.cancel(), Err(SagaError::NotCancellable));
                    outcomes.lock().unwrap().push(format!("refused:{refused}"));
                    Ok(())
                }
            }));

        let instance = orchestrator.run(saga).await.unwrap();

        assert_eq!(instance.status, SagaStatus::Completed);
        assert_eq!(entries(&outcomes), vec!["refused:true"]);
        assert!(matches!(handle.cancel(), Err(SagaError::NotCancellable)));
    }

    #[tokio::test]
    async fn finished_saga_is_not_cancellable() {
        let orchestrator = SagaOrchestrator::in_memory();
        let saga = Saga::new("noop").step(FnStep::new("a", |_ctx| async { Ok(()) }));
        let handle = saga.cancel_handle();

        orchestrator.run(saga).await.unwrap();

        assert!(matches!(handle.cancel(), Err(SagaError::NotCancellable)));
    }

    #[tokio::test]
    async fn panicking_step_is_treated_as_a_failure() {
        let log = new_log();
        let orchestrator = SagaOrchestrator::in_memory();
        let saga = Saga::new("order")
            .step(logged("reserve", &log, false, false))
            .step(FnStep::new("explode", |_ctx| async {
                None::<()>.expect("handler bug");
                Ok(())
            }));

        let err = orchestrator.run(saga).await.unwrap_err();
        let SagaError::StepFailed { source, instance } = err else {
            panic!("expected StepFailed");
        };

        assert!(source.message.contains("handler bug"));
        assert_eq!(
            instance.step_statuses(),
            vec![StepStatus::Compensated, StepStatus::Failed]
        );
    }

    #[tokio::test]
    async fn audit_hook_sees_compensation_in_reverse_order() {
        let hook = Arc::new(RecordingAuditHook::new());
        let log = new_log();
        let orchestrator = SagaOrchestrator::in_memory().with_audit_hook(hook.clone());
        let saga = Saga::new("order")
            .step(logged("a", &log, false, false))
            .step(logged("b", &log, false, false))
            .step(logged("c", &log, true, false));

        let _ = orchestrator.run(saga).await;

        let compensated: Vec<usize> = hook
            .events()
            .into_iter()
            .filter_map(|event| match event {
                AuditEvent::SagaStepCompensated { step_index, .. } => Some(step_index),
                _ => None,
            })
            .collect();
        assert_eq!(compensated, vec![1, 0]);
        assert!(matches!(
            hook.events().last(),
            Some(AuditEvent::SagaFinished { status, .. }) if status == "failed"
        ));
    }

    #[derive(Debug, Default)]
    struct BrokenJournal;

    #[async_trait::async_trait]
    impl SagaJournal for BrokenJournal {
        async fn save(&self, _instance: &SagaInstance) -> Result<(), DatabaseError> {
            Err(DatabaseError::unavailable("save", "disk full"))
        }

        async fn load(&self, _id: SagaId) -> Result<Option<SagaInstance>, DatabaseError> {
            Ok(None)
        }

        async fn archive(&self, _instance: &SagaInstance) -> Result<(), DatabaseError> {
            Ok(())
        }

        async fn list_active(&self) -> Result<Vec<SagaInstance>, DatabaseError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn journal_failure_is_reported_instead_of_success() {
        let orchestrator = SagaOrchestrator::new(Arc::new(BrokenJournal));
        let saga = Saga::new("noop").step(FnStep::new("a", |_ctx| async { Ok(()) }));

        let err = orchestrator.run(saga).await.unwrap_err();
        assert!(matches!(err, SagaError::Journal(DatabaseError::Unavailable { .. })));
    }
}
