//! Saga instance and step records (what the journal persists).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use forgeq_core::{SagaId, SagaStepError};

/// Overall status of a saga instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    Pending,
    Running,
    Compensating,
    Completed,
    Failed,
    Cancelled,
}

impl SagaStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Compensating => "compensating",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl core::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single step within a saga instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// Not applicable for this instance; never compensated
    Skipped,
    Compensating,
    Compensated,
    /// Rollback of this step failed; needs manual remediation
    CompensationFailed,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Compensating => "compensating",
            Self::Compensated => "compensated",
            Self::CompensationFailed => "compensation_failed",
        }
    }
}

impl core::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaStepRecord {
    pub index: usize,
    pub name: String,
    pub status: StepStatus,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SagaStepRecord {
    fn pending(index: usize, name: String) -> Self {
        Self {
            index,
            name,
            status: StepStatus::Pending,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// One execution of a multi-step workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaInstance {
    pub id: SagaId,
    pub name: String,
    pub status: SagaStatus,
    pub steps: Vec<SagaStepRecord>,
    /// The step failure that triggered compensation, if any
    pub failure: Option<SagaStepError>,
    /// Snapshot of the shared step context
    pub context: JsonValue,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SagaInstance {
    pub fn new<I, S>(id: SagaId, name: impl Into<String>, step_names: I, now: DateTime<Utc>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let steps = step_names
            .into_iter()
            .enumerate()
            .map(|(index, name)| SagaStepRecord::pending(index, name.into()))
            .collect();
        Self {
            id,
            name: name.into(),
            status: SagaStatus::Pending,
            steps,
            failure: None,
            context: JsonValue::Object(Default::default()),
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// True when at least one compensation failed and side effects may remain.
    pub fn needs_remediation(&self) -> bool {
        self.steps
            .iter()
            .any(|step| step.status == StepStatus::CompensationFailed)
    }

    pub fn step_statuses(&self) -> Vec<StepStatus> {
        self.steps.iter().map(|step| step.status).collect()
    }

    pub(crate) fn step_mut(&mut self, index: usize) -> Option<&mut SagaStepRecord> {
        self.steps.get_mut(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_instance_starts_pending_with_ordered_steps() {
        let instance = SagaInstance::new(SagaId::new(), "order", ["reserve", "charge"], Utc::now());
        assert_eq!(instance.status, SagaStatus::Pending);
        assert_eq!(instance.steps[1].index, 1);
        assert_eq!(instance.steps[1].name, "charge");
        assert_eq!(
            instance.step_statuses(),
            vec![StepStatus::Pending, StepStatus::Pending]
        );
        assert!(!instance.needs_remediation());
    }

    #[test]
    fn compensation_failure_flags_remediation() {
        let mut instance = SagaInstance::new(SagaId::new(), "order", ["reserve"], Utc::now());
        instance.steps[0].status = StepStatus::CompensationFailed;
        assert!(instance.needs_remediation());
    }

    #[test]
    fn instance_serializes_with_snake_case_statuses() {
        let mut instance = SagaInstance::new(SagaId::new(), "order", ["reserve"], Utc::now());
        instance.steps[0].status = StepStatus::CompensationFailed;
        let json = serde_json::to_value(&instance).unwrap();
        assert_eq!(json["status"], "pending");
        assert_eq!(json["steps"][0]["status"], "compensation_failed");

        let back: SagaInstance = serde_json::from_value(json).unwrap();
        assert_eq!(back, instance);
    }
}
