//! Saga journal: durable record of every saga transition.

use std::collections::HashMap;

use tokio::sync::RwLock;

use forgeq_core::{DatabaseError, SagaId};

use crate::instance::SagaInstance;

/// Persists saga instances as they progress.
#[async_trait::async_trait]
pub trait SagaJournal: Send + Sync {
    /// Upsert the current state of an instance.
    async fn save(&self, instance: &SagaInstance) -> Result<(), DatabaseError>;

    /// Load an instance, active or archived.
    async fn load(&self, id: SagaId) -> Result<Option<SagaInstance>, DatabaseError>;

    /// Move a terminal instance out of the active set.
    async fn archive(&self, instance: &SagaInstance) -> Result<(), DatabaseError>;

    /// Instances that have not reached a terminal state (e.g. interrupted by a crash).
    async fn list_active(&self) -> Result<Vec<SagaInstance>, DatabaseError>;
}

/// In-memory journal (tests/dev).
#[derive(Debug, Default)]
pub struct InMemorySagaJournal {
    active: RwLock<HashMap<SagaId, SagaInstance>>,
    archived: RwLock<HashMap<SagaId, SagaInstance>>,
}

impl InMemorySagaJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn archived_count(&self) -> usize {
        self.archived.read().await.len()
    }
}

#[async_trait::async_trait]
impl SagaJournal for InMemorySagaJournal {
    async fn save(&self, instance: &SagaInstance) -> Result<(), DatabaseError> {
        if self.archived.read().await.contains_key(&instance.id) {
            return Err(DatabaseError::conflict(format!(
                "saga {} is archived",
                instance.id
            )));
        }
        self.active
            .write()
            .await
            .insert(instance.id, instance.clone());
        Ok(())
    }

    async fn load(&self, id: SagaId) -> Result<Option<SagaInstance>, DatabaseError> {
        if let Some(instance) = self.active.read().await.get(&id) {
            return Ok(Some(instance.clone()));
        }
        Ok(self.archived.read().await.get(&id).cloned())
    }

    async fn archive(&self, instance: &SagaInstance) -> Result<(), DatabaseError> {
        if !instance.is_terminal() {
            return Err(DatabaseError::conflict(format!(
                "saga {} is {} and cannot be archived",
                instance.id, instance.status
            )));
        }
        self.active.write().await.remove(&instance.id);
        self.archived
            .write()
            .await
            .insert(instance.id, instance.clone());
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<SagaInstance>, DatabaseError> {
        let mut active: Vec<SagaInstance> = self.active.read().await.values().cloned().collect();
        active.sort_by_key(|instance| instance.created_at);
        Ok(active)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::instance::SagaStatus;

    #[tokio::test]
    async fn archive_moves_terminal_instances_out_of_the_active_set() {
        let journal = InMemorySagaJournal::new();
        let mut instance = SagaInstance::new(SagaId::new(), "order", ["a"], Utc::now());

        journal.save(&instance).await.unwrap();
        assert_eq!(journal.list_active().await.unwrap().len(), 1);

        instance.status = SagaStatus::Completed;
        journal.archive(&instance).await.unwrap();

        assert!(journal.list_active().await.unwrap().is_empty());
        assert_eq!(journal.archived_count().await, 1);
        let loaded = journal.load(instance.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, SagaStatus::Completed);
    }

    #[tokio::test]
    async fn running_instances_cannot_be_archived() {
        let journal = InMemorySagaJournal::new();
        let mut instance = SagaInstance::new(SagaId::new(), "order", ["a"], Utc::now());
        instance.status = SagaStatus::Running;

        let err = journal.archive(&instance).await.unwrap_err();
        assert!(err.is_conflict());
    }
}
