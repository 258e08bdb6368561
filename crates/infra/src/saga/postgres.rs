//! Postgres-backed saga journal.
//!
//! One row per instance. The full instance is kept as JSONB; `status` and
//! `archived` are split out so active sagas can be listed without decoding
//! every row.

use std::sync::Arc;

use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::instrument;

use forgeq_core::{DatabaseError, SagaId};
use forgeq_saga::{SagaInstance, SagaJournal};

use crate::db::{execute_schema, map_sqlx_error};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS forgeq_sagas (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL,
        status TEXT NOT NULL,
        instance JSONB NOT NULL,
        archived BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS forgeq_sagas_active_idx ON forgeq_sagas (archived, created_at)",
];

#[derive(Debug, Clone)]
pub struct PostgresSagaJournal {
    pool: Arc<PgPool>,
}

impl PostgresSagaJournal {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn ensure_schema(&self) -> Result<(), DatabaseError> {
        execute_schema(&self.pool, SCHEMA).await
    }
}

fn decode_instance(row: &sqlx::postgres::PgRow, operation: &str) -> Result<SagaInstance, DatabaseError> {
    let Json(instance): Json<SagaInstance> = row
        .try_get("instance")
        .map_err(|e| map_sqlx_error(operation, e))?;
    Ok(instance)
}

#[async_trait::async_trait]
impl SagaJournal for PostgresSagaJournal {
    #[instrument(skip(self, instance), fields(saga_id = %instance.id, status = %instance.status), err)]
    async fn save(&self, instance: &SagaInstance) -> Result<(), DatabaseError> {
        let result = sqlx::query(
            r#"
            INSERT INTO forgeq_sagas (id, name, status, instance, archived, created_at, updated_at)
            VALUES ($1, $2, $3, $4, FALSE, $5, $6)
            ON CONFLICT (id) DO UPDATE
                SET status = EXCLUDED.status,
                    instance = EXCLUDED.instance,
                    updated_at = EXCLUDED.updated_at
                WHERE forgeq_sagas.archived = FALSE
            "#,
        )
        .bind(instance.id.as_uuid())
        .bind(&instance.name)
        .bind(instance.status.as_str())
        .bind(Json(instance))
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("saga_save", e))?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::conflict(format!("saga {} is archived", instance.id)));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(saga_id = %id), err)]
    async fn load(&self, id: SagaId) -> Result<Option<SagaInstance>, DatabaseError> {
        let row = sqlx::query("SELECT instance FROM forgeq_sagas WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("saga_load", e))?;

        row.map(|row| decode_instance(&row, "saga_load")).transpose()
    }

    #[instrument(skip(self, instance), fields(saga_id = %instance.id), err)]
    async fn archive(&self, instance: &SagaInstance) -> Result<(), DatabaseError> {
        if !instance.is_terminal() {
            return Err(DatabaseError::conflict(format!(
                "saga {} is {} and cannot be archived",
                instance.id, instance.status
            )));
        }
        sqlx::query(
            r#"
            INSERT INTO forgeq_sagas (id, name, status, instance, archived, created_at, updated_at)
            VALUES ($1, $2, $3, $4, TRUE, $5, $6)
            ON CONFLICT (id) DO UPDATE
                SET status = EXCLUDED.status,
                    instance = EXCLUDED.instance,
                    archived = TRUE,
                    updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(instance.id.as_uuid())
        .bind(&instance.name)
        .bind(instance.status.as_str())
        .bind(Json(instance))
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("saga_archive", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn list_active(&self) -> Result<Vec<SagaInstance>, DatabaseError> {
        let rows = sqlx::query(
            "SELECT instance FROM forgeq_sagas WHERE archived = FALSE ORDER BY created_at ASC",
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("saga_list_active", e))?;

        rows.iter()
            .map(|row| decode_instance(row, "saga_list_active"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use forgeq_saga::SagaStatus;

    use super::*;
    use crate::db::test_pool;

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn journal_tracks_instances_until_archived() {
        let Some(pool) = test_pool().await else {
            return;
        };
        let journal = PostgresSagaJournal::new(pool);
        journal.ensure_schema().await.unwrap();

        let mut instance =
            SagaInstance::new(SagaId::new(), "order", ["reserve", "charge"], Utc::now());
        instance.status = SagaStatus::Running;
        journal.save(&instance).await.unwrap();

        assert_eq!(journal.load(instance.id).await.unwrap(), Some(instance.clone()));
        let active = journal.list_active().await.unwrap();
        assert!(active.iter().any(|saga| saga.id == instance.id));

        // Archiving requires a terminal state.
        assert!(matches!(
            journal.archive(&instance).await,
            Err(DatabaseError::Conflict(_))
        ));

        instance.status = SagaStatus::Completed;
        journal.archive(&instance).await.unwrap();
        let active = journal.list_active().await.unwrap();
        assert!(active.iter().all(|saga| saga.id != instance.id));
        assert_eq!(
            journal.load(instance.id).await.unwrap().unwrap().status,
            SagaStatus::Completed
        );

        assert!(matches!(
            journal.save(&instance).await,
            Err(DatabaseError::Conflict(_))
        ));
    }
}
