//! Postgres-backed job store.
//!
//! Claiming locks one due row with `FOR UPDATE SKIP LOCKED` inside a
//! transaction, so concurrent workers (in any process) never block on, or
//! both win, the same job. Later transitions are guarded `UPDATE`s on
//! `(status, owner)`; lease recovery additionally pins the lease it saw
//! expire. The new row contents come from the state machine in
//! `forgeq_core::job`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::instrument;

use forgeq_core::{
    BackoffPolicy, DatabaseError, Job, JobAttemptRecord, JobId, JobStatus, WorkerId,
};

use super::store::{JobQuery, JobStats, JobStore};
use crate::db::{execute_schema, map_sqlx_error};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS forgeq_jobs (
        id UUID PRIMARY KEY,
        job_type TEXT NOT NULL,
        payload JSONB NOT NULL,
        status TEXT NOT NULL,
        attempts INTEGER NOT NULL,
        max_attempts INTEGER NOT NULL,
        run_at TIMESTAMPTZ NOT NULL,
        owner TEXT NULL,
        lease_expires_at TIMESTAMPTZ NULL,
        started_at TIMESTAMPTZ NULL,
        last_error TEXT NULL,
        unique_key TEXT NULL UNIQUE,
        backoff JSONB NOT NULL,
        history JSONB NOT NULL DEFAULT '[]'::jsonb,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS forgeq_jobs_due_idx ON forgeq_jobs (status, job_type, run_at)",
    "CREATE INDEX IF NOT EXISTS forgeq_jobs_lease_idx ON forgeq_jobs (status, lease_expires_at)",
    "CREATE INDEX IF NOT EXISTS forgeq_jobs_finished_idx ON forgeq_jobs (status, updated_at)",
];

const JOB_COLUMNS: &str = "id, job_type, payload, status, attempts, max_attempts, run_at, owner, \
     lease_expires_at, started_at, last_error, unique_key, backoff, history, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the jobs table and its indexes if they do not exist.
    pub async fn ensure_schema(&self) -> Result<(), DatabaseError> {
        execute_schema(&self.pool, SCHEMA).await
    }

    async fn ensure_exists(&self, id: JobId, operation: &str) -> Result<(), DatabaseError> {
        let exists = sqlx::query("SELECT 1 FROM forgeq_jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        match exists {
            Some(_) => Ok(()),
            None => Err(DatabaseError::not_found(format!("job {id}"))),
        }
    }
}

/// Guarded full-row update. Returns true when the guard matched. A
/// `expected_lease` additionally pins the lease the caller observed.
async fn write_guarded<'e, E>(
    executor: E,
    job: &Job,
    expected_status: JobStatus,
    expected_owner: Option<&WorkerId>,
    expected_lease: Option<DateTime<Utc>>,
) -> Result<bool, DatabaseError>
where
    E: sqlx::PgExecutor<'e>,
{
    let result = sqlx::query(
        r#"
        UPDATE forgeq_jobs
        SET status = $2,
            attempts = $3,
            max_attempts = $4,
            run_at = $5,
            owner = $6,
            lease_expires_at = $7,
            started_at = $8,
            last_error = $9,
            backoff = $10,
            history = $11,
            payload = $12,
            updated_at = $13
        WHERE id = $1
          AND status = $14
          AND owner IS NOT DISTINCT FROM $15
          AND ($16::timestamptz IS NULL OR lease_expires_at = $16)
        "#,
    )
    .bind(job.id.as_uuid())
    .bind(job.status.as_str())
    .bind(to_db_count(job.attempts))
    .bind(to_db_count(job.max_attempts))
    .bind(job.run_at)
    .bind(job.owner.as_ref().map(WorkerId::as_str))
    .bind(job.lease_expires_at)
    .bind(job.started_at)
    .bind(job.last_error.as_deref())
    .bind(Json(&job.backoff))
    .bind(Json(&job.history))
    .bind(&job.payload)
    .bind(job.updated_at)
    .bind(expected_status.as_str())
    .bind(expected_owner.map(WorkerId::as_str))
    .bind(expected_lease)
    .execute(executor)
    .await
    .map_err(|e| map_sqlx_error("compare_and_set", e))?;

    Ok(result.rows_affected() == 1)
}

#[async_trait::async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, job_type = %job.job_type), err)]
    async fn enqueue(&self, job: Job) -> Result<JobId, DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO forgeq_jobs (
                id, job_type, payload, status, attempts, max_attempts, run_at, owner,
                lease_expires_at, started_at, last_error, unique_key, backoff, history,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(&job.job_type)
        .bind(&job.payload)
        .bind(job.status.as_str())
        .bind(to_db_count(job.attempts))
        .bind(to_db_count(job.max_attempts))
        .bind(job.run_at)
        .bind(job.owner.as_ref().map(WorkerId::as_str))
        .bind(job.lease_expires_at)
        .bind(job.started_at)
        .bind(job.last_error.as_deref())
        .bind(job.unique_key.as_deref())
        .bind(Json(&job.backoff))
        .bind(Json(&job.history))
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;

        Ok(job.id)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Option<Job>, DatabaseError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM forgeq_jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|row| decode_job(&row)).transpose()
    }

    #[instrument(skip(self, job_types), fields(owner = %owner), err)]
    async fn claim_next(
        &self,
        owner: &WorkerId,
        job_types: &[String],
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<Job>, DatabaseError> {
        if job_types.is_empty() {
            return Ok(None);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("claim_next", e))?;

        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM forgeq_jobs
            WHERE status = 'waiting' AND run_at <= $1 AND job_type = ANY($2)
            ORDER BY run_at ASC, created_at ASC, id ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#
        );
        let row = sqlx::query(&sql)
            .bind(now)
            .bind(job_types)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("claim_next", e))?;

        let Some(row) = row else {
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("claim_next", e))?;
            return Ok(None);
        };

        let mut job = decode_job(&row)?;
        job.claim(owner.clone(), now, lease_until)
            .map_err(|e| DatabaseError::corrupt(e.to_string()))?;

        let claimed = write_guarded(&mut *tx, &job, JobStatus::Waiting, None, None).await?;
        if !claimed {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("claim_next", e))?;
            return Ok(None);
        }
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("claim_next", e))?;

        Ok(Some(job))
    }

    #[instrument(
        skip(self, job, expected_owner),
        fields(job_id = %job.id, to = %job.status, from = %expected_status),
        err
    )]
    async fn compare_and_set(
        &self,
        job: &Job,
        expected_status: JobStatus,
        expected_owner: Option<&WorkerId>,
    ) -> Result<bool, DatabaseError> {
        if write_guarded(&*self.pool, job, expected_status, expected_owner, None).await? {
            return Ok(true);
        }
        self.ensure_exists(job.id, "compare_and_set").await?;
        Ok(false)
    }

    #[instrument(skip(self, job, expected_owner), fields(job_id = %job.id), err)]
    async fn reclaim_expired(
        &self,
        job: &Job,
        expected_owner: Option<&WorkerId>,
        expired_lease: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let guarded = write_guarded(
            &*self.pool,
            job,
            JobStatus::Active,
            expected_owner,
            Some(expired_lease),
        )
        .await?;
        if guarded {
            return Ok(true);
        }
        self.ensure_exists(job.id, "reclaim_expired").await?;
        Ok(false)
    }

    #[instrument(skip(self), fields(job_id = %id, owner = %owner), err)]
    async fn extend_lease(
        &self,
        id: JobId,
        owner: &WorkerId,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            r#"
            UPDATE forgeq_jobs
            SET lease_expires_at = $3, updated_at = $4
            WHERE id = $1 AND status = 'active' AND owner = $2
              AND lease_expires_at > $4
            "#,
        )
        .bind(id.as_uuid())
        .bind(owner.as_str())
        .bind(lease_until)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("extend_lease", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn promote_due(&self, now: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let result = sqlx::query(
            r#"
            UPDATE forgeq_jobs
            SET status = 'waiting', updated_at = $1
            WHERE status = 'delayed' AND run_at <= $1
            "#,
        )
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("promote_due", e))?;

        Ok(result.rows_affected() as usize)
    }

    #[instrument(skip(self), err)]
    async fn expired_leases(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, DatabaseError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM forgeq_jobs
            WHERE status = 'active' AND lease_expires_at <= $1
            ORDER BY lease_expires_at ASC
            LIMIT $2
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(to_db_limit(limit))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("expired_leases", e))?;

        rows.iter().map(decode_job).collect()
    }

    #[instrument(skip(self), err)]
    async fn list(&self, query: &JobQuery, limit: usize) -> Result<Vec<Job>, DatabaseError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM forgeq_jobs
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR job_type = $2)
            ORDER BY created_at ASC, id ASC
            LIMIT $3
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(query.status.map(JobStatus::as_str))
            .bind(query.job_type.as_deref())
            .bind(to_db_limit(limit))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list", e))?;

        rows.iter().map(decode_job).collect()
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<JobStats, DatabaseError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM forgeq_jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("stats", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("stats", e))?;
            let status: JobStatus = status
                .parse()
                .map_err(|e: forgeq_core::ConfigError| DatabaseError::corrupt(e.to_string()))?;
            stats.add(status, usize::try_from(n).unwrap_or(0));
        }
        Ok(stats)
    }

    #[instrument(skip(self), err)]
    async fn purge_finished(
        &self,
        finished_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<usize, DatabaseError> {
        let result = sqlx::query(
            r#"
            DELETE FROM forgeq_jobs
            WHERE id IN (
                SELECT id FROM forgeq_jobs
                WHERE status IN ('completed', 'failed') AND updated_at < $1
                ORDER BY updated_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            "#,
        )
        .bind(finished_before)
        .bind(to_db_limit(limit))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("purge_finished", e))?;

        Ok(result.rows_affected() as usize)
    }
}

/// Row shape of `forgeq_jobs`.
struct JobRow {
    id: uuid::Uuid,
    job_type: String,
    payload: serde_json::Value,
    status: String,
    attempts: i32,
    max_attempts: i32,
    run_at: DateTime<Utc>,
    owner: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    unique_key: Option<String>,
    backoff: Json<BackoffPolicy>,
    history: Json<Vec<JobAttemptRecord>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for JobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            job_type: row.try_get("job_type")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            run_at: row.try_get("run_at")?,
            owner: row.try_get("owner")?,
            lease_expires_at: row.try_get("lease_expires_at")?,
            started_at: row.try_get("started_at")?,
            last_error: row.try_get("last_error")?,
            unique_key: row.try_get("unique_key")?,
            backoff: row.try_get("backoff")?,
            history: row.try_get("history")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = DatabaseError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status: JobStatus = row.status.parse().map_err(|_| {
            DatabaseError::corrupt(format!("job {} has unknown status `{}`", row.id, row.status))
        })?;
        Ok(Job {
            id: JobId::from_uuid(row.id),
            job_type: row.job_type,
            payload: row.payload,
            status,
            attempts: from_db_count(row.attempts),
            max_attempts: from_db_count(row.max_attempts),
            run_at: row.run_at,
            owner: row.owner.map(WorkerId::new),
            lease_expires_at: row.lease_expires_at,
            started_at: row.started_at,
            last_error: row.last_error,
            unique_key: row.unique_key,
            backoff: row.backoff.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
            history: row.history.0,
        })
    }
}

fn decode_job(row: &sqlx::postgres::PgRow) -> Result<Job, DatabaseError> {
    use sqlx::FromRow;
    let row = JobRow::from_row(row).map_err(|e| map_sqlx_error("decode_job", e))?;
    Job::try_from(row)
}

fn to_db_count(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

fn from_db_count(n: i32) -> u32 {
    u32::try_from(n).unwrap_or(0)
}

fn to_db_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}
