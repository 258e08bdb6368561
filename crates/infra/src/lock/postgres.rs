//! Postgres-backed lock service.
//!
//! Acquisition is one `INSERT ... ON CONFLICT DO UPDATE ... WHERE expires_at <= now`
//! statement: it either creates the record, takes over an expired one, or
//! affects no row because a live holder exists.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;

use forgeq_core::{
    DatabaseError, LockAcquisitionError, LockToken, SharedClock, SystemClock,
};

use super::{LockRecord, LockService, expiry_for};
use crate::db::{execute_schema, map_sqlx_error};

const SCHEMA: &[&str] = &[r#"
    CREATE TABLE IF NOT EXISTS forgeq_locks (
        key TEXT PRIMARY KEY,
        holder TEXT NOT NULL,
        token UUID NOT NULL,
        acquired_at TIMESTAMPTZ NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL
    )
    "#];

#[derive(Debug, Clone)]
pub struct PostgresLockService {
    pool: Arc<PgPool>,
    clock: SharedClock,
}

impl PostgresLockService {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Create the lock table if it does not exist.
    pub async fn ensure_schema(&self) -> Result<(), DatabaseError> {
        execute_schema(&self.pool, SCHEMA).await
    }

    async fn current_holder(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<(String, DateTime<Utc>)>, DatabaseError> {
        let row = sqlx::query(
            r#"
            SELECT holder, expires_at
            FROM forgeq_locks
            WHERE key = $1 AND expires_at > $2
            "#,
        )
        .bind(key)
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("lock_holder", e))?;

        match row {
            Some(row) => {
                let holder: String = row
                    .try_get("holder")
                    .map_err(|e| map_sqlx_error("lock_holder", e))?;
                let expires_at: DateTime<Utc> = row
                    .try_get("expires_at")
                    .map_err(|e| map_sqlx_error("lock_holder", e))?;
                Ok(Some((holder, expires_at)))
            }
            None => Ok(None),
        }
    }
}

#[async_trait::async_trait]
impl LockService for PostgresLockService {
    #[instrument(skip(self), err)]
    async fn acquire(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<LockToken, LockAcquisitionError> {
        let now = self.clock.now();
        let expires_at = expiry_for(key, now, ttl)?;
        let token = LockToken::new();

        let row = sqlx::query(
            r#"
            INSERT INTO forgeq_locks (key, holder, token, acquired_at, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (key) DO UPDATE
                SET holder = EXCLUDED.holder,
                    token = EXCLUDED.token,
                    acquired_at = EXCLUDED.acquired_at,
                    expires_at = EXCLUDED.expires_at
                WHERE forgeq_locks.expires_at <= $4
            RETURNING token
            "#,
        )
        .bind(key)
        .bind(holder)
        .bind(token.as_uuid())
        .bind(now)
        .bind(expires_at)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| LockAcquisitionError::new(key, map_sqlx_error("lock_acquire", e)))?;

        if row.is_some() {
            return Ok(token);
        }

        match self
            .current_holder(key, now)
            .await
            .map_err(|e| LockAcquisitionError::new(key, e))?
        {
            Some((holder, expires_at)) => Err(LockAcquisitionError::held(key, holder, expires_at)),
            None => Err(LockAcquisitionError::new(
                key,
                DatabaseError::conflict("lock changed hands during acquisition"),
            )),
        }
    }

    #[instrument(skip(self), err)]
    async fn release(&self, key: &str, token: LockToken) -> Result<(), LockAcquisitionError> {
        sqlx::query("DELETE FROM forgeq_locks WHERE key = $1 AND token = $2")
            .bind(key)
            .bind(token.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| LockAcquisitionError::new(key, map_sqlx_error("lock_release", e)))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn renew(
        &self,
        key: &str,
        token: LockToken,
        ttl: Duration,
    ) -> Result<(), LockAcquisitionError> {
        let now = self.clock.now();
        let expires_at = expiry_for(key, now, ttl)?;
        let result = sqlx::query(
            r#"
            UPDATE forgeq_locks
            SET expires_at = $3
            WHERE key = $1 AND token = $2 AND expires_at > $4
            "#,
        )
        .bind(key)
        .bind(token.as_uuid())
        .bind(expires_at)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| LockAcquisitionError::new(key, map_sqlx_error("lock_renew", e)))?;

        if result.rows_affected() == 0 {
            return Err(LockAcquisitionError::stale(key));
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn inspect(&self, key: &str) -> Result<Option<LockRecord>, LockAcquisitionError> {
        let row = sqlx::query(
            r#"
            SELECT key, holder, token, acquired_at, expires_at
            FROM forgeq_locks
            WHERE key = $1 AND expires_at > $2
            "#,
        )
        .bind(key)
        .bind(self.clock.now())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| LockAcquisitionError::new(key, map_sqlx_error("lock_inspect", e)))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let decode = |e| LockAcquisitionError::new(key, map_sqlx_error("lock_inspect", e));
        let token: uuid::Uuid = row.try_get("token").map_err(decode)?;
        Ok(Some(LockRecord {
            key: row.try_get("key").map_err(decode)?,
            holder: row.try_get("holder").map_err(decode)?,
            token: LockToken::from_uuid(token),
            acquired_at: row.try_get("acquired_at").map_err(decode)?,
            expires_at: row.try_get("expires_at").map_err(decode)?,
        }))
    }
}
