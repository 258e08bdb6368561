//! Postgres connection wiring shared by the job store, lock service and saga journal.
//!
//! ## Error Mapping
//!
//! | SQLx error | PostgreSQL code | `DatabaseError` |
//! |---|---|---|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (other) | any other | `Unavailable` |
//! | RowNotFound | n/a | `NotFound` |
//! | ColumnDecode / Decode / ColumnNotFound | n/a | `Corrupt` |
//! | PoolClosed, Io, Tls, timeouts, ... | n/a | `Unavailable` |

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use forgeq_core::DatabaseError;

/// Open a connection pool.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, DatabaseError> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .map_err(|e| map_sqlx_error("connect", e))
}

/// Run DDL statements one at a time (prepared statements cannot batch).
pub(crate) async fn execute_schema(
    pool: &PgPool,
    statements: &[&str],
) -> Result<(), DatabaseError> {
    for statement in statements {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
    }
    Ok(())
}

pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> DatabaseError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            if db_err.code().as_deref() == Some("23505") {
                DatabaseError::Conflict(msg)
            } else {
                DatabaseError::unavailable(operation, msg)
            }
        }
        sqlx::Error::RowNotFound => {
            DatabaseError::not_found(format!("row not found in {}", operation))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            DatabaseError::corrupt(format!("failed to decode row in {}: {}", operation, err))
        }
        other => DatabaseError::unavailable(operation, other.to_string()),
    }
}

/// Pool for tests that run against a real server; `None` when
/// `DATABASE_URL` is unset.
#[cfg(test)]
pub(crate) async fn test_pool() -> Option<PgPool> {
    let url = std::env::var(crate::config::ENV_DATABASE_URL).ok()?;
    Some(connect(&url, 16).await.expect("connect to DATABASE_URL"))
}
