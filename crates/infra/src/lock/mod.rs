//! Distributed locks with TTL-based expiry.
//!
//! A lock record is valid until its `expires_at`. Nobody reaps expired
//! records: the next acquirer notices the expiry and takes the lock over in
//! the same conditional write that would otherwise have failed.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use forgeq_core::clock::{MAX_WINDOW, checked_after};
use forgeq_core::{LockAcquisitionError, LockToken};

pub mod memory;
pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis;

pub use self::memory::InMemoryLockService;
pub use self::postgres::PostgresLockService;
#[cfg(feature = "redis")]
pub use self::redis::RedisLockService;

/// A lock as stored by a backend.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LockRecord {
    pub key: String,
    pub holder: String,
    pub token: LockToken,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Expiry of a lock on `key` taken or renewed at `now` for `ttl`.
pub(crate) fn expiry_for(
    key: &str,
    now: DateTime<Utc>,
    ttl: Duration,
) -> Result<DateTime<Utc>, LockAcquisitionError> {
    if ttl > MAX_WINDOW {
        return Err(LockAcquisitionError::ttl_out_of_range(key, ttl));
    }
    checked_after(now, ttl).ok_or_else(|| LockAcquisitionError::ttl_out_of_range(key, ttl))
}

/// Named mutual exclusion across processes.
#[async_trait::async_trait]
pub trait LockService: Send + Sync {
    /// Take `key` for `ttl` unless a non-expired record exists.
    async fn acquire(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<LockToken, LockAcquisitionError>;

    /// Give the lock back. A no-op when `token` no longer owns it.
    async fn release(&self, key: &str, token: LockToken) -> Result<(), LockAcquisitionError>;

    /// Push expiry out to `now + ttl`. Fails with a stale-token error once the
    /// lock expired or changed hands.
    async fn renew(
        &self,
        key: &str,
        token: LockToken,
        ttl: Duration,
    ) -> Result<(), LockAcquisitionError>;

    /// The current valid record for `key`, if any.
    async fn inspect(&self, key: &str) -> Result<Option<LockRecord>, LockAcquisitionError>;
}

pub type SharedLockService = Arc<dyn LockService>;

/// A held lock.
///
/// Dropping a guard without calling [`LockGuard::release`] leaves the record
/// in place until its TTL runs out.
#[derive(Clone)]
pub struct LockGuard {
    locks: SharedLockService,
    key: String,
    token: LockToken,
}

impl LockGuard {
    pub async fn acquire(
        locks: SharedLockService,
        key: impl Into<String>,
        holder: &str,
        ttl: Duration,
    ) -> Result<Self, LockAcquisitionError> {
        let key = key.into();
        let token = locks.acquire(&key, holder, ttl).await?;
        Ok(Self { locks, key, token })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> LockToken {
        self.token
    }

    pub async fn renew(&self, ttl: Duration) -> Result<(), LockAcquisitionError> {
        self.locks.renew(&self.key, self.token, ttl).await
    }

    pub async fn release(self) -> Result<(), LockAcquisitionError> {
        self.locks.release(&self.key, self.token).await
    }
}

impl core::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("token", &self.token)
            .finish()
    }
}

/// Run `f` while holding `key`.
///
/// Contention is returned as an error without running `f`. A failed release
/// is logged; the record then expires on its own.
pub async fn with_lock<F, Fut, T>(
    locks: &SharedLockService,
    key: &str,
    holder: &str,
    ttl: Duration,
    f: F,
) -> Result<T, LockAcquisitionError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    let guard = LockGuard::acquire(locks.clone(), key, holder, ttl).await?;
    let output = f().await;
    if let Err(e) = guard.release().await {
        warn!(lock_key = key, error = %e, "failed to release lock; it will expire");
    }
    Ok(output)
}

/// Lock TTLs are stored with millisecond precision; never below 1ms.
pub(crate) fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}
