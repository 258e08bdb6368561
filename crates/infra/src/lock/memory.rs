use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use forgeq_core::{DatabaseError, LockAcquisitionError, LockToken, SharedClock, SystemClock};

use super::{LockRecord, LockService, expiry_for};

/// In-process lock service for tests and single-node deployments.
#[derive(Debug)]
pub struct InMemoryLockService {
    records: Mutex<HashMap<String, LockRecord>>,
    clock: SharedClock,
}

impl Default for InMemoryLockService {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLockService {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn records(
        &self,
        key: &str,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, LockRecord>>, LockAcquisitionError> {
        self.records.lock().map_err(|_| {
            LockAcquisitionError::new(
                key,
                DatabaseError::unavailable("lock", "in-memory lock table poisoned"),
            )
        })
    }
}

#[async_trait::async_trait]
impl LockService for InMemoryLockService {
    async fn acquire(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<LockToken, LockAcquisitionError> {
        let now = self.clock.now();
        let expires_at = expiry_for(key, now, ttl)?;
        let mut records = self.records(key)?;

        if let Some(existing) = records.get(key) {
            if !existing.is_expired(now) {
                return Err(LockAcquisitionError::held(
                    key,
                    existing.holder.clone(),
                    existing.expires_at,
                ));
            }
        }

        let token = LockToken::new();
        records.insert(
            key.to_string(),
            LockRecord {
                key: key.to_string(),
                holder: holder.to_string(),
                token,
                acquired_at: now,
                expires_at,
            },
        );
        Ok(token)
    }

    async fn release(&self, key: &str, token: LockToken) -> Result<(), LockAcquisitionError> {
        let mut records = self.records(key)?;
        if records.get(key).is_some_and(|record| record.token == token) {
            records.remove(key);
        }
        Ok(())
    }

    async fn renew(
        &self,
        key: &str,
        token: LockToken,
        ttl: Duration,
    ) -> Result<(), LockAcquisitionError> {
        let now = self.clock.now();
        let expires_at = expiry_for(key, now, ttl)?;
        let mut records = self.records(key)?;
        match records.get_mut(key) {
            Some(record) if record.token == token && !record.is_expired(now) => {
                record.expires_at = expires_at;
                Ok(())
            }
            _ => Err(LockAcquisitionError::stale(key)),
        }
    }

    async fn inspect(&self, key: &str) -> Result<Option<LockRecord>, LockAcquisitionError> {
        let now = self.clock.now();
        let records = self.records(key)?;
        Ok(records
            .get(key)
            .filter(|record| !record.is_expired(now))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use forgeq_core::{LockFailure, ManualClock};

    use super::*;
    use crate::lock::{SharedLockService, with_lock};

    fn clock() -> ManualClock {
        ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap())
    }

    #[tokio::test]
    async fn second_holder_waits_for_ttl_expiry() {
        let clock = clock();
        let locks = InMemoryLockService::with_clock(Arc::new(clock.clone()));
        let ttl = Duration::from_secs(5);

        let a = locks.acquire("job:sync", "worker-a", ttl).await.unwrap();

        let err = locks.acquire("job:sync", "worker-b", ttl).await.unwrap_err();
        assert_eq!(err.key, "job:sync");
        assert!(matches!(err.cause, LockFailure::Held { ref holder, .. } if holder == "worker-a"));

        clock.advance(ChronoDuration::milliseconds(4_999));
        assert!(locks.acquire("job:sync", "worker-b", ttl).await.is_err());

        // Worker A never released; expiry alone frees the lock.
        clock.advance(ChronoDuration::milliseconds(1));
        let b = locks.acquire("job:sync", "worker-b", ttl).await.unwrap();
        assert_ne!(a, b);

        // A's stale token can neither renew nor release B's lock.
        let renew = locks.renew("job:sync", a, ttl).await.unwrap_err();
        assert_eq!(renew.cause, LockFailure::StaleToken);
        locks.release("job:sync", a).await.unwrap();
        let record = locks.inspect("job:sync").await.unwrap().unwrap();
        assert_eq!(record.holder, "worker-b");
        assert_eq!(record.token, b);
    }

    #[tokio::test]
    async fn concurrent_acquirers_produce_exactly_one_winner() {
        let locks: SharedLockService = Arc::new(InMemoryLockService::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let locks = locks.clone();
            handles.push(tokio::spawn(async move {
                locks
                    .acquire("job:sync", &format!("worker-{i}"), Duration::from_secs(5))
                    .await
                    .is_ok()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn renew_extends_expiry() {
        let clock = clock();
        let locks = InMemoryLockService::with_clock(Arc::new(clock.clone()));
        let ttl = Duration::from_secs(5);
        let token = locks.acquire("k", "a", ttl).await.unwrap();

        clock.advance(ChronoDuration::seconds(4));
        locks.renew("k", token, ttl).await.unwrap();
        clock.advance(ChronoDuration::seconds(4));

        assert!(locks.acquire("k", "b", ttl).await.is_err());
    }

    #[tokio::test]
    async fn release_frees_the_key_immediately() {
        let locks = InMemoryLockService::new();
        let token = locks.acquire("k", "a", Duration::from_secs(60)).await.unwrap();
        locks.release("k", token).await.unwrap();

        assert!(locks.inspect("k").await.unwrap().is_none());
        assert!(locks.acquire("k", "b", Duration::from_secs(60)).await.is_ok());
    }

    #[tokio::test]
    async fn with_lock_runs_the_closure_and_releases() {
        let locks: SharedLockService = Arc::new(InMemoryLockService::new());

        let value = with_lock(&locks, "report", "a", Duration::from_secs(5), || async { 42 })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert!(locks.inspect("report").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn with_lock_does_not_run_under_contention() {
        let locks: SharedLockService = Arc::new(InMemoryLockService::new());
        locks.acquire("report", "a", Duration::from_secs(5)).await.unwrap();

        let ran = Arc::new(Mutex::new(false));
        let flag = ran.clone();
        let result = with_lock(&locks, "report", "b", Duration::from_secs(5), || async move {
            *flag.lock().unwrap() = true;
        })
        .await;

        assert!(result.is_err());
        assert!(!*ran.lock().unwrap());
    }

    #[tokio::test]
    async fn out_of_range_ttl_is_an_error_not_a_panic() {
        let locks = InMemoryLockService::new();
        let huge = Duration::from_millis(10_000_000_000_000_000);

        let err = locks.acquire("k", "a", huge).await.unwrap_err();
        assert_eq!(err.cause, LockFailure::TtlOutOfRange(huge));
        assert!(locks.inspect("k").await.unwrap().is_none());

        let token = locks.acquire("k", "a", Duration::from_secs(5)).await.unwrap();
        let err = locks.renew("k", token, Duration::MAX).await.unwrap_err();
        assert_eq!(err.cause, LockFailure::TtlOutOfRange(Duration::MAX));
        // The original lease is untouched.
        assert_eq!(locks.inspect("k").await.unwrap().unwrap().token, token);
    }
}
