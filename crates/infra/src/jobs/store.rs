//! Job storage implementations.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

use forgeq_core::{DatabaseError, Job, JobId, JobStatus, WorkerId};

/// Filter for operator listings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobQuery {
    pub status: Option<JobStatus>,
    pub job_type: Option<String>,
}

impl JobQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|status| job.status == status)
            && self
                .job_type
                .as_deref()
                .is_none_or(|job_type| job.job_type == job_type)
    }
}

/// Job counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
    pub paused: usize,
}

impl JobStats {
    pub fn total(&self) -> usize {
        self.waiting + self.active + self.completed + self.failed + self.delayed + self.paused
    }

    pub fn count(&self, status: JobStatus) -> usize {
        match status {
            JobStatus::Waiting => self.waiting,
            JobStatus::Active => self.active,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
            JobStatus::Delayed => self.delayed,
            JobStatus::Paused => self.paused,
        }
    }

    pub fn add(&mut self, status: JobStatus, n: usize) {
        let slot = match status {
            JobStatus::Waiting => &mut self.waiting,
            JobStatus::Active => &mut self.active,
            JobStatus::Completed => &mut self.completed,
            JobStatus::Failed => &mut self.failed,
            JobStatus::Delayed => &mut self.delayed,
            JobStatus::Paused => &mut self.paused,
        };
        *slot += n;
    }
}

/// Durable job queue.
///
/// Every state change of an existing job goes through [`JobStore::claim_next`]
/// or [`JobStore::compare_and_set`]; the store never decides a transition on
/// its own except promoting due DELAYED jobs.
#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job. Fails with a conflict if the id or unique key exists.
    async fn enqueue(&self, job: Job) -> Result<JobId, DatabaseError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, DatabaseError>;

    /// Atomically claim the oldest due WAITING job among `job_types`.
    ///
    /// The returned job is ACTIVE, owned by `owner`, with its attempt count
    /// already incremented.
    async fn claim_next(
        &self,
        owner: &WorkerId,
        job_types: &[String],
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<Job>, DatabaseError>;

    /// Replace the stored job with `job` only if the stored status and owner
    /// still match. Returns false when another party got there first.
    async fn compare_and_set(
        &self,
        job: &Job,
        expected_status: JobStatus,
        expected_owner: Option<&WorkerId>,
    ) -> Result<bool, DatabaseError>;

    /// Heartbeat: extend the lease of an ACTIVE job still owned by `owner`.
    ///
    /// Refused once the lease has run out at `now`; the job then belongs to
    /// lease recovery.
    async fn extend_lease(
        &self,
        id: JobId,
        owner: &WorkerId,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Lease recovery: replace `job` only if the stored job is still ACTIVE
    /// under `expected_owner` with the lease that was seen to expire. A
    /// heartbeat in between changes the lease and makes this return false.
    async fn reclaim_expired(
        &self,
        job: &Job,
        expected_owner: Option<&WorkerId>,
        expired_lease: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Move DELAYED jobs whose backoff has elapsed back to WAITING.
    async fn promote_due(&self, now: DateTime<Utc>) -> Result<usize, DatabaseError>;

    /// ACTIVE jobs whose lease ran out (owner presumed dead), oldest expiry first.
    async fn expired_leases(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, DatabaseError>;

    /// Jobs matching `query`, oldest first.
    async fn list(&self, query: &JobQuery, limit: usize) -> Result<Vec<Job>, DatabaseError>;

    async fn stats(&self) -> Result<JobStats, DatabaseError>;

    /// Delete up to `limit` COMPLETED or FAILED jobs last touched before
    /// `finished_before`, releasing their unique keys. Returns how many went.
    async fn purge_finished(
        &self,
        finished_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<usize, DatabaseError>;
}

fn is_finished(status: JobStatus) -> bool {
    matches!(status, JobStatus::Completed | JobStatus::Failed)
}

pub type SharedJobStore = Arc<dyn JobStore>;

#[derive(Debug, Default)]
struct Tables {
    jobs: HashMap<JobId, Job>,
    unique_keys: HashMap<String, JobId>,
}

/// In-memory job store (tests/dev).
#[derive(Debug, Default, Clone)]
pub struct InMemoryJobStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>, DatabaseError> {
        self.tables
            .read()
            .map_err(|_| DatabaseError::unavailable("read", "in-memory job table poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, DatabaseError> {
        self.tables
            .write()
            .map_err(|_| DatabaseError::unavailable("write", "in-memory job table poisoned"))
    }
}

fn oldest_first(a: &Job, b: &Job) -> std::cmp::Ordering {
    a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id))
}

#[async_trait::async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: Job) -> Result<JobId, DatabaseError> {
        let mut tables = self.write()?;
        if tables.jobs.contains_key(&job.id) {
            return Err(DatabaseError::conflict(format!("job {} already exists", job.id)));
        }
        if let Some(key) = &job.unique_key {
            if tables.unique_keys.contains_key(key) {
                return Err(DatabaseError::conflict(format!(
                    "a job with unique key `{key}` already exists"
                )));
            }
            tables.unique_keys.insert(key.clone(), job.id);
        }
        let id = job.id;
        tables.jobs.insert(id, job);
        Ok(id)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, DatabaseError> {
        Ok(self.read()?.jobs.get(&id).cloned())
    }

    async fn claim_next(
        &self,
        owner: &WorkerId,
        job_types: &[String],
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<Job>, DatabaseError> {
        let mut tables = self.write()?;
        let next = tables
            .jobs
            .values()
            .filter(|job| job.is_due(now) && job_types.iter().any(|t| *t == job.job_type))
            .min_by(|a, b| a.run_at.cmp(&b.run_at).then_with(|| oldest_first(a, b)))
            .map(|job| job.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(job) = tables.jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.claim(owner.clone(), now, lease_until)
            .map_err(|e| DatabaseError::corrupt(e.to_string()))?;
        Ok(Some(job.clone()))
    }

    async fn compare_and_set(
        &self,
        job: &Job,
        expected_status: JobStatus,
        expected_owner: Option<&WorkerId>,
    ) -> Result<bool, DatabaseError> {
        let mut tables = self.write()?;
        let Some(current) = tables.jobs.get_mut(&job.id) else {
            return Err(DatabaseError::not_found(format!("job {}", job.id)));
        };
        if current.status != expected_status || current.owner.as_ref() != expected_owner {
            return Ok(false);
        }
        *current = job.clone();
        Ok(true)
    }

    async fn extend_lease(
        &self,
        id: JobId,
        owner: &WorkerId,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let mut tables = self.write()?;
        match tables.jobs.get_mut(&id) {
            Some(job)
                if job.status == JobStatus::Active
                    && job.is_owned_by(owner)
                    && !job.lease_expired(now) =>
            {
                job.renew_lease(lease_until, now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reclaim_expired(
        &self,
        job: &Job,
        expected_owner: Option<&WorkerId>,
        expired_lease: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let mut tables = self.write()?;
        let Some(current) = tables.jobs.get_mut(&job.id) else {
            return Err(DatabaseError::not_found(format!("job {}", job.id)));
        };
        if current.status != JobStatus::Active
            || current.owner.as_ref() != expected_owner
            || current.lease_expires_at != Some(expired_lease)
        {
            return Ok(false);
        }
        *current = job.clone();
        Ok(true)
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let mut tables = self.write()?;
        let mut promoted = 0;
        for job in tables.jobs.values_mut() {
            if job.status == JobStatus::Delayed && job.promote(now).unwrap_or(false) {
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    async fn expired_leases(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, DatabaseError> {
        let tables = self.read()?;
        let mut expired: Vec<Job> = tables
            .jobs
            .values()
            .filter(|job| job.lease_expired(now))
            .cloned()
            .collect();
        expired.sort_by(|a, b| a.lease_expires_at.cmp(&b.lease_expires_at));
        expired.truncate(limit);
        Ok(expired)
    }

    async fn list(&self, query: &JobQuery, limit: usize) -> Result<Vec<Job>, DatabaseError> {
        let tables = self.read()?;
        let mut jobs: Vec<Job> = tables
            .jobs
            .values()
            .filter(|job| query.matches(job))
            .cloned()
            .collect();
        jobs.sort_by(oldest_first);
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn stats(&self) -> Result<JobStats, DatabaseError> {
        let tables = self.read()?;
        let mut stats = JobStats::default();
        for job in tables.jobs.values() {
            stats.add(job.status, 1);
        }
        Ok(stats)
    }

    async fn purge_finished(
        &self,
        finished_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<usize, DatabaseError> {
        let mut tables = self.write()?;
        let mut doomed: Vec<&Job> = tables
            .jobs
            .values()
            .filter(|job| is_finished(job.status) && job.updated_at < finished_before)
            .collect();
        doomed.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        let doomed: Vec<JobId> = doomed.into_iter().take(limit).map(|job| job.id).collect();

        for id in &doomed {
            if let Some(job) = tables.jobs.remove(id) {
                if let Some(key) = job.unique_key {
                    tables.unique_keys.remove(&key);
                }
            }
        }
        Ok(doomed.len())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use forgeq_core::FailureKind;
    use serde_json::json;

    use super::*;

    fn job(job_type: &str, now: DateTime<Utc>) -> Job {
        Job::new(job_type, json!({ "n": 1 }), now)
    }

    fn types(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn enqueue_and_get() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let id = store.enqueue(job("email", now)).await.unwrap();

        let loaded = store.get(id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Waiting);
        assert_eq!(loaded.job_type, "email");
    }

    #[tokio::test]
    async fn unique_keys_reject_duplicates() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        store
            .enqueue(job("report", now).with_unique_key("schedule:nightly:1"))
            .await
            .unwrap();

        let err = store
            .enqueue(job("report", now).with_unique_key("schedule:nightly:1"))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.stats().await.unwrap().total(), 1);
    }

    #[tokio::test]
    async fn concurrent_claims_hand_a_job_to_exactly_one_worker() {
        let store = Arc::new(InMemoryJobStore::new());
        let now = Utc::now();
        let id = store.enqueue(job("email", now)).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let owner = WorkerId::new(format!("worker-{i}"));
                store
                    .claim_next(&owner, &types(&["email"]), now, now + Duration::seconds(30))
                    .await
                    .unwrap()
            }));
        }

        let mut claimed = Vec::new();
        for handle in handles {
            if let Some(job) = handle.await.unwrap() {
                claimed.push(job);
            }
        }
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, id);
        assert_eq!(claimed[0].attempts, 1);

        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Active);
        assert_eq!(stored.owner, claimed[0].owner);
    }

    #[tokio::test]
    async fn claim_respects_type_filter_and_due_time() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let owner = WorkerId::new("w");
        let mut later = job("email", now);
        later.run_at = now + Duration::seconds(60);
        store.enqueue(later).await.unwrap();
        store.enqueue(job("sms", now)).await.unwrap();

        let lease = now + Duration::seconds(30);
        assert!(store
            .claim_next(&owner, &types(&["email"]), now, lease)
            .await
            .unwrap()
            .is_none());
        let sms = store
            .claim_next(&owner, &types(&["email", "sms"]), now, lease)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sms.job_type, "sms");
    }

    #[tokio::test]
    async fn compare_and_set_rejects_a_worker_that_lost_ownership() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let id = store.enqueue(job("email", now)).await.unwrap();
        let a = WorkerId::new("a");
        let claimed = store
            .claim_next(&a, &types(&["email"]), now, now + Duration::seconds(30))
            .await
            .unwrap()
            .unwrap();

        let mut stale = claimed.clone();
        stale.complete(now).unwrap();
        let b = WorkerId::new("b");
        assert!(!store
            .compare_and_set(&stale, JobStatus::Active, Some(&b))
            .await
            .unwrap());
        assert!(store
            .compare_and_set(&stale, JobStatus::Active, Some(&a))
            .await
            .unwrap());

        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert!(stored.owner.is_none());
    }

    #[tokio::test]
    async fn delayed_jobs_are_promoted_once_due() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let owner = WorkerId::new("w");
        let id = store.enqueue(job("email", now)).await.unwrap();
        let mut claimed = store
            .claim_next(&owner, &types(&["email"]), now, now + Duration::seconds(30))
            .await
            .unwrap()
            .unwrap();
        claimed.fail("smtp down", FailureKind::Recoverable, now).unwrap();
        store
            .compare_and_set(&claimed, JobStatus::Active, Some(&owner))
            .await
            .unwrap();

        assert_eq!(store.promote_due(now).await.unwrap(), 0);
        let due = claimed.run_at;
        assert_eq!(store.promote_due(due).await.unwrap(), 1);
        assert_eq!(store.get(id).await.unwrap().unwrap().status, JobStatus::Waiting);
    }

    #[tokio::test]
    async fn expired_leases_and_heartbeats() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let owner = WorkerId::new("w");
        let id = store.enqueue(job("email", now)).await.unwrap();
        store
            .claim_next(&owner, &types(&["email"]), now, now + Duration::seconds(10))
            .await
            .unwrap();

        assert!(store.expired_leases(now + Duration::seconds(5), 10).await.unwrap().is_empty());
        assert!(store
            .extend_lease(id, &owner, now + Duration::seconds(20), now + Duration::seconds(5))
            .await
            .unwrap());
        assert!(!store
            .extend_lease(id, &WorkerId::new("other"), now + Duration::seconds(60), now)
            .await
            .unwrap());

        assert!(store.expired_leases(now + Duration::seconds(15), 10).await.unwrap().is_empty());
        let expired = store.expired_leases(now + Duration::seconds(20), 10).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, id);
    }

    #[tokio::test]
    async fn recovery_loses_to_a_heartbeat_that_lands_first() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let owner = WorkerId::new("w");
        let id = store.enqueue(job("email", now)).await.unwrap();
        store
            .claim_next(&owner, &types(&["email"]), now, now + Duration::seconds(10))
            .await
            .unwrap();

        let later = now + Duration::seconds(11);
        let expired = store.expired_leases(later, 10).await.unwrap();
        assert_eq!(expired.len(), 1);
        let seen_lease = expired[0].lease_expires_at.unwrap();

        // Once expired, the owner can no longer heartbeat its way back in.
        assert!(!store
            .extend_lease(id, &owner, later + Duration::seconds(30), later)
            .await
            .unwrap());

        // An owner whose clock lags still renews before the recoverer acts.
        assert!(store
            .extend_lease(id, &owner, now + Duration::seconds(40), now + Duration::seconds(9))
            .await
            .unwrap());

        let mut recovered = expired[0].clone();
        recovered.fail("lease expired", FailureKind::Recoverable, later).unwrap();
        assert!(!store
            .reclaim_expired(&recovered, Some(&owner), seen_lease)
            .await
            .unwrap());

        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Active);
        assert_eq!(stored.owner, Some(owner.clone()));

        // Without a heartbeat in between, recovery goes through.
        let expired = store
            .expired_leases(now + Duration::seconds(41), 10)
            .await
            .unwrap();
        let seen_lease = expired[0].lease_expires_at.unwrap();
        let mut recovered = expired[0].clone();
        recovered
            .fail("lease expired", FailureKind::Recoverable, now + Duration::seconds(41))
            .unwrap();
        assert!(store
            .reclaim_expired(&recovered, Some(&owner), seen_lease)
            .await
            .unwrap());
        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Delayed);
        assert!(stored.owner.is_none());
    }

    #[tokio::test]
    async fn list_filters_and_orders_oldest_first() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let first = store.enqueue(job("email", now)).await.unwrap();
        store.enqueue(job("sms", now + Duration::seconds(1))).await.unwrap();
        let third = store.enqueue(job("email", now + Duration::seconds(2))).await.unwrap();

        let emails = store
            .list(&JobQuery::all().with_job_type("email"), 10)
            .await
            .unwrap();
        assert_eq!(emails.iter().map(|j| j.id).collect::<Vec<_>>(), vec![first, third]);

        let limited = store.list(&JobQuery::all(), 2).await.unwrap();
        assert_eq!(limited.len(), 2);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.waiting, 3);
        assert_eq!(stats.count(JobStatus::Waiting), 3);
    }
}
