//! Job storage abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;

use crmflow_core::{JobType, OrganizationScope, WorkerGroup};

use super::types::{EnqueueOutcome, Job, JobId, JobStatus, NewJob, StageCounters};

/// Job store abstraction (the `ai_jobs` table).
#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a `pending` job unless one for the same entity and job type is in flight.
    async fn enqueue(&self, job: NewJob) -> Result<EnqueueOutcome, JobStoreError>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Atomically move up to `limit` claimable jobs of `job_type` to `processing`,
    /// most urgent first (`priority ASC, created_at ASC`). Each claim holds for `lease`;
    /// a `processing` job whose lease has run out is claimable again.
    async fn claim_batch(
        &self,
        job_type: JobType,
        limit: u32,
        lease: Duration,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Persist status, attempts, error and `run_after` of a claimed job.
    async fn update(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Number of jobs in any of `statuses`.
    async fn count_by_status(
        &self,
        scope: OrganizationScope,
        statuses: &[JobStatus],
    ) -> Result<i64, JobStoreError>;

    /// One row of counters per stage.
    async fn stage_counters(
        &self,
        scope: OrganizationScope,
    ) -> Result<Vec<StageCounters>, JobStoreError>;

    /// Move up to `limit` `failed` jobs back to `pending` with a fresh attempt budget.
    async fn requeue_failed(
        &self,
        scope: OrganizationScope,
        limit: u32,
    ) -> Result<u64, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("corrupt job row: {0}")]
    Decode(String),
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Snapshot of every stored job, oldest first.
    pub fn all(&self) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.read()?;
        let mut all: Vec<_> = jobs.values().cloned().collect();
        all.sort_by_key(|j| (j.created_at, j.id.0));
        Ok(all)
    }

    pub fn len(&self) -> Result<usize, JobStoreError> {
        Ok(self.read()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, JobStoreError> {
        Ok(self.read()?.is_empty())
    }

    /// Insert a job as-is (tests seed `failed` / `done` rows this way).
    pub fn insert(&self, job: Job) -> Result<(), JobStoreError> {
        self.write()?.insert(job.id, job);
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .read()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .write()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }
}

#[async_trait::async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, new: NewJob) -> Result<EnqueueOutcome, JobStoreError> {
        let mut jobs = self.write()?;
        if let Some(existing) = jobs
            .values()
            .find(|j| j.status.is_in_flight() && j.targets(&new))
        {
            return Ok(EnqueueOutcome::AlreadyQueued(existing.id));
        }

        let job = Job::new(new);
        let id = job.id;
        jobs.insert(id, job);
        Ok(EnqueueOutcome::Enqueued(id))
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read()?.get(&job_id).cloned())
    }

    async fn claim_batch(
        &self,
        job_type: JobType,
        limit: u32,
        lease: Duration,
    ) -> Result<Vec<Job>, JobStoreError> {
        // The write lock is held for the whole select-and-mark, so concurrent
        // claimers never see the same job.
        let mut jobs = self.write()?;
        let now = Utc::now();

        let mut candidates: Vec<_> = jobs
            .values()
            .filter(|j| j.job_type == job_type && j.is_claimable_at(now))
            .map(|j| (j.priority, j.created_at, j.id))
            .collect();

        candidates.sort_by_key(|(priority, created_at, id)| (*priority, *created_at, id.0));
        candidates.truncate(limit as usize);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, _, id) in candidates {
            if let Some(job) = jobs.get_mut(&id) {
                if job.lease_expired_at(now) {
                    tracing::warn!(job_id = %job.id, attempts = job.attempts, "reclaiming job with expired lease");
                }
                job.mark_processing(lease);
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut jobs = self.write()?;
        if !jobs.contains_key(&job.id) {
            return Err(JobStoreError::NotFound(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn count_by_status(
        &self,
        scope: OrganizationScope,
        statuses: &[JobStatus],
    ) -> Result<i64, JobStoreError> {
        let jobs = self.read()?;
        Ok(jobs
            .values()
            .filter(|j| scope.allows(j.organization_id) && statuses.contains(&j.status))
            .count() as i64)
    }

    async fn stage_counters(
        &self,
        scope: OrganizationScope,
    ) -> Result<Vec<StageCounters>, JobStoreError> {
        let jobs = self.read()?;
        let mut rows: Vec<StageCounters> = WorkerGroup::ALL
            .iter()
            .map(|g| StageCounters::empty(g.as_str()))
            .collect();

        for job in jobs.values().filter(|j| scope.allows(j.organization_id)) {
            let group = job.job_type.worker_group();
            if let Some(row) = rows.iter_mut().find(|r| r.stage == group.as_str()) {
                row.record(job.status);
            }
        }
        Ok(rows)
    }

    async fn requeue_failed(
        &self,
        scope: OrganizationScope,
        limit: u32,
    ) -> Result<u64, JobStoreError> {
        let mut jobs = self.write()?;

        let mut failed: Vec<_> = jobs
            .values()
            .filter(|j| j.status == JobStatus::Failed && scope.allows(j.organization_id))
            .map(|j| (j.updated_at, j.id))
            .collect();
        failed.sort_by_key(|(updated_at, id)| (*updated_at, id.0));
        failed.truncate(limit as usize);

        let mut requeued = 0;
        for (_, id) in failed {
            if let Some(job) = jobs.get_mut(&id) {
                job.requeue();
                requeued += 1;
            }
        }
        Ok(requeued)
    }
}

#[async_trait::async_trait]
impl<T: JobStore + ?Sized> JobStore for Arc<T> {
    async fn enqueue(&self, job: NewJob) -> Result<EnqueueOutcome, JobStoreError> {
        (**self).enqueue(job).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id).await
    }

    async fn claim_batch(
        &self,
        job_type: JobType,
        limit: u32,
        lease: Duration,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).claim_batch(job_type, limit, lease).await
    }

    async fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        (**self).update(job).await
    }

    async fn count_by_status(
        &self,
        scope: OrganizationScope,
        statuses: &[JobStatus],
    ) -> Result<i64, JobStoreError> {
        (**self).count_by_status(scope, statuses).await
    }

    async fn stage_counters(
        &self,
        scope: OrganizationScope,
    ) -> Result<Vec<StageCounters>, JobStoreError> {
        (**self).stage_counters(scope).await
    }

    async fn requeue_failed(
        &self,
        scope: OrganizationScope,
        limit: u32,
    ) -> Result<u64, JobStoreError> {
        (**self).requeue_failed(scope, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::RetryPolicy;
    use crmflow_core::{MessageId, OrganizationId};

    const LEASE: Duration = Duration::from_secs(600);

    fn normalize_job(org: OrganizationId, priority: i32) -> NewJob {
        NewJob::message(
            org,
            JobType::NormalizeMessage,
            MessageId::new(),
            priority,
            serde_json::json!({}),
        )
    }

    #[tokio::test]
    async fn enqueue_and_claim() {
        let store = InMemoryJobStore::new();
        let org = OrganizationId::new();

        let outcome = store.enqueue(normalize_job(org, 0)).await.unwrap();
        assert!(outcome.is_new());

        let claimed = store.claim_batch(JobType::NormalizeMessage, 10, LEASE).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, outcome.job_id());
        assert_eq!(claimed[0].status, JobStatus::Processing);
        assert_eq!(claimed[0].attempts, 1);

        // No more jobs
        assert!(store.claim_batch(JobType::NormalizeMessage, 10, LEASE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn enqueue_is_idempotent_while_in_flight() {
        let store = InMemoryJobStore::new();
        let new = normalize_job(OrganizationId::new(), 10);

        let first = store.enqueue(new.clone()).await.unwrap();
        let second = store.enqueue(new.clone()).await.unwrap();
        assert_eq!(second, EnqueueOutcome::AlreadyQueued(first.job_id()));
        assert_eq!(store.len().unwrap(), 1);

        // Once the job is done a new one may be enqueued.
        let mut claimed = store.claim_batch(JobType::NormalizeMessage, 1, LEASE).await.unwrap();
        claimed[0].mark_done();
        store.update(&claimed[0]).await.unwrap();

        let third = store.enqueue(new).await.unwrap();
        assert!(third.is_new());
        assert_eq!(store.len().unwrap(), 2);
    }

    #[tokio::test]
    async fn claims_by_priority_then_age_and_only_the_requested_type() {
        let store = InMemoryJobStore::new();
        let org = OrganizationId::new();

        let backfill = store.enqueue(normalize_job(org, 10)).await.unwrap().job_id();
        let live = store.enqueue(normalize_job(org, 0)).await.unwrap().job_id();
        store
            .enqueue(NewJob::message(
                org,
                JobType::EmbedMessage,
                MessageId::new(),
                0,
                serde_json::json!({}),
            ))
            .await
            .unwrap();

        let claimed = store.claim_batch(JobType::NormalizeMessage, 1, LEASE).await.unwrap();
        assert_eq!(claimed[0].id, live);

        let claimed = store.claim_batch(JobType::NormalizeMessage, 5, LEASE).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, backfill);
    }

    #[tokio::test]
    async fn retry_jobs_wait_for_run_after() {
        let store = InMemoryJobStore::new();
        store.enqueue(normalize_job(OrganizationId::new(), 0)).await.unwrap();

        let mut claimed = store.claim_batch(JobType::NormalizeMessage, 1, LEASE).await.unwrap();
        claimed[0].mark_failed("boom", &RetryPolicy::fixed(3, Duration::from_secs(60)));
        store.update(&claimed[0]).await.unwrap();

        assert!(store.claim_batch(JobType::NormalizeMessage, 1, LEASE).await.unwrap().is_empty());
        let queued = store
            .count_by_status(OrganizationScope::Any, &JobStatus::QUEUED)
            .await
            .unwrap();
        assert_eq!(queued, 1);
    }

    #[tokio::test]
    async fn counters_respect_scope() {
        let store = InMemoryJobStore::new();
        let org_a = OrganizationId::new();
        let org_b = OrganizationId::new();

        for _ in 0..3 {
            store.enqueue(normalize_job(org_a, 0)).await.unwrap();
        }
        store.enqueue(normalize_job(org_b, 0)).await.unwrap();

        let rows = store.stage_counters(OrganizationScope::Organization(org_a)).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].stage, "normalize");
        assert_eq!(rows[0].pending, 3);
        assert_eq!(rows[1].pending, 0);

        let all = store
            .count_by_status(OrganizationScope::Any, &[JobStatus::Pending])
            .await
            .unwrap();
        assert_eq!(all, 4);
    }

    #[tokio::test]
    async fn requeue_failed_resets_attempts() {
        let store = InMemoryJobStore::new();
        let org = OrganizationId::new();
        store.enqueue(normalize_job(org, 0)).await.unwrap();

        let mut claimed = store.claim_batch(JobType::NormalizeMessage, 1, LEASE).await.unwrap();
        claimed[0].mark_failed_permanently("no content");
        store.update(&claimed[0]).await.unwrap();

        let other_org = store
            .requeue_failed(OrganizationScope::Organization(OrganizationId::new()), 10)
            .await
            .unwrap();
        assert_eq!(other_org, 0);

        let requeued = store.requeue_failed(OrganizationScope::Any, 10).await.unwrap();
        assert_eq!(requeued, 1);

        let job = store.get(claimed[0].id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
    }

    #[tokio::test]
    async fn abandoned_claim_is_reclaimed_after_its_lease() {
        let store = InMemoryJobStore::new();
        let new = normalize_job(OrganizationId::new(), 0);
        let id = store.enqueue(new.clone()).await.unwrap().job_id();

        // Claimed and never updated, as if the worker died.
        let abandoned = store
            .claim_batch(JobType::NormalizeMessage, 1, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(abandoned[0].id, id);
        assert_eq!(store.enqueue(new).await.unwrap(), EnqueueOutcome::AlreadyQueued(id));

        let reclaimed = store.claim_batch(JobType::NormalizeMessage, 1, LEASE).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, id);
        assert_eq!(reclaimed[0].attempts, 2);

        // The fresh lease holds.
        assert!(store.claim_batch(JobType::NormalizeMessage, 1, LEASE).await.unwrap().is_empty());

        let mut job = reclaimed[0].clone();
        job.mark_done();
        store.update(&job).await.unwrap();
        assert_eq!(store.get(id).await.unwrap().unwrap().status, JobStatus::Done);
    }
}
