//! Core job types and policies.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crmflow_core::{DomainError, EntityType, JobType, MessageId, OrganizationId};

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How long a claim holds before the job may be claimed again.
pub const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(600);

/// Job status as stored in the `status` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to be claimed
    Pending,
    /// Claimed by a worker
    Processing,
    /// Failed, claimable again once `run_after` has passed
    Retry,
    /// Exhausted retries or failed permanently
    Failed,
    /// Derived record written
    Done,
}

impl JobStatus {
    /// Statuses counted as queue depth.
    pub const QUEUED: [JobStatus; 2] = [JobStatus::Pending, JobStatus::Retry];

    /// Statuses that block a second enqueue of the same entity and job type.
    pub const IN_FLIGHT: [JobStatus; 3] = [JobStatus::Pending, JobStatus::Processing, JobStatus::Retry];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Retry => "retry",
            JobStatus::Failed => "failed",
            JobStatus::Done => "done",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }

    pub fn is_claimable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Retry)
    }

    pub fn is_in_flight(&self) -> bool {
        Self::IN_FLIGHT.contains(self)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "retry" => Ok(JobStatus::Retry),
            "failed" => Ok(JobStatus::Failed),
            "done" => Ok(JobStatus::Done),
            other => Err(DomainError::unknown("job_status", other)),
        }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
}

/// Retry policy applied when a claimed job fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts before a job becomes `failed` (including the first one)
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(64),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay before the next claim after `attempt` failed (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(30) as i32);
                (base_ms * exp).min(max_ms)
            }
        };

        // Deterministic jitter so two jobs failing together do not retry in lockstep.
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Whether a job that has used `attempts` attempts may be tried again.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Insertion request for the job store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub organization_id: OrganizationId,
    pub job_type: JobType,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub priority: i32,
    pub payload: serde_json::Value,
}

impl NewJob {
    /// A job for a message entity.
    pub fn message(
        organization_id: OrganizationId,
        job_type: JobType,
        message_id: MessageId,
        priority: i32,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            organization_id,
            job_type,
            entity_type: EntityType::Message,
            entity_id: message_id.into(),
            priority,
            payload,
        }
    }
}

/// Outcome of an idempotent enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new `pending` job was inserted.
    Enqueued(JobId),
    /// A `pending`/`processing`/`retry` job for the same entity and type already exists.
    AlreadyQueued(JobId),
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> JobId {
        match self {
            EnqueueOutcome::Enqueued(id) | EnqueueOutcome::AlreadyQueued(id) => *id,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, EnqueueOutcome::Enqueued(_))
    }
}

/// A unit of pipeline work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub organization_id: OrganizationId,
    pub job_type: JobType,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    /// Lower is more urgent
    pub priority: i32,
    pub status: JobStatus,
    pub payload: serde_json::Value,
    /// Claims so far
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Earliest time the job may be claimed; for a `processing` job, the end of its claim lease
    pub run_after: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new `pending` job.
    pub fn new(new: NewJob) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            organization_id: new.organization_id,
            job_type: new.job_type,
            entity_type: new.entity_type,
            entity_id: new.entity_id,
            priority: new.priority,
            status: JobStatus::Pending,
            payload: new.payload,
            attempts: 0,
            last_error: None,
            run_after: now,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn message_id(&self) -> Option<MessageId> {
        matches!(self.entity_type, EntityType::Message).then(|| MessageId::from_uuid(self.entity_id))
    }

    /// Whether the job may be claimed at `now`: queued and due, or `processing` with an
    /// expired lease (its worker died or its final write was lost).
    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        (self.status.is_claimable() || self.status == JobStatus::Processing) && self.run_after <= now
    }

    pub fn lease_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Processing && self.run_after <= now
    }

    /// Same entity and job type as `new`.
    pub fn targets(&self, new: &NewJob) -> bool {
        self.organization_id == new.organization_id
            && self.entity_type == new.entity_type
            && self.entity_id == new.entity_id
            && self.job_type == new.job_type
    }

    /// Claim the job for `lease`; after that it may be claimed again.
    pub fn mark_processing(&mut self, lease: Duration) {
        let now = Utc::now();
        self.status = JobStatus::Processing;
        self.attempts += 1;
        self.run_after = now + chrono::Duration::from_std(lease).unwrap_or_default();
        self.updated_at = now;
    }

    pub fn mark_done(&mut self) {
        self.status = JobStatus::Done;
        self.last_error = None;
        self.updated_at = Utc::now();
    }

    /// Record a failed attempt: `retry` with backoff, or `failed` once attempts run out.
    pub fn mark_failed(&mut self, error: impl Into<String>, policy: &RetryPolicy) {
        let now = Utc::now();
        self.last_error = Some(error.into());
        self.updated_at = now;

        if policy.should_retry(self.attempts) {
            let delay = policy.delay_for_attempt(self.attempts);
            self.run_after = now + chrono::Duration::from_std(delay).unwrap_or_default();
            self.status = JobStatus::Retry;
        } else {
            self.status = JobStatus::Failed;
        }
    }

    /// Fail without consulting the retry policy.
    pub fn mark_failed_permanently(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
        self.status = JobStatus::Failed;
        self.updated_at = Utc::now();
    }

    /// Release a claimed job whose input is not ready yet. The claim does not count
    /// as an attempt.
    pub fn defer(&mut self, delay: Duration, reason: impl Into<String>) {
        let now = Utc::now();
        self.status = JobStatus::Pending;
        self.attempts = self.attempts.saturating_sub(1);
        self.last_error = Some(reason.into());
        self.run_after = now + chrono::Duration::from_std(delay).unwrap_or_default();
        self.updated_at = now;
    }

    /// Put a `failed` job back in the queue with a fresh attempt budget.
    pub fn requeue(&mut self) {
        let now = Utc::now();
        self.status = JobStatus::Pending;
        self.attempts = 0;
        self.last_error = None;
        self.run_after = now;
        self.updated_at = now;
    }
}

/// Per-stage job counters (one row of the `pipeline_stats` view).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounters {
    pub stage: String,
    pub pending: i64,
    pub processing: i64,
    pub retry: i64,
    pub failed: i64,
    pub done: i64,
}

impl StageCounters {
    pub fn empty(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            ..Default::default()
        }
    }

    pub fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Processing => self.processing += 1,
            JobStatus::Retry => self.retry += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Done => self.done += 1,
        }
    }
}
