//! Stage worker: claims one batch for one worker group and runs its processor.
//!
//! Per job:
//! 1. Load the source message (missing, or owned by another organization → `failed`,
//!    no retry).
//! 2. Check the upstream derived record exists (missing → back to `pending` after the
//!    defer delay, without consuming an attempt).
//! 3. Run the stage processor and save its derived record.
//! 4. Enqueue the downstream group's job at the same priority.
//! 5. Mark the job `done`.
//!
//! Any failure in 3–4 goes through the retry policy.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::instrument;

use crmflow_ai::{StageError, StageInput, StageRegistry};
use crmflow_core::{DomainError, WorkerGroup};

use super::PipelineError;
use crate::jobs::{DEFAULT_CLAIM_LEASE, Job, JobStatus, JobStore, NewJob, RetryPolicy};
use crate::messages::{DerivedRecord, DerivedRecordStore, MessageSource};

/// Result of one worker invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub worker_group: WorkerGroup,
    pub claimed: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub failed: usize,
    pub deferred: usize,
}

impl WorkerReport {
    fn empty(worker_group: WorkerGroup) -> Self {
        Self {
            worker_group,
            claimed: 0,
            succeeded: 0,
            retried: 0,
            failed: 0,
            deferred: 0,
        }
    }
}

enum Disposition {
    Done,
    Defer(String),
    Retry(String),
    Fail(String),
}

pub struct PipelineWorker {
    jobs: Arc<dyn JobStore>,
    messages: Arc<dyn MessageSource>,
    derived: Arc<dyn DerivedRecordStore>,
    stages: Arc<StageRegistry>,
    retry_policy: RetryPolicy,
    defer_delay: Duration,
    claim_lease: Duration,
}

impl PipelineWorker {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        messages: Arc<dyn MessageSource>,
        derived: Arc<dyn DerivedRecordStore>,
        stages: Arc<StageRegistry>,
    ) -> Self {
        Self {
            jobs,
            messages,
            derived,
            stages,
            retry_policy: RetryPolicy::default(),
            defer_delay: Duration::from_secs(30),
            claim_lease: DEFAULT_CLAIM_LEASE,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_defer_delay(mut self, delay: Duration) -> Self {
        self.defer_delay = delay;
        self
    }

    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    /// Claim up to `batch_size` jobs of `group` and process them one by one.
    #[instrument(skip(self), fields(worker_group = %group), err)]
    pub async fn run_batch(
        &self,
        group: WorkerGroup,
        batch_size: u32,
    ) -> Result<WorkerReport, PipelineError> {
        if batch_size == 0 {
            return Err(DomainError::validation("batch_size must be greater than zero").into());
        }

        let claimed = self
            .jobs
            .claim_batch(group.job_type(), batch_size, self.claim_lease)
            .await?;
        let mut report = WorkerReport::empty(group);
        report.claimed = claimed.len();

        for mut job in claimed {
            match self.execute(group, &job).await {
                Disposition::Done => {
                    job.mark_done();
                    report.succeeded += 1;
                }
                Disposition::Defer(reason) => {
                    job.defer(self.defer_delay, reason);
                    report.deferred += 1;
                }
                Disposition::Retry(error) => {
                    job.mark_failed(error, &self.retry_policy);
                    if job.status == JobStatus::Retry {
                        report.retried += 1;
                    } else {
                        report.failed += 1;
                    }
                }
                Disposition::Fail(error) => {
                    job.mark_failed_permanently(error);
                    report.failed += 1;
                }
            }

            if let Some(error) = &job.last_error {
                tracing::warn!(job_id = %job.id, status = %job.status, error = %error, "job not completed");
            }

            // A failed write leaves the job `processing` until its lease runs out.
            if let Err(e) = self.jobs.update(&job).await {
                tracing::error!(job_id = %job.id, error = %e, "failed to persist job status");
            }
        }

        tracing::info!(
            claimed = report.claimed,
            succeeded = report.succeeded,
            retried = report.retried,
            failed = report.failed,
            deferred = report.deferred,
            "worker batch finished"
        );
        Ok(report)
    }

    async fn execute(&self, group: WorkerGroup, job: &Job) -> Disposition {
        let Some(message_id) = job.message_id() else {
            return Disposition::Fail(format!("unsupported entity type {}", job.entity_type.as_str()));
        };

        let message = match self.messages.load(message_id).await {
            Ok(Some(message)) => message,
            Ok(None) => return Disposition::Fail(format!("message {message_id} not found")),
            Err(e) => return Disposition::Retry(e.to_string()),
        };
        if message.organization_id != job.organization_id {
            return Disposition::Fail(format!(
                "message {message_id} does not belong to organization {}",
                job.organization_id
            ));
        }

        if let Some(upstream) = group.upstream() {
            match self
                .derived
                .existing(upstream, job.organization_id, &[message_id])
                .await
            {
                Ok(found) if found.contains(&message_id) => {}
                Ok(_) => return Disposition::Defer(format!("waiting for {upstream} record")),
                Err(e) => return Disposition::Retry(e.to_string()),
            }
        }

        let normalized = if group == WorkerGroup::Normalize {
            None
        } else {
            match self
                .derived
                .normalized_text(job.organization_id, message_id)
                .await {
                Ok(text) => text,
                Err(e) => return Disposition::Retry(e.to_string()),
            }
        };

        let input = StageInput {
            organization_id: job.organization_id,
            message_id,
            content: message.content,
            normalized,
        };

        let output = match self.stages.get(group).process(&input) {
            Ok(output) => output,
            Err(StageError::MissingUpstream(upstream)) => {
                return Disposition::Defer(format!("waiting for {upstream} record"));
            }
            Err(e) if e.is_permanent() => return Disposition::Fail(e.to_string()),
            Err(e) => return Disposition::Retry(e.to_string()),
        };

        let record = DerivedRecord::new(job.organization_id, message_id, output);
        if let Err(e) = self.derived.save(&record).await {
            return Disposition::Retry(e.to_string());
        }

        if let Some(next) = group.downstream() {
            let new = NewJob::message(
                job.organization_id,
                next.job_type(),
                message_id,
                job.priority,
                serde_json::json!({ "source": group.as_str() }),
            );
            if let Err(e) = self.jobs.enqueue(new).await {
                return Disposition::Retry(e.to_string());
            }
        }

        Disposition::Done
    }
}

impl std::fmt::Debug for PipelineWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineWorker")
            .field("retry_policy", &self.retry_policy)
            .field("defer_delay", &self.defer_delay)
            .field("claim_lease", &self.claim_lease)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{InMemoryJobStore, JobStatus};
    use crate::messages::{InMemoryDerivedStore, InMemoryMessageStore, Message};
    use crmflow_ai::StageOutput;
    use crmflow_core::{JobType, MessageId, OrganizationId, OrganizationScope};

    struct Fixture {
        jobs: Arc<InMemoryJobStore>,
        messages: Arc<InMemoryMessageStore>,
        derived: Arc<InMemoryDerivedStore>,
        worker: PipelineWorker,
    }

    fn fixture() -> Fixture {
        let jobs = Arc::new(InMemoryJobStore::new());
        let messages = Arc::new(InMemoryMessageStore::new());
        let derived = Arc::new(InMemoryDerivedStore::new());
        let worker = PipelineWorker::new(
            jobs.clone(),
            messages.clone(),
            derived.clone(),
            Arc::new(StageRegistry::default()),
        )
        .with_retry_policy(RetryPolicy::fixed(2, Duration::ZERO))
        .with_defer_delay(Duration::from_secs(60));

        Fixture {
            jobs,
            messages,
            derived,
            worker,
        }
    }

    async fn enqueue(f: &Fixture, job_type: JobType, message: &Message) {
        f.jobs
            .enqueue(NewJob::message(
                message.organization_id,
                job_type,
                message.id,
                0,
                serde_json::json!({}),
            ))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn message_flows_through_every_stage() {
        let f = fixture();
        let message = Message::incoming(OrganizationId::new(), "Добрый день! Хочу оплатить абонемент");
        f.messages.insert(message.clone()).unwrap();
        enqueue(&f, JobType::NormalizeMessage, &message).await;

        for group in WorkerGroup::ALL {
            let report = f.worker.run_batch(group, 20).await.unwrap();
            assert_eq!(report.claimed, 1, "{group}");
            assert_eq!(report.succeeded, 1, "{group}");
        }

        for group in WorkerGroup::ALL {
            assert!(f.derived.get(group, message.id).unwrap().is_some(), "{group}");
        }
        let annotation = f.derived.get(WorkerGroup::Annotate, message.id).unwrap().unwrap();
        match annotation.output {
            StageOutput::Annotation(a) => assert_eq!(a.primary, Some(crmflow_ai::IntentLabel::Payment)),
            other => panic!("unexpected output {other:?}"),
        }

        let done = f
            .jobs
            .count_by_status(OrganizationScope::Any, &[JobStatus::Done])
            .await
            .unwrap();
        assert_eq!(done, 3);
    }

    #[tokio::test]
    async fn missing_upstream_defers_without_consuming_an_attempt() {
        let f = fixture();
        let message = Message::incoming(OrganizationId::new(), "hello");
        f.messages.insert(message.clone()).unwrap();
        enqueue(&f, JobType::EmbedMessage, &message).await;

        let report = f.worker.run_batch(WorkerGroup::Embed, 20).await.unwrap();
        assert_eq!(report.deferred, 1);

        let job = &f.jobs.all().unwrap()[0];
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);

        // Not claimable again until the defer delay passes.
        let report = f.worker.run_batch(WorkerGroup::Embed, 20).await.unwrap();
        assert_eq!(report.claimed, 0);
    }

    #[tokio::test]
    async fn missing_message_fails_immediately() {
        let f = fixture();
        f.jobs
            .enqueue(NewJob::message(
                OrganizationId::new(),
                JobType::NormalizeMessage,
                MessageId::new(),
                0,
                serde_json::json!({}),
            ))
            .await
            .unwrap();

        let report = f.worker.run_batch(WorkerGroup::Normalize, 20).await.unwrap();
        assert_eq!(report.failed, 1);

        let job = &f.jobs.all().unwrap()[0];
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.last_error.as_deref().unwrap_or_default().contains("not found"));
    }

    #[tokio::test]
    async fn blank_content_is_not_retried() {
        let f = fixture();
        let message = Message::incoming(OrganizationId::new(), " \u{200B} ");
        f.messages.insert(message.clone()).unwrap();
        enqueue(&f, JobType::NormalizeMessage, &message).await;

        let report = f.worker.run_batch(WorkerGroup::Normalize, 20).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.retried, 0);
        assert_eq!(f.derived.count(WorkerGroup::Normalize).unwrap(), 0);
    }

    #[tokio::test]
    async fn job_for_another_organizations_message_fails_and_leaves_its_records_alone() {
        let f = fixture();
        let owner = OrganizationId::new();
        let intruder = OrganizationId::new();
        let message = Message::incoming(owner, "org B private text");
        f.messages.insert(message.clone()).unwrap();

        enqueue(&f, JobType::NormalizeMessage, &message).await;
        f.worker.run_batch(WorkerGroup::Normalize, 20).await.unwrap();
        let owned = f.derived.get(WorkerGroup::Normalize, message.id).unwrap().unwrap();
        assert_eq!(owned.organization_id, owner);

        f.jobs
            .enqueue(NewJob::message(
                intruder,
                JobType::NormalizeMessage,
                message.id,
                0,
                serde_json::json!({ "source": "live" }),
            ))
            .await
            .unwrap();
        let report = f.worker.run_batch(WorkerGroup::Normalize, 20).await.unwrap();
        assert_eq!((report.claimed, report.failed, report.succeeded), (1, 1, 0));

        let record = f.derived.get(WorkerGroup::Normalize, message.id).unwrap().unwrap();
        assert_eq!(record.organization_id, owner);
        let processed = f
            .derived
            .existing(WorkerGroup::Normalize, owner, &[message.id])
            .await
            .unwrap();
        assert!(processed.contains(&message.id));
        assert!(f.derived.normalized_text(intruder, message.id).await.unwrap().is_none());
        assert_eq!(
            f.jobs
                .count_by_status(OrganizationScope::Organization(intruder), &[JobStatus::Failed])
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn abandoned_job_is_picked_up_by_the_next_batch() {
        let f = fixture();
        let message = Message::incoming(OrganizationId::new(), "hello there");
        f.messages.insert(message.clone()).unwrap();
        enqueue(&f, JobType::NormalizeMessage, &message).await;

        // A worker that claimed the job and died before writing anything back.
        f.jobs
            .claim_batch(JobType::NormalizeMessage, 20, Duration::ZERO)
            .await
            .unwrap();

        let report = f.worker.run_batch(WorkerGroup::Normalize, 20).await.unwrap();
        assert_eq!((report.claimed, report.succeeded), (1, 1));
        assert!(f.derived.get(WorkerGroup::Normalize, message.id).unwrap().is_some());

        let job = &f.jobs.all().unwrap()[0];
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.attempts, 2);
    }

    #[tokio::test]
    async fn zero_batch_size_is_rejected() {
        let f = fixture();
        let err = f.worker.run_batch(WorkerGroup::Normalize, 0).await.unwrap_err();
        assert!(err.is_client_error());
    }
}
