//! Live enqueue of single messages and requeue of failed jobs.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::instrument;

use crmflow_core::{DomainError, JobType, LIVE_PRIORITY, MessageId, OrganizationId, OrganizationScope, WorkerGroup};

use super::PipelineError;
use crate::jobs::{EnqueueOutcome, JobId, JobStore, NewJob};
use crate::messages::DerivedRecordStore;

/// Failed jobs requeued per call when no limit is given.
pub const DEFAULT_REQUEUE_LIMIT: u32 = 100;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub organization_id: Option<OrganizationId>,
    pub message_id: Option<MessageId>,
    pub priority: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnqueueStatus {
    Enqueued,
    AlreadyQueued,
    AlreadyProcessed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueReport {
    pub status: EnqueueStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequeueRequest {
    pub organization_id: Option<OrganizationId>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequeueReport {
    pub status: String,
    pub requeued: u64,
}

#[derive(Clone)]
pub struct Enqueuer {
    jobs: Arc<dyn JobStore>,
    derived: Arc<dyn DerivedRecordStore>,
}

impl Enqueuer {
    pub fn new(jobs: Arc<dyn JobStore>, derived: Arc<dyn DerivedRecordStore>) -> Self {
        Self { jobs, derived }
    }

    /// Enqueue a `normalize_message` job unless the message is already normalized.
    #[instrument(skip(self, request), err)]
    pub async fn enqueue_message(&self, request: EnqueueRequest) -> Result<EnqueueReport, PipelineError> {
        let organization_id = request
            .organization_id
            .ok_or(DomainError::MissingParameter("organization_id"))?;
        let message_id = request
            .message_id
            .ok_or(DomainError::MissingParameter("message_id"))?;

        let processed = self
            .derived
            .existing(WorkerGroup::Normalize, organization_id, &[message_id])
            .await?;
        if processed.contains(&message_id) {
            return Ok(EnqueueReport {
                status: EnqueueStatus::AlreadyProcessed,
                job_id: None,
            });
        }

        let outcome = self
            .jobs
            .enqueue(NewJob::message(
                organization_id,
                JobType::NormalizeMessage,
                message_id,
                request.priority.unwrap_or(LIVE_PRIORITY),
                serde_json::json!({ "source": "live" }),
            ))
            .await?;

        let status = match outcome {
            EnqueueOutcome::Enqueued(_) => EnqueueStatus::Enqueued,
            EnqueueOutcome::AlreadyQueued(_) => EnqueueStatus::AlreadyQueued,
        };
        tracing::debug!(%organization_id, %message_id, ?status, "message enqueue");

        Ok(EnqueueReport {
            status,
            job_id: Some(outcome.job_id()),
        })
    }

    /// Move `failed` jobs back to `pending`, optionally for one organization.
    #[instrument(skip(self, request), err)]
    pub async fn requeue_failed(&self, request: RequeueRequest) -> Result<RequeueReport, PipelineError> {
        let limit = match request.limit {
            None => DEFAULT_REQUEUE_LIMIT,
            Some(l) if l <= 0 => {
                return Err(DomainError::validation("limit must be a positive integer").into());
            }
            Some(l) => u32::try_from(l)
                .map_err(|_| DomainError::validation(format!("limit {l} is too large")))?,
        };
        let scope = OrganizationScope::from(request.organization_id);

        let requeued = self.jobs.requeue_failed(scope, limit).await?;
        tracing::info!(requeued, "failed jobs requeued");

        Ok(RequeueReport {
            status: "requeued".to_string(),
            requeued,
        })
    }
}

impl std::fmt::Debug for Enqueuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Enqueuer").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{DEFAULT_CLAIM_LEASE, InMemoryJobStore, JobStatus};
    use crate::messages::{DerivedRecord, InMemoryDerivedStore};
    use crmflow_ai::{StageOutput, TextNormalizer};
    use crmflow_core::JobType;

    fn enqueuer() -> (Arc<InMemoryJobStore>, Arc<InMemoryDerivedStore>, Enqueuer) {
        let jobs = Arc::new(InMemoryJobStore::new());
        let derived = Arc::new(InMemoryDerivedStore::new());
        let enqueuer = Enqueuer::new(jobs.clone(), derived.clone());
        (jobs, derived, enqueuer)
    }

    #[tokio::test]
    async fn live_enqueue_uses_live_priority_and_is_idempotent() {
        let (jobs, _, enqueuer) = enqueuer();
        let request = EnqueueRequest {
            organization_id: Some(OrganizationId::new()),
            message_id: Some(MessageId::new()),
            priority: None,
        };

        let first = enqueuer.enqueue_message(request.clone()).await.unwrap();
        assert_eq!(first.status, EnqueueStatus::Enqueued);

        let second = enqueuer.enqueue_message(request).await.unwrap();
        assert_eq!(second.status, EnqueueStatus::AlreadyQueued);
        assert_eq!(second.job_id, first.job_id);

        let all = jobs.all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].priority, LIVE_PRIORITY);
        assert_eq!(all[0].job_type, JobType::NormalizeMessage);
    }

    #[tokio::test]
    async fn normalized_messages_are_not_enqueued() {
        let (jobs, derived, enqueuer) = enqueuer();
        let org = OrganizationId::new();
        let message = MessageId::new();
        let output = StageOutput::Normalized(TextNormalizer.normalize("ok").unwrap());
        derived.save(&DerivedRecord::new(org, message, output)).await.unwrap();

        let report = enqueuer
            .enqueue_message(EnqueueRequest {
                organization_id: Some(org),
                message_id: Some(message),
                priority: None,
            })
            .await
            .unwrap();
        assert_eq!(report.status, EnqueueStatus::AlreadyProcessed);
        assert!(jobs.is_empty().unwrap());
    }

    #[tokio::test]
    async fn missing_message_id_is_a_client_error() {
        let (jobs, _, enqueuer) = enqueuer();
        let err = enqueuer
            .enqueue_message(EnqueueRequest {
                organization_id: Some(OrganizationId::new()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "message_id required");
        assert!(jobs.is_empty().unwrap());
    }

    #[tokio::test]
    async fn requeue_moves_failed_jobs_back_to_pending() {
        let (jobs, _, enqueuer) = enqueuer();
        let org = OrganizationId::new();
        let outcome = jobs
            .enqueue(NewJob::message(org, JobType::EmbedMessage, MessageId::new(), 0, serde_json::json!({})))
            .await
            .unwrap();
        let mut job = jobs.get(outcome.job_id()).await.unwrap().unwrap();
        job.mark_processing(DEFAULT_CLAIM_LEASE);
        job.mark_failed_permanently("boom");
        jobs.update(&job).await.unwrap();

        let report = enqueuer
            .requeue_failed(RequeueRequest {
                organization_id: Some(org),
                limit: None,
            })
            .await
            .unwrap();
        assert_eq!(report.requeued, 1);
        assert_eq!(jobs.get(job.id).await.unwrap().unwrap().status, JobStatus::Pending);
    }
}
