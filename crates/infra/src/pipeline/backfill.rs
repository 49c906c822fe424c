//! Backfill: enqueue `normalize_message` jobs for historical messages that have no
//! normalized record yet.
//!
//! Not atomic across the enqueue loop. Re-running is safe: processed messages are
//! skipped by the derived-record check, in-flight ones by the idempotent enqueue.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::instrument;

use crmflow_core::{
    BACKFILL_PRIORITY, DEFAULT_BACKFILL_LIMIT, DomainError, JobType, MessageId, OrganizationId,
    WorkerGroup,
};

use super::PipelineError;
use crate::jobs::{JobStore, NewJob};
use crate::messages::{DerivedRecordStore, MessageSource};

pub const BACKFILL_ENQUEUED: &str = "backfill_enqueued";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillRequest {
    pub organization_id: Option<OrganizationId>,
    /// Candidate messages to consider (default 1000, must be positive).
    pub limit: Option<i64>,
    /// Priority of the created jobs (default 10).
    pub priority: Option<i32>,
}

impl BackfillRequest {
    pub fn for_organization(organization_id: OrganizationId) -> Self {
        Self {
            organization_id: Some(organization_id),
            ..Default::default()
        }
    }
}

/// `enqueued + already_processed == total_messages` always holds. `already_queued`
/// is the part of `enqueued` that was already in flight and got no new row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillReport {
    pub status: String,
    pub total_messages: usize,
    pub already_processed: usize,
    pub enqueued: usize,
    pub already_queued: usize,
}

#[derive(Clone)]
pub struct BackfillCoordinator {
    jobs: Arc<dyn JobStore>,
    messages: Arc<dyn MessageSource>,
    derived: Arc<dyn DerivedRecordStore>,
}

impl BackfillCoordinator {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        messages: Arc<dyn MessageSource>,
        derived: Arc<dyn DerivedRecordStore>,
    ) -> Self {
        Self {
            jobs,
            messages,
            derived,
        }
    }

    #[instrument(skip(self, request), fields(organization_id = tracing::field::Empty), err)]
    pub async fn run(&self, request: BackfillRequest) -> Result<BackfillReport, PipelineError> {
        let organization_id = request
            .organization_id
            .ok_or(DomainError::MissingParameter("organization_id"))?;
        tracing::Span::current().record("organization_id", tracing::field::display(organization_id));

        let limit = match request.limit {
            None => DEFAULT_BACKFILL_LIMIT,
            Some(l) if l <= 0 => {
                return Err(DomainError::validation("limit must be a positive integer").into());
            }
            Some(l) => u32::try_from(l)
                .map_err(|_| DomainError::validation(format!("limit {l} is too large")))?,
        };
        let priority = request.priority.unwrap_or(BACKFILL_PRIORITY);

        let candidates = self
            .messages
            .recent_with_content(organization_id, limit)
            .await?;

        let processed = self
            .derived
            .existing(WorkerGroup::Normalize, organization_id, &candidates)
            .await?;

        let to_process: Vec<MessageId> = candidates
            .iter()
            .filter(|id| !processed.contains(id))
            .copied()
            .collect();

        let mut already_queued = 0;
        for message_id in &to_process {
            let outcome = self
                .jobs
                .enqueue(NewJob::message(
                    organization_id,
                    JobType::NormalizeMessage,
                    *message_id,
                    priority,
                    serde_json::json!({ "source": "backfill" }),
                ))
                .await?;
            if !outcome.is_new() {
                already_queued += 1;
            }
        }

        let report = BackfillReport {
            status: BACKFILL_ENQUEUED.to_string(),
            total_messages: candidates.len(),
            already_processed: candidates.len() - to_process.len(),
            enqueued: to_process.len(),
            already_queued,
        };

        tracing::info!(
            total_messages = report.total_messages,
            already_processed = report.already_processed,
            enqueued = report.enqueued,
            already_queued = report.already_queued,
            "backfill enqueued"
        );
        Ok(report)
    }
}

impl std::fmt::Debug for BackfillCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackfillCoordinator").finish_non_exhaustive()
    }
}
