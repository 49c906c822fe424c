//! Pipeline health snapshot, recomputed on every call.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::instrument;

use crmflow_core::OrganizationScope;

use super::PipelineError;
use crate::jobs::{JobStatus, JobStore, StageCounters};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStatsSnapshot {
    pub pipeline_stats: Vec<StageCounters>,
    /// Jobs in `pending` or `retry`.
    pub queue_depth: i64,
    /// Jobs in `failed`.
    pub failed_jobs: i64,
}

#[derive(Clone)]
pub struct StatsReporter {
    jobs: Arc<dyn JobStore>,
}

impl StatsReporter {
    pub fn new(jobs: Arc<dyn JobStore>) -> Self {
        Self { jobs }
    }

    #[instrument(skip(self), err)]
    pub async fn snapshot(&self, scope: OrganizationScope) -> Result<PipelineStatsSnapshot, PipelineError> {
        let (pipeline_stats, queue_depth, failed_jobs) = tokio::try_join!(
            self.jobs.stage_counters(scope),
            self.jobs.count_by_status(scope, &JobStatus::QUEUED),
            self.jobs.count_by_status(scope, &[JobStatus::Failed]),
        )?;

        Ok(PipelineStatsSnapshot {
            pipeline_stats,
            queue_depth: queue_depth.max(0),
            failed_jobs: failed_jobs.max(0),
        })
    }
}

impl std::fmt::Debug for StatsReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsReporter").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{DEFAULT_CLAIM_LEASE, InMemoryJobStore, NewJob, RetryPolicy};
    use crmflow_core::{JobType, MessageId, OrganizationId};
    use std::time::Duration;

    #[tokio::test]
    async fn queue_depth_counts_pending_and_retry_only() {
        let jobs = Arc::new(InMemoryJobStore::new());
        let org = OrganizationId::new();
        for _ in 0..4 {
            jobs.enqueue(NewJob::message(org, JobType::NormalizeMessage, MessageId::new(), 0, serde_json::json!({})))
                .await
                .unwrap();
        }

        // 4 pending → claim 3: one retry, one failed, one left processing.
        let mut claimed = jobs.claim_batch(JobType::NormalizeMessage, 3, DEFAULT_CLAIM_LEASE).await.unwrap();
        claimed[0].mark_failed("transient", &RetryPolicy::fixed(3, Duration::from_secs(60)));
        claimed[1].mark_failed_permanently("permanent");
        for job in &claimed[..2] {
            jobs.update(job).await.unwrap();
        }

        let reporter = StatsReporter::new(jobs.clone());
        let snapshot = reporter.snapshot(OrganizationScope::Any).await.unwrap();
        assert_eq!(snapshot.queue_depth, 2);
        assert_eq!(snapshot.failed_jobs, 1);

        let normalize = &snapshot.pipeline_stats[0];
        assert_eq!(
            (normalize.pending, normalize.processing, normalize.retry, normalize.failed),
            (1, 1, 1, 1)
        );

        let other = reporter
            .snapshot(OrganizationScope::Organization(OrganizationId::new()))
            .await
            .unwrap();
        assert_eq!((other.queue_depth, other.failed_jobs), (0, 0));
    }
}
