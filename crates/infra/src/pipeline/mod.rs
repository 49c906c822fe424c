//! Pipeline coordination services.
//!
//! ## Components
//!
//! - `Scheduler`: one tick across every worker group, in order
//! - `WorkerDispatcher`: hands `{worker_group, batch_size}` to a stage worker (HTTP or in-process)
//! - `PipelineWorker`: claims a batch for one group and runs its stage processor
//! - `BackfillCoordinator`: enqueues historical messages that have no normalized record yet
//! - `Enqueuer`: live enqueue of a single message and requeue of failed jobs
//! - `StatsReporter`: queue depth, failed jobs and per-stage counters

pub mod backfill;
pub mod dispatcher;
pub mod enqueuer;
pub mod scheduler;
pub mod stats;
pub mod worker;

pub use backfill::{BackfillCoordinator, BackfillReport, BackfillRequest};
pub use dispatcher::{
    DispatchError, HttpWorkerDispatcher, LocalWorkerDispatcher, WorkerDispatcher, WorkerRequest,
};
pub use enqueuer::{EnqueueReport, EnqueueRequest, EnqueueStatus, Enqueuer, RequeueReport, RequeueRequest};
pub use scheduler::{Scheduler, TickReport};
pub use stats::{PipelineStatsSnapshot, StatsReporter};
pub use worker::{PipelineWorker, WorkerReport};

use crmflow_core::DomainError;

use crate::jobs::JobStoreError;
use crate::messages::MessageStoreError;

/// Error surfaced by the request-level pipeline operations.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("job store: {0}")]
    JobStore(#[from] JobStoreError),

    #[error("message store: {0}")]
    MessageStore(#[from] MessageStoreError),
}

impl PipelineError {
    /// Caller-side failures (bad or missing parameters) as opposed to storage failures.
    pub fn is_client_error(&self) -> bool {
        matches!(self, PipelineError::Domain(_))
    }
}
