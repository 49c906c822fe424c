//! Pipeline job queue.
//!
//! ## Components
//!
//! - `Job`: one unit of stage work for one entity, with status, priority and retry state
//! - `JobStore`: persistence (in-memory or Postgres) with exclusive batch claims
//! - `RetryPolicy`: backoff applied when a claimed job fails

pub mod postgres;
pub mod store;
pub mod types;

pub use postgres::PostgresJobStore;
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use types::{
    BackoffStrategy, DEFAULT_CLAIM_LEASE, EnqueueOutcome, Job, JobId, JobStatus, NewJob, RetryPolicy, StageCounters,
};
