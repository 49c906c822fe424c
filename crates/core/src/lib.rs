//! `crmflow-core`: shared vocabulary of the message pipeline.
//!
//! This crate contains **pure** types only (no storage, transport or runtime concerns):
//! identifiers, the worker-group / job-type taxonomy and the domain error model.

pub mod error;
pub mod id;
pub mod pipeline;
pub mod scope;

pub use error::{DomainError, DomainResult};
pub use id::{MessageId, OrganizationId};
pub use pipeline::{
    EntityType, JobType, WorkerGroup, BACKFILL_PRIORITY, DEFAULT_BACKFILL_LIMIT,
    DEFAULT_BATCH_SIZE, LIVE_PRIORITY,
};
pub use scope::OrganizationScope;
