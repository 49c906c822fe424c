//! Worker groups, job types and the defaults the scheduler runs with.
//!
//! The three worker groups form a chain: `normalize` → `embed` → `annotate`.
//! Each group consumes exactly one job type and produces exactly one kind of
//! derived record; the next group's job is enqueued once that record exists.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Jobs claimed per worker group per tick.
pub const DEFAULT_BATCH_SIZE: u32 = 20;

/// Candidate messages selected by one backfill call when no limit is given.
pub const DEFAULT_BACKFILL_LIMIT: u32 = 1000;

/// Priority for backfilled jobs (lower = more urgent).
pub const BACKFILL_PRIORITY: i32 = 10;

/// Priority for jobs enqueued as messages arrive.
pub const LIVE_PRIORITY: i32 = 0;

/// A named processing stage.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerGroup {
    Normalize,
    Embed,
    Annotate,
}

impl WorkerGroup {
    /// Every group, in tick order.
    pub const ALL: [WorkerGroup; 3] = [WorkerGroup::Normalize, WorkerGroup::Embed, WorkerGroup::Annotate];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerGroup::Normalize => "normalize",
            WorkerGroup::Embed => "embed",
            WorkerGroup::Annotate => "annotate",
        }
    }

    /// The job type this group claims.
    pub fn job_type(&self) -> JobType {
        match self {
            WorkerGroup::Normalize => JobType::NormalizeMessage,
            WorkerGroup::Embed => JobType::EmbedMessage,
            WorkerGroup::Annotate => JobType::AnnotateMessage,
        }
    }

    /// Group whose derived record must exist before this group may process an entity.
    pub fn upstream(&self) -> Option<WorkerGroup> {
        match self {
            WorkerGroup::Normalize => None,
            WorkerGroup::Embed => Some(WorkerGroup::Normalize),
            WorkerGroup::Annotate => Some(WorkerGroup::Embed),
        }
    }

    /// Group that is fed once this group finishes an entity.
    pub fn downstream(&self) -> Option<WorkerGroup> {
        match self {
            WorkerGroup::Normalize => Some(WorkerGroup::Embed),
            WorkerGroup::Embed => Some(WorkerGroup::Annotate),
            WorkerGroup::Annotate => None,
        }
    }
}

impl fmt::Display for WorkerGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerGroup {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normalize" => Ok(WorkerGroup::Normalize),
            "embed" => Ok(WorkerGroup::Embed),
            "annotate" => Ok(WorkerGroup::Annotate),
            other => Err(DomainError::unknown("worker_group", other)),
        }
    }
}

/// Kind of deferred work stored in the job table.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    NormalizeMessage,
    EmbedMessage,
    AnnotateMessage,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::NormalizeMessage => "normalize_message",
            JobType::EmbedMessage => "embed_message",
            JobType::AnnotateMessage => "annotate_message",
        }
    }

    pub fn worker_group(&self) -> WorkerGroup {
        match self {
            JobType::NormalizeMessage => WorkerGroup::Normalize,
            JobType::EmbedMessage => WorkerGroup::Embed,
            JobType::AnnotateMessage => WorkerGroup::Annotate,
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normalize_message" => Ok(JobType::NormalizeMessage),
            "embed_message" => Ok(JobType::EmbedMessage),
            "annotate_message" => Ok(JobType::AnnotateMessage),
            other => Err(DomainError::unknown("job_type", other)),
        }
    }
}

/// Kind of entity a job points at.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Message,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Message => "message",
        }
    }
}

impl FromStr for EntityType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message" => Ok(EntityType::Message),
            other => Err(DomainError::unknown("entity_type", other)),
        }
    }
}
