use serde::{Deserialize, Serialize};
use thiserror::Error;

use crmflow_core::WorkerGroup;

use crate::annotate::Annotation;
use crate::embed::Embedding;
use crate::normalize::NormalizedText;

/// Payload of a derived record produced by one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageOutput {
    Normalized(NormalizedText),
    Embedding(Embedding),
    Annotation(Annotation),
}

impl StageOutput {
    /// The worker group whose derived record this is.
    pub fn group(&self) -> WorkerGroup {
        match self {
            StageOutput::Normalized(_) => WorkerGroup::Normalize,
            StageOutput::Embedding(_) => WorkerGroup::Embed,
            StageOutput::Annotation(_) => WorkerGroup::Annotate,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StageError {
    /// The input can never be processed (e.g. message without text).
    #[error("invalid stage input: {0}")]
    InvalidInput(String),

    /// The upstream derived record is not available yet.
    #[error("upstream stage '{0}' has not produced a record yet")]
    MissingUpstream(WorkerGroup),

    #[error("stage processing failed: {0}")]
    Internal(String),
}

impl StageError {
    /// Permanent failures skip the retry policy.
    pub fn is_permanent(&self) -> bool {
        matches!(self, StageError::InvalidInput(_))
    }
}
