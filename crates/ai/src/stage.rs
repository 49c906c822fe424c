use crmflow_core::{MessageId, OrganizationId, WorkerGroup};

use crate::annotate::KeywordAnnotator;
use crate::embed::HashingEmbedder;
use crate::normalize::TextNormalizer;
use crate::result::{StageError, StageOutput};

/// Everything a stage may read about one message.
#[derive(Debug, Clone, PartialEq)]
pub struct StageInput {
    pub organization_id: OrganizationId,
    pub message_id: MessageId,
    /// Raw message content as stored by the messenger integration.
    pub content: Option<String>,
    /// Normalized text, present once the `normalize` stage has run.
    pub normalized: Option<String>,
}

impl StageInput {
    /// Normalized text, or `MissingUpstream` for stages that depend on it.
    pub fn require_normalized(&self) -> Result<&str, StageError> {
        self.normalized
            .as_deref()
            .ok_or(StageError::MissingUpstream(WorkerGroup::Normalize))
    }
}

/// A single processing stage.
///
/// Must not perform I/O; the worker owns loading inputs and persisting outputs.
pub trait StageProcessor: Send + Sync + 'static {
    fn group(&self) -> WorkerGroup;

    fn process(&self, input: &StageInput) -> Result<StageOutput, StageError>;
}

/// Fixed set of processors, one per worker group.
pub struct StageRegistry {
    normalize: Box<dyn StageProcessor>,
    embed: Box<dyn StageProcessor>,
    annotate: Box<dyn StageProcessor>,
}

impl StageRegistry {
    pub fn new(
        normalize: Box<dyn StageProcessor>,
        embed: Box<dyn StageProcessor>,
        annotate: Box<dyn StageProcessor>,
    ) -> Self {
        Self {
            normalize,
            embed,
            annotate,
        }
    }

    pub fn get(&self, group: WorkerGroup) -> &dyn StageProcessor {
        match group {
            WorkerGroup::Normalize => self.normalize.as_ref(),
            WorkerGroup::Embed => self.embed.as_ref(),
            WorkerGroup::Annotate => self.annotate.as_ref(),
        }
    }
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::new(
            Box::new(TextNormalizer),
            Box::new(HashingEmbedder::default()),
            Box::new(KeywordAnnotator),
        )
    }
}

impl std::fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRegistry").finish_non_exhaustive()
    }
}
