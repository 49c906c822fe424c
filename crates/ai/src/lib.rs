//! `crmflow-ai`
//!
//! **Responsibility:** the per-stage message processors run by the pipeline worker.
//!
//! This crate is storage-agnostic:
//! - It never touches the job store or the message tables.
//! - Inputs are handed in by the worker; outputs are returned as derived-record payloads.
//! - Every processor is deterministic, so retries produce identical records.

pub mod annotate;
pub mod embed;
pub mod normalize;
pub mod result;
pub mod stage;

pub use annotate::{Annotation, IntentLabel, KeywordAnnotator, LabelScore};
pub use embed::{Embedding, HashingEmbedder, EMBEDDING_DIMENSIONS};
pub use normalize::{Language, NormalizedText, TextNormalizer};
pub use result::{StageError, StageOutput};
pub use stage::{StageInput, StageProcessor, StageRegistry};
