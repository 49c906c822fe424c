use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crmflow_core::WorkerGroup;

use crate::normalize::tokenize;
use crate::result::{StageError, StageOutput};
use crate::stage::{StageInput, StageProcessor};

/// Width of vectors produced by [`HashingEmbedder`].
pub const EMBEDDING_DIMENSIONS: usize = 64;

const MODEL_NAME: &str = "feature-hash-sha256-v1";

/// Dense vector for a message (derived record of the `embed` stage).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub model: String,
    pub dimensions: usize,
    pub vector: Vec<f32>,
}

/// Deterministic feature-hashing embedder.
///
/// Model:
/// - Tokenize the normalized text (lowercase alphanumeric runs).
/// - Hash every unigram and adjacent bigram with SHA-256; the first 8 bytes pick a
///   bucket, the next byte picks the sign.
/// - L2-normalise the bucket counts.
///
/// Identical text always yields an identical vector, so cosine similarity between
/// two messages reflects shared vocabulary.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self {
            dimensions: EMBEDDING_DIMENSIONS,
        }
    }
}

impl HashingEmbedder {
    pub fn with_dimensions(dimensions: usize) -> Self {
        Self { dimensions }
    }

    pub fn embed(&self, text: &str) -> Result<Embedding, StageError> {
        if self.dimensions == 0 {
            return Err(StageError::Internal("embedding dimensions must be > 0".to_string()));
        }

        let tokens = tokenize(text);
        if tokens.is_empty() {
            return Err(StageError::InvalidInput(
                "normalized text has no tokens to embed".to_string(),
            ));
        }

        let mut vector = vec![0f32; self.dimensions];
        for token in &tokens {
            self.accumulate(&mut vector, token.as_bytes());
        }
        for pair in tokens.windows(2) {
            let bigram = format!("{} {}", pair[0], pair[1]);
            self.accumulate(&mut vector, bigram.as_bytes());
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        // Opposite-sign collisions can cancel out completely; keep the zero vector then.
        if norm > f32::EPSILON {
            for v in &mut vector {
                *v /= norm;
            }
        }

        Ok(Embedding {
            model: MODEL_NAME.to_string(),
            dimensions: self.dimensions,
            vector,
        })
    }

    fn accumulate(&self, vector: &mut [f32], feature: &[u8]) {
        let digest = Sha256::digest(feature);
        let mut bucket_bytes = [0u8; 8];
        bucket_bytes.copy_from_slice(&digest[..8]);
        let bucket = (u64::from_le_bytes(bucket_bytes) % self.dimensions as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign;
    }
}

impl StageProcessor for HashingEmbedder {
    fn group(&self) -> WorkerGroup {
        WorkerGroup::Embed
    }

    fn process(&self, input: &StageInput) -> Result<StageOutput, StageError> {
        let text = input.require_normalized()?;
        self.embed(text).map(StageOutput::Embedding)
    }
}

/// Cosine similarity of two equally sized vectors (0.0 for mismatched or zero vectors).
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na <= f32::EPSILON || nb <= f32::EPSILON {
        return 0.0;
    }
    dot / (na * nb)
}
