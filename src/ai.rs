//! Trait seams for the external AI collaborators, plus vector math shared
//! across the pipeline.
//!
//! The HTTP clients themselves live outside this crate; everything here talks
//! to an [`EmbeddingProvider`] or a [`ToolCallClient`] and nothing else.

use async_trait::async_trait;

use crate::error::MnemonError;

/// Typed embedding failures. Rate limits are the only retryable case, and
/// only the batch embedder retries them.
#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    #[error("invalid API key")]
    InvalidKey,

    #[error("rate limited")]
    RateLimited,

    #[error("embedding backend: {0}")]
    Backend(String),
}

/// Batched text embedding with fixed dimensionality.
/// `embed` must return exactly one vector per input text, in order.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;
}

/// Structured tool-call interface to the judge LLM.
///
/// Used for merge synthesis, dedup arbitration, claim extraction,
/// contradiction classification, and the loose-cluster same-knowledge check.
/// `component` labels the call for usage accounting; `parameters` is a JSON
/// schema the returned value must satisfy (callers still repair the result —
/// see [`crate::repair`]).
#[async_trait]
pub trait ToolCallClient: Send + Sync {
    async fn tool_call(
        &self,
        component: &str,
        system: &str,
        user: &str,
        fn_name: &str,
        fn_desc: &str,
        parameters: serde_json::Value,
    ) -> Result<serde_json::Value, MnemonError>;
}

/// Cosine similarity between two vectors.
/// Returns 0.0 for zero-length or mismatched inputs, never errors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
    for i in 0..a.len() {
        let (ai, bi) = (a[i] as f64, b[i] as f64);
        dot += ai * bi;
        na += ai * ai;
        nb += bi * bi;
    }
    let denom = na.sqrt() * nb.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        dot / denom
    }
}

/// Mean of a set of equal-length vectors. Empty input gives an empty vector.
pub fn centroid(vectors: &[&[f32]]) -> Vec<f32> {
    let Some(first) = vectors.first() else {
        return vec![];
    };
    let dim = first.len();
    let mut sum = vec![0.0f32; dim];
    let mut count = 0usize;
    for v in vectors {
        if v.len() != dim {
            continue;
        }
        for (s, x) in sum.iter_mut().zip(v.iter()) {
            *s += x;
        }
        count += 1;
    }
    if count == 0 {
        return vec![];
    }
    for s in &mut sum {
        *s /= count as f32;
    }
    sum
}

/// Serialize an f32 vector to bytes (little-endian) for SQLite BLOB storage.
pub fn embedding_to_bytes(v: &[f32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(v.len() * 4);
    for &f in v {
        buf.extend_from_slice(&f.to_le_bytes());
    }
    buf
}

/// Deserialize bytes back to an f32 vector.
pub fn bytes_to_embedding(b: &[u8]) -> Vec<f32> {
    b.chunks_exact(4)
        .map(|chunk| {
            let arr: [u8; 4] = chunk.try_into().expect("4 bytes");
            f32::from_le_bytes(arr)
        })
        .collect()
}
