//! Batched embedding with bounded concurrency and rate-limit backoff.
//!
//! The online path embeds one text at a time through the per-run cache; bulk
//! paths chunk into fixed batches with at most 3 requests in flight. Only
//! rate limits are retried — an invalid key fails fast.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use crate::ai::{EmbedError, EmbeddingProvider};
use crate::error::MnemonError;
use crate::thresholds::{EMBED_BATCH, EMBED_MAX_ATTEMPTS, EMBED_MAX_IN_FLIGHT};
use crate::EmbedCache;

const BACKOFF_BASE_MS: u64 = 250;

#[derive(Clone)]
pub struct BatchEmbedder {
    provider: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
    max_in_flight: usize,
    max_attempts: u32,
}

impl BatchEmbedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            provider,
            batch_size: EMBED_BATCH,
            max_in_flight: EMBED_MAX_IN_FLIGHT,
            max_attempts: EMBED_MAX_ATTEMPTS,
        }
    }

    /// Embed a single text, consulting the per-run cache first.
    pub async fn embed_one(
        &self,
        cache: Option<&EmbedCache>,
        text: &str,
    ) -> Result<Vec<f32>, MnemonError> {
        let key = crate::fingerprint::content_hash(text);
        if let Some(cache) = cache {
            if let Some(hit) = cache.get(&key) {
                return Ok(hit);
            }
        }
        let owned = [text.to_string()];
        let mut vecs = self.embed_retry(&owned).await?;
        let emb = vecs
            .pop()
            .ok_or_else(|| MnemonError::Internal("provider returned no embedding".into()))?;
        if let Some(cache) = cache {
            cache.insert(key, emb.clone());
        }
        Ok(emb)
    }

    /// Embed many texts: fixed-size chunks, bounded in-flight requests,
    /// results in input order.
    pub async fn embed_all(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MnemonError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        let chunks: Vec<Vec<String>> = texts
            .chunks(self.batch_size)
            .map(|c| c.to_vec())
            .collect();
        debug!(texts = texts.len(), chunks = chunks.len(), "embedding batch");

        // `buffered` preserves chunk order while keeping up to
        // `max_in_flight` requests running.
        let results: Vec<Result<Vec<Vec<f32>>, MnemonError>> = stream::iter(
            chunks.into_iter().map(|chunk| {
                let this = self.clone();
                async move { this.embed_retry(&chunk).await }
            }),
        )
        .buffered(self.max_in_flight)
        .collect()
        .await;

        let mut out = Vec::with_capacity(texts.len());
        for r in results {
            out.extend(r?);
        }
        if out.len() != texts.len() {
            return Err(MnemonError::Internal(format!(
                "embedding count mismatch: sent {} texts, got {} vectors",
                texts.len(),
                out.len()
            )));
        }
        Ok(out)
    }

    /// One chunk with exponential backoff on rate limits.
    async fn embed_retry(&self, chunk: &[String]) -> Result<Vec<Vec<f32>>, MnemonError> {
        let mut attempt = 0u32;
        loop {
            match self.provider.embed(chunk).await {
                Ok(vecs) => return Ok(vecs),
                Err(EmbedError::RateLimited) => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        return Err(EmbedError::RateLimited.into());
                    }
                    let delay = BACKOFF_BASE_MS << (attempt - 1).min(10);
                    warn!(attempt, delay_ms = delay, "embedding rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
