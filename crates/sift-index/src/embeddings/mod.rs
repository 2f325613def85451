//! Embedding provider trait and the adapter the pipeline embeds through.
//!
//! Providers only turn text into vectors. [`EmbeddingAdapter`] adds the
//! policies on top: input truncation, batching, per-item retry and
//! dimension checks.

use std::sync::Arc;

use async_trait::async_trait;
use sift_config::{EmbeddingConfig, EmbeddingProviderKind};
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::{IndexError, Result};

mod hash;
mod http;

pub use hash::HashEmbeddings;
pub use http::HttpEmbeddings;

/// Errors that can occur during embedding generation.
#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("API request failed: {0}")]
    ApiError(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Rate limited after {0} retries")]
    RateLimited(u32),

    #[error("Network error: {0}")]
    NetworkError(String),
}

/// Trait for embedding providers.
///
/// Implementations should be Send + Sync to allow use in async contexts.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embed_batch(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::InvalidResponse("no embedding returned".to_string()))
    }

    /// Embed multiple texts in a batch, same order as the input.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// Get the number of dimensions
    fn dimensions(&self) -> usize;

    /// Get the model name
    fn model_name(&self) -> &str;

    /// Get the maximum batch size supported.
    fn max_batch_size(&self) -> usize {
        32
    }
}

/// Build the provider selected by `config`.
pub fn provider_from_config(config: &EmbeddingConfig) -> Arc<dyn EmbeddingProvider> {
    match config.provider {
        EmbeddingProviderKind::Hash => Arc::new(HashEmbeddings::new(config.dimensions)),
        EmbeddingProviderKind::Http => Arc::new(HttpEmbeddings::from_config(config)),
    }
}

/// First `max_chars` characters of `text`, cut on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Wraps a provider with truncation, batching and retry.
#[derive(Clone)]
pub struct EmbeddingAdapter {
    provider: Arc<dyn EmbeddingProvider>,
    max_input_chars: usize,
    batch_size: usize,
}

impl EmbeddingAdapter {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, config: &EmbeddingConfig) -> Self {
        let batch_size = config.batch_size.min(provider.max_batch_size()).max(1);
        Self {
            provider,
            max_input_chars: config.max_input_chars.max(1),
            batch_size,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.provider.dimensions()
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    /// Embed `texts` in order. A failed batch is retried item by item; an
    /// item that still fails gets one more attempt at half its length.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let truncated: Vec<String> = batch
                .iter()
                .map(|t| truncate_chars(t, self.max_input_chars).to_string())
                .collect();

            let attempt = self
                .provider
                .embed_batch(&truncated)
                .await
                .and_then(|v| self.check_batch(v, truncated.len()));
            match attempt {
                Ok(batch_vectors) => vectors.extend(batch_vectors),
                Err(e) => {
                    warn!(
                        "Embedding batch of {} failed ({}), retrying individually",
                        truncated.len(),
                        e
                    );
                    for text in &truncated {
                        vectors.push(self.embed_one(text).await?);
                    }
                }
            }
        }
        Ok(vectors)
    }

    /// Embed a search query.
    pub async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        self.embed_one(truncate_chars(query, self.max_input_chars))
            .await
    }

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let first = match self.embed_checked(text).await {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };

        let half = truncate_chars(text, text.chars().count() / 2);
        debug!(
            "Retrying embedding at {} chars after: {}",
            half.chars().count(),
            first
        );
        self.embed_checked(half).await.map_err(|second| {
            IndexError::EmbeddingFailure(format!(
                "{second} (first attempt: {first})"
            ))
        })
    }

    async fn embed_checked(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let vector = self.provider.embed(text).await?;
        self.check(&vector)?;
        Ok(vector)
    }

    fn check_batch(
        &self,
        vectors: Vec<Vec<f32>>,
        expected: usize,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if vectors.len() != expected {
            return Err(EmbeddingError::InvalidResponse(format!(
                "expected {} vectors, got {}",
                expected,
                vectors.len()
            )));
        }
        for vector in &vectors {
            self.check(vector)?;
        }
        Ok(vectors)
    }

    fn check(&self, vector: &[f32]) -> Result<(), EmbeddingError> {
        if vector.len() != self.dimensions() {
            return Err(EmbeddingError::InvalidResponse(format!(
                "expected dimension {}, got {}",
                self.dimensions(),
                vector.len()
            )));
        }
        if vector.iter().any(|x| !x.is_finite()) {
            return Err(EmbeddingError::InvalidResponse(
                "non-finite component".to_string(),
            ));
        }
        Ok(())
    }
}
