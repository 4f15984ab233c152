//! Embedding backends.
//!
//! | Config value | Embedder |
//! |--------------|----------|
//! | `"hash"` | [`HashEmbedder`]: offline feature hashing, the default |
//! | `"openai"` | [`OpenAIEmbedder`]: `POST /v1/embeddings` |
//! | `"ollama"` | [`OllamaEmbedder`]: `POST /api/embed` |
//! | `"local"` | `LocalEmbedder`: fastembed, needs the `local-embeddings` feature |
//!
//! Embedders make exactly one attempt per call. Transient failures (HTTP
//! 429, 5xx, connection errors) come back as retryable
//! [`IndexError::Provider`] errors; the retry and circuit-breaker wrapping
//! happens one level up in [`crate::provider`].

#[cfg(feature = "local-embeddings")]
mod local;
mod remote;

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::config::EmbeddingConfig;
use crate::error::{IndexError, IndexResult};

#[cfg(feature = "local-embeddings")]
pub use local::LocalEmbedder;
pub use remote::{OllamaEmbedder, OpenAIEmbedder};

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier recorded in the index artifacts.
    fn model_name(&self) -> &str;

    fn dims(&self) -> usize;

    /// Report missing credentials without making a network call.
    fn check_credentials(&self) -> Result<(), String> {
        Ok(())
    }

    /// One vector per input text, in input order.
    async fn embed(&self, texts: &[String]) -> IndexResult<Vec<Vec<f32>>>;
}

pub const DEFAULT_HASH_DIMS: usize = 256;

/// Deterministic bag-of-words embedding via signed feature hashing.
///
/// Needs no model or network, so builds and queries work fully offline.
/// Texts sharing vocabulary land close together under cosine similarity.
pub struct HashEmbedder {
    dims: usize,
    model: String,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        let dims = dims.max(1);
        Self {
            dims,
            model: format!("hash-{}", dims),
        }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for token in tokenize(text) {
            let digest = Sha256::digest(token.as_bytes());
            let mut idx_bytes = [0u8; 8];
            idx_bytes.copy_from_slice(&digest[..8]);
            let idx = (u64::from_le_bytes(idx_bytes) % self.dims as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[idx] += sign;
        }
        normalize_l2(v)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> IndexResult<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

/// Lowercased alphanumeric tokens.
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

fn normalize_l2(mut v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

/// Map an HTTP failure to a provider error, retryable for 429 and 5xx.
pub(crate) fn status_error(provider: &str, status: reqwest::StatusCode, body: &str) -> IndexError {
    let retryable = status.as_u16() == 429 || status.is_server_error();
    IndexError::provider(format!("{} API error {}: {}", provider, status, body), retryable)
}

/// Connection-level failures are always worth another attempt.
pub(crate) fn transport_error(provider: &str, url: &str, err: reqwest::Error) -> IndexError {
    IndexError::provider(
        format!("{} connection error ({}): {}", provider, url, err),
        true,
    )
}

/// Build the configured embedder.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "hash" => Ok(Arc::new(HashEmbedder::new(
            config.dims.unwrap_or(DEFAULT_HASH_DIMS),
        ))),
        "openai" => Ok(Arc::new(OpenAIEmbedder::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        #[cfg(feature = "local-embeddings")]
        "local" => Ok(Arc::new(LocalEmbedder::new(config)?)),
        #[cfg(not(feature = "local-embeddings"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}
