//! HTTP embedders for OpenAI and Ollama.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use super::{status_error, transport_error, Embedder};
use crate::config::EmbeddingConfig;
use crate::error::{IndexError, IndexResult};

const OPENAI_URL: &str = "https://api.openai.com";
const OLLAMA_URL: &str = "http://localhost:11434";

fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

/// Embeddings via `POST /v1/embeddings`. Reads `OPENAI_API_KEY` per call.
pub struct OpenAIEmbedder {
    model: String,
    dims: usize,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAIEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        Ok(Self {
            model,
            dims,
            base_url: config.url.clone().unwrap_or_else(|| OPENAI_URL.to_string()),
            client: http_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn check_credentials(&self) -> std::result::Result<(), String> {
        match std::env::var("OPENAI_API_KEY") {
            Ok(key) if !key.trim().is_empty() => Ok(()),
            _ => Err("OPENAI_API_KEY environment variable not set".to_string()),
        }
    }

    async fn embed(&self, texts: &[String]) -> IndexResult<Vec<Vec<f32>>> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| IndexError::provider("OPENAI_API_KEY not set", false))?;
        let url = format!("{}/v1/embeddings", self.base_url.trim_end_matches('/'));

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error("OpenAI", &url, e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error("OpenAI", status, &text));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| transport_error("OpenAI", &url, e))?;
        parse_openai_response(&json)
    }
}

fn parse_openai_response(json: &serde_json::Value) -> IndexResult<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| IndexError::provider("Invalid OpenAI response: missing data array", false))?;

    let mut indexed: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
    for (fallback_index, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| IndexError::provider("Invalid OpenAI response: missing embedding", false))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(fallback_index);
        indexed.push((index, to_f32_vec(embedding)));
    }

    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

/// Embeddings from a local Ollama server via `POST /api/embed`.
pub struct OllamaEmbedder {
    model: String,
    dims: usize,
    url: String,
    client: reqwest::Client,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        Ok(Self {
            model,
            dims,
            url: config.url.clone().unwrap_or_else(|| OLLAMA_URL.to_string()),
            client: http_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> IndexResult<Vec<Vec<f32>>> {
        let url = format!("{}/api/embed", self.url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error("Ollama", &url, e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error("Ollama", status, &text));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| transport_error("Ollama", &url, e))?;
        parse_ollama_response(&json)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> IndexResult<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| {
            IndexError::provider("Invalid Ollama response: missing embeddings array", false)
        })?;

    embeddings
        .iter()
        .map(|e| {
            e.as_array().map(|a| to_f32_vec(a)).ok_or_else(|| {
                IndexError::provider("Invalid Ollama response: embedding is not an array", false)
            })
        })
        .collect()
}

fn to_f32_vec(values: &[serde_json::Value]) -> Vec<f32> {
    values
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openai_response_is_reordered_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        });
        let vectors = parse_openai_response(&json).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_malformed_responses_are_not_retryable() {
        let err = parse_openai_response(&serde_json::json!({"error": "x"})).unwrap_err();
        assert!(!err.is_retryable());
        let err = parse_ollama_response(&serde_json::json!({"embeddings": [1, 2]})).unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_ollama_response() {
        let json = serde_json::json!({"embeddings": [[0.5, 0.25]]});
        assert_eq!(parse_ollama_response(&json).unwrap(), vec![vec![0.5, 0.25]]);
    }

    #[test]
    fn test_openai_requires_model_and_dims() {
        let mut cfg = EmbeddingConfig::default();
        cfg.provider = "openai".to_string();
        assert!(OpenAIEmbedder::new(&cfg).is_err());
        cfg.model = Some("text-embedding-3-small".to_string());
        cfg.dims = Some(1536);
        let e = OpenAIEmbedder::new(&cfg).unwrap();
        assert_eq!(e.dims(), 1536);
    }
}
