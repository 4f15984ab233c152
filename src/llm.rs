//! Answer generation from retrieved chunks.
//!
//! [`ExtractiveAnswerer`] needs no model: it quotes the retrieved sentences
//! that best overlap the question. The OpenAI and Ollama answerers send the
//! retrieved context to a chat/generate endpoint.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::config::LlmConfig;
use crate::embedding::{status_error, tokenize, transport_error};
use crate::error::{IndexError, IndexResult};

/// A chunk selected by retrieval, with its similarity to the question.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedChunk {
    pub node_id: String,
    pub text: String,
    pub position: usize,
    pub score: f32,
}

#[async_trait]
pub trait Answerer: Send + Sync {
    fn name(&self) -> &str;

    fn check_credentials(&self) -> Result<(), String> {
        Ok(())
    }

    /// `context` is ordered best match first.
    async fn answer(&self, question: &str, context: &[RetrievedChunk]) -> IndexResult<String>;
}

const NO_CONTEXT_ANSWER: &str = "No relevant content was found in this document.";
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "does", "do", "for", "from", "how", "in",
    "is", "it", "of", "on", "or", "that", "the", "this", "to", "was", "what", "when", "where",
    "which", "who", "why", "with",
];

pub struct ExtractiveAnswerer {
    max_sentences: usize,
}

impl Default for ExtractiveAnswerer {
    fn default() -> Self {
        Self { max_sentences: 3 }
    }
}

#[async_trait]
impl Answerer for ExtractiveAnswerer {
    fn name(&self) -> &str {
        "extractive"
    }

    async fn answer(&self, question: &str, context: &[RetrievedChunk]) -> IndexResult<String> {
        Ok(extract_answer(question, context, self.max_sentences))
    }
}

fn extract_answer(question: &str, context: &[RetrievedChunk], max_sentences: usize) -> String {
    let Some(best) = context.first() else {
        return NO_CONTEXT_ANSWER.to_string();
    };

    let terms: HashSet<String> = tokenize(question)
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect();

    // (overlap, chunk score, chunk position, sentence index, text)
    let mut candidates: Vec<(usize, f32, usize, usize, String)> = Vec::new();
    for chunk in context {
        for (i, sentence) in sentences(&chunk.text).into_iter().enumerate() {
            let overlap = tokenize(&sentence).filter(|t| terms.contains(t)).count();
            if overlap > 0 {
                candidates.push((overlap, chunk.score, chunk.position, i, sentence));
            }
        }
    }

    if candidates.is_empty() {
        let snippet: String = best.text.chars().take(500).collect();
        return snippet.trim().to_string();
    }

    candidates.sort_by(|a, b| {
        b.0.cmp(&a.0)
            .then(b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal))
    });
    candidates.truncate(max_sentences.max(1));
    candidates.sort_by_key(|c| (c.2, c.3));

    candidates
        .into_iter()
        .map(|c| c.4)
        .collect::<Vec<_>>()
        .join(" ")
}

fn sentences(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        if c == '\n' {
            current.push(' ');
        } else {
            current.push(c);
        }
        if matches!(c, '.' | '!' | '?') {
            let s = current.trim();
            if !s.is_empty() {
                out.push(s.to_string());
            }
            current.clear();
        }
    }
    let s = current.trim();
    if !s.is_empty() {
        out.push(s.to_string());
    }
    out
}

fn build_prompt(question: &str, context: &[RetrievedChunk]) -> String {
    let mut prompt = String::from(
        "Answer the question using only the document excerpts below. \
         If the excerpts do not contain the answer, say so.\n\n",
    );
    for (i, chunk) in context.iter().enumerate() {
        prompt.push_str(&format!("[{}] {}\n\n", i + 1, chunk.text.trim()));
    }
    prompt.push_str(&format!("Question: {}\nAnswer:", question));
    prompt
}

const OPENAI_URL: &str = "https://api.openai.com";
const OLLAMA_URL: &str = "http://localhost:11434";

pub struct OpenAIAnswerer {
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAIAnswerer {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("llm.model required for OpenAI provider"))?;
        Ok(Self {
            model,
            base_url: config.url.clone().unwrap_or_else(|| OPENAI_URL.to_string()),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()?,
        })
    }
}

#[async_trait]
impl Answerer for OpenAIAnswerer {
    fn name(&self) -> &str {
        &self.model
    }

    fn check_credentials(&self) -> Result<(), String> {
        match std::env::var("OPENAI_API_KEY") {
            Ok(key) if !key.trim().is_empty() => Ok(()),
            _ => Err("OPENAI_API_KEY environment variable not set".to_string()),
        }
    }

    async fn answer(&self, question: &str, context: &[RetrievedChunk]) -> IndexResult<String> {
        if context.is_empty() {
            return Ok(NO_CONTEXT_ANSWER.to_string());
        }
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| IndexError::provider("OPENAI_API_KEY not set", false))?;
        let url = format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'));

        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": "You answer questions about a single document."},
                {"role": "user", "content": build_prompt(question, context)}
            ],
            "temperature": 0.0
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
        json.pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| IndexError::provider("Invalid OpenAI response: missing content", false))
    }
}

pub struct OllamaAnswerer {
    model: String,
    url: String,
    client: reqwest::Client,
}

impl OllamaAnswerer {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("llm.model required for Ollama provider"))?;
        Ok(Self {
            model,
            url: config.url.clone().unwrap_or_else(|| OLLAMA_URL.to_string()),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()?,
        })
    }
}

#[async_trait]
impl Answerer for OllamaAnswerer {
    fn name(&self) -> &str {
        &self.model
    }

    async fn answer(&self, question: &str, context: &[RetrievedChunk]) -> IndexResult<String> {
        if context.is_empty() {
            return Ok(NO_CONTEXT_ANSWER.to_string());
        }
        let url = format!("{}/api/generate", self.url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "prompt": build_prompt(question, context),
            "stream": false
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
        json.get("response")
            .and_then(|r| r.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| IndexError::provider("Invalid Ollama response: missing response", false))
    }
}

pub fn create_answerer(config: &LlmConfig) -> Result<Arc<dyn Answerer>> {
    match config.provider.as_str() {
        "extractive" => Ok(Arc::new(ExtractiveAnswerer::default())),
        "openai" => Ok(Arc::new(OpenAIAnswerer::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaAnswerer::new(config)?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}
