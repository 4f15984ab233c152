//! TOML configuration.
//!
//! Every service receives the sections it needs at construction time;
//! nothing reads configuration from ambient global state.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::chunk::ChunkStrategyKind;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub query: QueryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// How long a writer waits on a locked database before failing.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl DbConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

fn default_max_connections() -> u32 {
    5
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Directory holding one sub-directory per index.
    pub root: PathBuf,
    /// Scratch space for in-progress builds. Defaults to `<root>/.tmp`.
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
    #[serde(default = "default_large_file_warn_bytes")]
    pub large_file_warn_bytes: u64,
    /// Optional quota used by the resource-headroom health probe.
    #[serde(default)]
    pub max_total_bytes: Option<u64>,
}

impl StorageConfig {
    pub fn temp_root(&self) -> PathBuf {
        self.temp_dir
            .clone()
            .unwrap_or_else(|| self.root.join(".tmp"))
    }
}

fn default_large_file_warn_bytes() -> u64 {
    100 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ChunkingConfig {
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_separator")]
    pub separator: String,
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: usize,
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            separator: default_separator(),
            min_chunk_size: default_min_chunk_size(),
            max_chunk_size: default_max_chunk_size(),
        }
    }
}

fn default_strategy() -> String {
    "hybrid".to_string()
}
fn default_chunk_size() -> usize {
    1024
}
fn default_chunk_overlap() -> usize {
    200
}
fn default_separator() -> String {
    "\n\n".to_string()
}
fn default_min_chunk_size() -> usize {
    100
}
fn default_max_chunk_size() -> usize {
    2048
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_embedding_provider() -> String {
    "hash".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: None,
            url: None,
            top_k: default_top_k(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

fn default_llm_provider() -> String {
    "extractive".to_string()
}
fn default_top_k() -> usize {
    4
}
fn default_llm_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_exponential_base")]
    pub exponential_base: f64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            exponential_base: default_exponential_base(),
            jitter: default_jitter(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    60_000
}
fn default_exponential_base() -> f64 {
    2.0
}
fn default_jitter() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
            success_threshold: default_success_threshold(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_recovery_timeout_secs() -> u64 {
    60
}
fn default_success_threshold() -> u32 {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryConfig {
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            cache_capacity: default_cache_capacity(),
        }
    }
}

fn default_cache_capacity() -> usize {
    4
}

impl Config {
    /// Check cross-field constraints the type system can't express.
    pub fn validate(&self) -> Result<()> {
        if self.db.max_connections == 0 {
            anyhow::bail!("db.max_connections must be >= 1");
        }

        let c = &self.chunking;
        if c.chunk_size == 0 {
            anyhow::bail!("chunking.chunk_size must be > 0");
        }
        if c.min_chunk_size > c.chunk_size || c.chunk_size > c.max_chunk_size {
            anyhow::bail!(
                "chunking sizes must satisfy min_chunk_size <= chunk_size <= max_chunk_size (got {} / {} / {})",
                c.min_chunk_size,
                c.chunk_size,
                c.max_chunk_size
            );
        }
        if c.chunk_overlap >= c.chunk_size {
            anyhow::bail!("chunking.chunk_overlap must be < chunking.chunk_size");
        }
        if c.separator.is_empty() {
            anyhow::bail!("chunking.separator must not be empty");
        }
        c.strategy.parse::<ChunkStrategyKind>()?;

        match self.embedding.provider.as_str() {
            "hash" | "local" => {}
            "openai" | "ollama" => {
                if self.embedding.dims.is_none() || self.embedding.dims == Some(0) {
                    anyhow::bail!(
                        "embedding.dims must be > 0 when provider is '{}'",
                        self.embedding.provider
                    );
                }
                if self.embedding.model.is_none() {
                    anyhow::bail!(
                        "embedding.model must be specified when provider is '{}'",
                        self.embedding.provider
                    );
                }
            }
            other => anyhow::bail!(
                "Unknown embedding provider: '{}'. Must be hash, openai, ollama, or local.",
                other
            ),
        }
        if self.embedding.batch_size == 0 {
            anyhow::bail!("embedding.batch_size must be > 0");
        }

        match self.llm.provider.as_str() {
            "extractive" => {}
            "openai" | "ollama" => {
                if self.llm.model.is_none() {
                    anyhow::bail!(
                        "llm.model must be specified when provider is '{}'",
                        self.llm.provider
                    );
                }
            }
            other => anyhow::bail!(
                "Unknown llm provider: '{}'. Must be extractive, openai, or ollama.",
                other
            ),
        }
        if self.llm.top_k == 0 {
            anyhow::bail!("llm.top_k must be >= 1");
        }

        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be >= 1");
        }
        if self.retry.exponential_base < 1.0 {
            anyhow::bail!("retry.exponential_base must be >= 1.0");
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            anyhow::bail!("retry.initial_delay_ms must be <= retry.max_delay_ms");
        }

        if self.circuit_breaker.failure_threshold == 0 || self.circuit_breaker.success_threshold == 0
        {
            anyhow::bail!("circuit_breaker thresholds must be >= 1");
        }

        if self.query.cache_capacity == 0 {
            anyhow::bail!("query.cache_capacity must be >= 1");
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &str) -> Result<Config> {
        let text = format!(
            "[db]\npath = \"/tmp/x.sqlite\"\n\n[storage]\nroot = \"/tmp/indexes\"\n\n{}",
            extra
        );
        let cfg: Config = toml::from_str(&text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let cfg = parse("").unwrap();
        assert_eq!(cfg.chunking.strategy, "hybrid");
        assert_eq!(cfg.embedding.provider, "hash");
        assert_eq!(cfg.llm.provider, "extractive");
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.query.cache_capacity, 4);
        assert_eq!(cfg.storage.temp_root(), PathBuf::from("/tmp/indexes/.tmp"));
        assert_eq!(cfg.db.max_connections, 5);
        assert_eq!(cfg.db.busy_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_rejects_inverted_chunk_sizes() {
        let err = parse("[chunking]\nchunk_size = 500\nmax_chunk_size = 100\nmin_chunk_size = 10\nchunk_overlap = 0")
            .unwrap_err();
        assert!(err.to_string().contains("min_chunk_size"));
    }

    #[test]
    fn test_rejects_unknown_strategy() {
        assert!(parse("[chunking]\nstrategy = \"random\"").is_err());
    }

    #[test]
    fn test_remote_embedding_needs_dims_and_model() {
        let err = parse("[embedding]\nprovider = \"openai\"").unwrap_err();
        assert!(err.to_string().contains("embedding.dims"));
        assert!(parse("[embedding]\nprovider = \"openai\"\nmodel = \"text-embedding-3-small\"\ndims = 1536").is_ok());
    }

    #[test]
    fn test_rejects_zero_attempts() {
        assert!(parse("[retry]\nmax_attempts = 0").is_err());
    }

    #[test]
    fn test_load_config_reports_missing_file() {
        let err = load_config(Path::new("/nonexistent/docindex.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
