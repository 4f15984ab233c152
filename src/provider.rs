//! The embedding/indexing provider seam.
//!
//! [`IndexProvider`] is everything the lifecycle services need from the
//! outside world: turn chunks into a persisted index, load one, and answer
//! a question against a loaded index. [`VectorIndexProvider`] implements it
//! with an [`Embedder`], an [`Answerer`], and the JSON artifact format from
//! [`crate::artifact`].
//!
//! Callers wrap every provider call in a circuit breaker and retry; see
//! [`crate::resilience::guarded`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::artifact::{self, IndexStore, VectorStore, INDEX_STORE_FILE, VECTOR_STORE_FILE};
use crate::config::Config;
use crate::embedding::{create_embedder, Embedder};
use crate::error::{IndexError, IndexResult};
use crate::llm::{create_answerer, Answerer, RetrievedChunk};
use crate::models::Chunk;
use crate::similarity;

/// One node of a loaded index.
#[derive(Debug, Clone)]
pub struct LoadedNode {
    pub id: String,
    pub text: String,
    pub position: usize,
    pub vector: Vec<f32>,
}

/// An index held in memory, ready to answer queries.
#[derive(Debug, Clone)]
pub struct LoadedIndex {
    pub path: PathBuf,
    pub index_id: String,
    pub embedding_model: String,
    pub dims: usize,
    /// In reading order.
    pub nodes: Vec<LoadedNode>,
}

impl LoadedIndex {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[async_trait]
pub trait IndexProvider: Send + Sync {
    /// Identifier recorded as `embedding_model` in the artifacts.
    fn model_name(&self) -> &str;

    /// Every credential problem, without touching the network.
    fn check_credentials(&self) -> Vec<String>;

    /// Embed `chunks` and write the required artifacts into `dir`.
    /// Returns the number of indexed chunks.
    async fn embed_and_index(&self, chunks: &[Chunk], dir: &Path) -> IndexResult<usize>;

    async fn load(&self, dir: &Path) -> IndexResult<LoadedIndex>;

    async fn query(&self, index: &LoadedIndex, text: &str) -> IndexResult<String>;
}

pub struct VectorIndexProvider {
    embedder: Arc<dyn Embedder>,
    answerer: Arc<dyn Answerer>,
    batch_size: usize,
    top_k: usize,
}

impl VectorIndexProvider {
    pub fn new(embedder: Arc<dyn Embedder>, answerer: Arc<dyn Answerer>) -> Self {
        Self {
            embedder,
            answerer,
            batch_size: 64,
            top_k: 4,
        }
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let mut provider = Self::new(
            create_embedder(&config.embedding)?,
            create_answerer(&config.llm)?,
        );
        provider.batch_size = config.embedding.batch_size.max(1);
        provider.top_k = config.llm.top_k.max(1);
        Ok(provider)
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k.max(1);
        self
    }

    async fn embed_all(&self, texts: &[String]) -> IndexResult<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let embedded = self.embedder.embed(batch).await?;
            if embedded.len() != batch.len() {
                return Err(IndexError::provider(
                    format!(
                        "embedder returned {} vectors for {} texts",
                        embedded.len(),
                        batch.len()
                    ),
                    false,
                ));
            }
            vectors.extend(embedded);
        }

        let dims = self.embedder.dims();
        if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
            return Err(IndexError::provider(
                format!(
                    "embedding dimension mismatch: expected {}, got {}",
                    dims,
                    bad.len()
                ),
                false,
            ));
        }
        Ok(vectors)
    }
}

#[async_trait]
impl IndexProvider for VectorIndexProvider {
    fn model_name(&self) -> &str {
        self.embedder.model_name()
    }

    fn check_credentials(&self) -> Vec<String> {
        [
            self.embedder.check_credentials(),
            self.answerer.check_credentials(),
        ]
        .into_iter()
        .filter_map(|r| r.err())
        .collect()
    }

    async fn embed_and_index(&self, chunks: &[Chunk], dir: &Path) -> IndexResult<usize> {
        if chunks.is_empty() {
            return Err(IndexError::Processing("no chunks to index".to_string()));
        }
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embed_all(&texts).await?;

        let index_id = uuid::Uuid::new_v4().to_string();
        let store = VectorStore::from_chunks(chunks, vectors, &index_id)?;
        let count = store.len();
        let dir = dir.to_path_buf();
        let model = self.model_name().to_string();

        tokio::task::spawn_blocking(move || {
            artifact::write_index_artifacts(&dir, &store, &index_id, &model)
        })
        .await??;

        tracing::debug!(chunks = count, "embedded and wrote index artifacts");
        Ok(count)
    }

    async fn load(&self, dir: &Path) -> IndexResult<LoadedIndex> {
        let dir = dir.to_path_buf();
        let (store, index) = tokio::task::spawn_blocking({
            let dir = dir.clone();
            move || -> IndexResult<(VectorStore, IndexStore)> {
                Ok((
                    artifact::read_json(&dir.join(VECTOR_STORE_FILE))?,
                    artifact::read_json(&dir.join(INDEX_STORE_FILE))?,
                ))
            }
        })
        .await??;

        if index.embedding_model != self.model_name() {
            return Err(IndexError::provider(
                format!(
                    "index was built with '{}' but the configured embedder is '{}'; rebuild it",
                    index.embedding_model,
                    self.model_name()
                ),
                false,
            ));
        }

        let order = if index.node_ids.len() == store.len() {
            index.node_ids.clone()
        } else {
            store.ordered_node_ids()
        };

        let mut nodes = Vec::with_capacity(order.len());
        for id in order {
            let vector = store.embedding_dict.get(&id).cloned().ok_or_else(|| {
                IndexError::corruption(dir.join(VECTOR_STORE_FILE), format!("node {} has no embedding", id))
            })?;
            let meta = store.metadata_dict.get(&id);
            nodes.push(LoadedNode {
                text: meta.map(|m| m.text.clone()).unwrap_or_default(),
                position: meta.map(|m| m.position).unwrap_or(nodes.len()),
                id,
                vector,
            });
        }

        Ok(LoadedIndex {
            path: dir,
            index_id: index.index_id,
            embedding_model: index.embedding_model,
            dims: index.dims,
            nodes,
        })
    }

    async fn query(&self, index: &LoadedIndex, text: &str) -> IndexResult<String> {
        let query_vec = self
            .embedder
            .embed(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| IndexError::provider("empty embedding response", false))?;

        let vectors: Vec<&[f32]> = index.nodes.iter().map(|n| n.vector.as_slice()).collect();
        let context: Vec<RetrievedChunk> = similarity::top_k(&query_vec, &vectors, self.top_k)
            .into_iter()
            .map(|(i, score)| {
                let node = &index.nodes[i];
                RetrievedChunk {
                    node_id: node.id.clone(),
                    text: node.text.clone(),
                    position: node.position,
                    score,
                }
            })
            .collect();

        self.answerer.answer(text, &context).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::llm::ExtractiveAnswerer;
    use crate::models::ChunkType;
    use tempfile::TempDir;

    fn provider() -> VectorIndexProvider {
        VectorIndexProvider::new(
            Arc::new(HashEmbedder::new(128)),
            Arc::new(ExtractiveAnswerer::default()),
        )
        .with_top_k(2)
    }

    #[tokio::test]
    async fn test_index_load_query_round_trip() {
        let tmp = TempDir::new().unwrap();
        let p = provider();
        let chunks = vec![
            Chunk::new("Sourdough needs a mature starter and a long proof.", ChunkType::Paragraph),
            Chunk::new("Circuit breakers stop calls to failing services.", ChunkType::Paragraph),
            Chunk::new("Tomatoes ripen faster in warm weather.", ChunkType::Paragraph),
        ];

        let count = p.embed_and_index(&chunks, tmp.path()).await.unwrap();
        assert_eq!(count, 3);

        let loaded = p.load(tmp.path()).await.unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded.nodes[1].text, chunks[1].text);

        let answer = p.query(&loaded, "What do circuit breakers stop?").await.unwrap();
        assert!(answer.contains("Circuit breakers stop calls"));
    }

    #[tokio::test]
    async fn test_load_rejects_other_embedding_model() {
        let tmp = TempDir::new().unwrap();
        let chunks = vec![Chunk::new("text", ChunkType::Sentence)];
        provider().embed_and_index(&chunks, tmp.path()).await.unwrap();

        let other = VectorIndexProvider::new(
            Arc::new(HashEmbedder::new(64)),
            Arc::new(ExtractiveAnswerer::default()),
        );
        let err = other.load(tmp.path()).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_empty_chunk_list_is_rejected() {
        let tmp = TempDir::new().unwrap();
        assert!(provider().embed_and_index(&[], tmp.path()).await.is_err());
    }
}
