//! On-disk index artifact format.
//!
//! One directory per index, named `doc_{document_id}_{hash8}`:
//!
//! | File | Role |
//! |------|------|
//! | `vector_store.json` | Primary: embeddings, node → ref-doc map, node metadata |
//! | `graph_store.json` | Reading-order neighbours per node |
//! | `index_store.json` | Node order, embedding model, dimensions |
//! | `index_metadata.json` | Optional: explicit chunk count and build provenance |
//!
//! Everything except the primary file can be regenerated from it.

use std::collections::BTreeMap;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{IndexError, IndexResult};
use crate::models::{Chunk, ChunkType};

pub const FORMAT_VERSION: u32 = 1;

pub const VECTOR_STORE_FILE: &str = "vector_store.json";
pub const GRAPH_STORE_FILE: &str = "graph_store.json";
pub const INDEX_STORE_FILE: &str = "index_store.json";
pub const METADATA_FILE: &str = "index_metadata.json";

pub const PRIMARY_FILE: &str = VECTOR_STORE_FILE;
pub const REQUIRED_FILES: [&str; 3] = [VECTOR_STORE_FILE, GRAPH_STORE_FILE, INDEX_STORE_FILE];
pub const PRIMARY_KEYS: [&str; 3] = ["embedding_dict", "text_id_to_ref_doc_id", "metadata_dict"];

const DIR_PREFIX: &str = "doc_";
pub const HASH_PREFIX_LEN: usize = 8;
const BACKUP_MARKER: &str = ".prev-";

/// Per-node metadata stored in the primary artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub text: String,
    pub position: usize,
    #[serde(rename = "type")]
    pub chunk_type: ChunkType,
    pub size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VectorStore {
    pub embedding_dict: BTreeMap<String, Vec<f32>>,
    pub text_id_to_ref_doc_id: BTreeMap<String, String>,
    pub metadata_dict: BTreeMap<String, NodeMetadata>,
}

impl VectorStore {
    /// Pair chunks with their embeddings. Lengths must match.
    pub fn from_chunks(
        chunks: &[Chunk],
        embeddings: Vec<Vec<f32>>,
        ref_doc_id: &str,
    ) -> IndexResult<Self> {
        if chunks.len() != embeddings.len() {
            return Err(IndexError::provider(
                format!(
                    "embedding count mismatch: {} chunks, {} vectors",
                    chunks.len(),
                    embeddings.len()
                ),
                false,
            ));
        }

        let mut store = VectorStore::default();
        for (position, (chunk, vector)) in chunks.iter().zip(embeddings).enumerate() {
            let id = node_id(position);
            store.embedding_dict.insert(id.clone(), vector);
            store
                .text_id_to_ref_doc_id
                .insert(id.clone(), ref_doc_id.to_string());
            store.metadata_dict.insert(
                id,
                NodeMetadata {
                    text: chunk.text.clone(),
                    position,
                    chunk_type: chunk.metadata.chunk_type,
                    size: chunk.metadata.size,
                    complexity: chunk.metadata.complexity,
                },
            );
        }
        Ok(store)
    }

    /// Node ids sorted by their recorded reading position.
    pub fn ordered_node_ids(&self) -> Vec<String> {
        let mut ids: Vec<(usize, &String)> = self
            .embedding_dict
            .keys()
            .map(|id| {
                let pos = self
                    .metadata_dict
                    .get(id)
                    .map(|m| m.position)
                    .unwrap_or(usize::MAX);
                (pos, id)
            })
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id.clone()).collect()
    }

    pub fn dims(&self) -> usize {
        self.embedding_dict.values().next().map(Vec::len).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.embedding_dict.len()
    }

    pub fn is_empty(&self) -> bool {
        self.embedding_dict.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphStore {
    pub graph_dict: BTreeMap<String, Vec<String>>,
}

impl GraphStore {
    /// Link each node to its predecessor and successor in reading order.
    pub fn reading_order(node_ids: &[String]) -> Self {
        let mut graph_dict = BTreeMap::new();
        for (i, id) in node_ids.iter().enumerate() {
            let mut neighbours = Vec::with_capacity(2);
            if i > 0 {
                neighbours.push(node_ids[i - 1].clone());
            }
            if let Some(next) = node_ids.get(i + 1) {
                neighbours.push(next.clone());
            }
            graph_dict.insert(id.clone(), neighbours);
        }
        Self { graph_dict }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexStore {
    pub format_version: u32,
    pub index_id: String,
    pub node_ids: Vec<String>,
    pub embedding_model: String,
    pub dims: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub format_version: u32,
    pub document_id: i64,
    pub content_hash: String,
    pub chunk_count: usize,
    pub chunking_strategy: String,
    pub embedding_model: String,
    pub created_at: i64,
}

pub fn node_id(position: usize) -> String {
    format!("node-{:06}", position)
}

/// Directory name for an index: `doc_{id}_{first 8 chars of hash}`.
pub fn dir_name(document_id: i64, content_hash: &str) -> String {
    let prefix: String = content_hash.chars().take(HASH_PREFIX_LEN).collect();
    format!("{}{}_{}", DIR_PREFIX, document_id, prefix)
}

/// Parse `doc_{id}_{hash8}` back into its parts.
pub fn parse_dir_name(name: &str) -> Option<(i64, String)> {
    let rest = name.strip_prefix(DIR_PREFIX)?;
    let (id, hash) = rest.split_once('_')?;
    let id: i64 = id.parse().ok()?;
    if hash.is_empty()
        || hash.len() > HASH_PREFIX_LEN
        || !hash.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return None;
    }
    Some((id, hash.to_string()))
}

/// Sibling name an overwrite moves the live index to until the new one is
/// verified: `.{dir_name}.prev-{8 hex}`.
pub fn backup_dir_name(dir_name: &str) -> String {
    format!(
        ".{}{}{}",
        dir_name,
        BACKUP_MARKER,
        &uuid::Uuid::new_v4().simple().to_string()[..8]
    )
}

/// The index directory name a backup was taken from.
pub fn parse_backup_name(name: &str) -> Option<&str> {
    let (dir, suffix) = name.strip_prefix('.')?.rsplit_once(BACKUP_MARKER)?;
    if suffix.len() != 8 || !suffix.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    parse_dir_name(dir)?;
    Some(dir)
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> IndexResult<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| IndexError::storage(format!("serialize {}: {}", path.display(), e)))?;
    std::fs::write(path, bytes)
        .map_err(|e| IndexError::storage_io(format!("write {}", path.display()), e))
}

/// Read and deserialize one artifact; parse failures are corruption.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> IndexResult<T> {
    let bytes = std::fs::read(path)
        .map_err(|e| IndexError::storage_io(format!("read {}", path.display()), e))?;
    serde_json::from_slice(&bytes).map_err(|e| IndexError::corruption(path, e.to_string()))
}

/// Write the three required artifacts for a freshly embedded store.
pub fn write_index_artifacts(
    dir: &Path,
    store: &VectorStore,
    index_id: &str,
    embedding_model: &str,
) -> IndexResult<()> {
    let node_ids = store.ordered_node_ids();
    write_json(&dir.join(VECTOR_STORE_FILE), store)?;
    write_json(
        &dir.join(GRAPH_STORE_FILE),
        &GraphStore::reading_order(&node_ids),
    )?;
    write_json(
        &dir.join(INDEX_STORE_FILE),
        &IndexStore {
            format_version: FORMAT_VERSION,
            index_id: index_id.to_string(),
            node_ids,
            embedding_model: embedding_model.to_string(),
            dims: store.dims(),
        },
    )
}

/// Rebuild every secondary artifact from a readable primary.
///
/// Keeps the embedding model and index id from the existing index store
/// when it still parses. Returns the chunk count written.
pub fn regenerate_secondaries(dir: &Path) -> IndexResult<usize> {
    let store: VectorStore = read_json(&dir.join(VECTOR_STORE_FILE))?;
    if store.is_empty() {
        return Err(IndexError::corruption(
            dir.join(VECTOR_STORE_FILE),
            "primary artifact holds no embeddings",
        ));
    }

    let previous: Option<IndexStore> = read_json(&dir.join(INDEX_STORE_FILE)).ok();
    let previous_meta: Option<IndexMetadata> = read_json(&dir.join(METADATA_FILE)).ok();

    let (index_id, model) = match &previous {
        Some(p) => (p.index_id.clone(), p.embedding_model.clone()),
        None => (
            store
                .text_id_to_ref_doc_id
                .values()
                .next()
                .cloned()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            previous_meta
                .as_ref()
                .map(|m| m.embedding_model.clone())
                .unwrap_or_else(|| "unknown".to_string()),
        ),
    };

    let node_ids = store.ordered_node_ids();
    write_json(
        &dir.join(GRAPH_STORE_FILE),
        &GraphStore::reading_order(&node_ids),
    )?;
    write_json(
        &dir.join(INDEX_STORE_FILE),
        &IndexStore {
            format_version: FORMAT_VERSION,
            index_id,
            node_ids,
            embedding_model: model.clone(),
            dims: store.dims(),
        },
    )?;

    let dir_parts = dir
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(parse_dir_name);
    let metadata = IndexMetadata {
        format_version: FORMAT_VERSION,
        document_id: previous_meta
            .as_ref()
            .map(|m| m.document_id)
            .or_else(|| dir_parts.as_ref().map(|(id, _)| *id))
            .unwrap_or(0),
        content_hash: previous_meta
            .as_ref()
            .map(|m| m.content_hash.clone())
            .or_else(|| dir_parts.map(|(_, h)| h))
            .unwrap_or_default(),
        chunk_count: store.len(),
        chunking_strategy: previous_meta
            .as_ref()
            .map(|m| m.chunking_strategy.clone())
            .unwrap_or_else(|| "unknown".to_string()),
        embedding_model: model,
        created_at: chrono::Utc::now().timestamp(),
    };
    write_json(&dir.join(METADATA_FILE), &metadata)?;

    Ok(store.len())
}
