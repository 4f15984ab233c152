//! Core data models used throughout docindex.
//!
//! These types represent the documents, indexes, and chunks that flow
//! through the build, query, and recovery pipeline.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A source document known to the metadata store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    pub id: i64,
    pub title: String,
    pub file_path: PathBuf,
    /// Hex SHA-256 of the file contents.
    pub content_hash: String,
    pub mime_type: String,
    pub file_size: u64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Fields supplied when registering a document; the store assigns the id.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub title: String,
    pub file_path: PathBuf,
    pub content_hash: String,
    pub mime_type: String,
    pub file_size: u64,
}

/// Persisted record of a built index. At most one per document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorIndex {
    pub id: i64,
    pub document_id: i64,
    pub index_path: PathBuf,
    pub index_hash: String,
    pub chunk_count: usize,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct NewVectorIndex {
    pub document_id: i64,
    pub index_path: PathBuf,
    pub index_hash: String,
    pub chunk_count: usize,
}

/// Which strategy produced a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    Sentence,
    Paragraph,
    Semantic,
    Adaptive,
    Fallback,
}

impl ChunkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkType::Sentence => "sentence",
            ChunkType::Paragraph => "paragraph",
            ChunkType::Semantic => "semantic",
            ChunkType::Adaptive => "adaptive",
            ChunkType::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    #[serde(rename = "type")]
    pub chunk_type: ChunkType,
    /// Length of the chunk text in characters.
    pub size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity: Option<f64>,
}

/// A contiguous span of document text.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub text: String,
    pub metadata: ChunkMetadata,
}

impl Chunk {
    pub fn new(text: impl Into<String>, chunk_type: ChunkType) -> Self {
        let text = text.into();
        let size = text.chars().count();
        Self {
            text,
            metadata: ChunkMetadata {
                chunk_type,
                size,
                position: None,
                complexity: None,
            },
        }
    }

    pub fn with_complexity(mut self, score: f64) -> Self {
        self.metadata.complexity = Some(score);
        self
    }
}

/// Plain text pulled out of a document plus basic counts.
#[derive(Debug, Clone)]
pub struct ExtractedText {
    pub text: String,
    pub page_count: Option<usize>,
    pub word_count: usize,
}

impl ExtractedText {
    pub fn new(text: String, page_count: Option<usize>) -> Self {
        let word_count = text.split_whitespace().count();
        Self {
            text,
            page_count,
            word_count,
        }
    }
}
