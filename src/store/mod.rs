//! Metadata store abstraction.
//!
//! The [`MetadataStore`] trait covers the relational side of the index
//! lifecycle: `Document` and `VectorIndex` records. The filesystem side is
//! owned by [`crate::file_manager::FileManager`].
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;

use crate::error::IndexResult;
use crate::models::{Document, NewDocument, NewVectorIndex, VectorIndex};

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

/// Abstract storage backend for document and index records.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert_document`](MetadataStore::upsert_document) | Insert or update a document keyed by file path |
/// | [`replace_vector_index`](MetadataStore::replace_vector_index) | Atomically swap the index row for a document |
/// | [`remove_orphan_indexes`](MetadataStore::remove_orphan_indexes) | Delete index rows whose document is gone |
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert or update a document. Re-registering the same `file_path`
    /// keeps the existing id.
    async fn upsert_document(&self, doc: &NewDocument) -> IndexResult<Document>;

    async fn get_document(&self, id: i64) -> IndexResult<Option<Document>>;

    async fn list_documents(&self) -> IndexResult<Vec<Document>>;

    /// Delete a document. Its index row, if any, becomes an orphan.
    async fn delete_document(&self, id: i64) -> IndexResult<bool>;

    async fn get_vector_index(&self, document_id: i64) -> IndexResult<Option<VectorIndex>>;

    async fn list_vector_indexes(&self) -> IndexResult<Vec<VectorIndex>>;

    /// Replace the index row for `index.document_id` inside one transaction.
    ///
    /// Returns the previous row, if there was one, alongside the new one.
    async fn replace_vector_index(
        &self,
        index: &NewVectorIndex,
    ) -> IndexResult<(VectorIndex, Option<VectorIndex>)>;

    async fn update_chunk_count(&self, document_id: i64, chunk_count: usize) -> IndexResult<()>;

    async fn delete_vector_index(&self, document_id: i64) -> IndexResult<bool>;

    /// Delete index rows with no backing document; returns how many.
    async fn remove_orphan_indexes(&self) -> IndexResult<usize>;

    /// Cheap reachability probe.
    async fn ping(&self) -> bool;
}
