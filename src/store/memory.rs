//! In-memory [`MetadataStore`] implementation for tests and embedding hosts
//! that keep their own persistence.
//!
//! Uses `BTreeMap` behind `std::sync::RwLock`. Locks are never held across
//! an `.await`.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{IndexError, IndexResult};
use crate::models::{Document, NewDocument, NewVectorIndex, VectorIndex};

use super::MetadataStore;

#[derive(Default)]
struct Tables {
    documents: BTreeMap<i64, Document>,
    /// Keyed by document id.
    indexes: BTreeMap<i64, VectorIndex>,
    next_document_id: i64,
    next_index_id: i64,
}

#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&self) -> IndexResult<std::sync::RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| IndexError::Metadata("in-memory store lock poisoned".to_string()))
    }

    fn read(&self) -> IndexResult<std::sync::RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| IndexError::Metadata("in-memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl MetadataStore for InMemoryStore {
    async fn upsert_document(&self, doc: &NewDocument) -> IndexResult<Document> {
        let now = chrono::Utc::now().timestamp();
        let mut tables = self.write()?;

        let existing = tables
            .documents
            .values()
            .find(|d| d.file_path == doc.file_path)
            .map(|d| (d.id, d.created_at));

        let (id, created_at) = match existing {
            Some(found) => found,
            None => {
                tables.next_document_id += 1;
                (tables.next_document_id, now)
            }
        };

        let stored = Document {
            id,
            title: doc.title.clone(),
            file_path: doc.file_path.clone(),
            content_hash: doc.content_hash.clone(),
            mime_type: doc.mime_type.clone(),
            file_size: doc.file_size,
            created_at,
            updated_at: now,
        };
        tables.documents.insert(id, stored.clone());
        Ok(stored)
    }

    async fn get_document(&self, id: i64) -> IndexResult<Option<Document>> {
        Ok(self.read()?.documents.get(&id).cloned())
    }

    async fn list_documents(&self) -> IndexResult<Vec<Document>> {
        Ok(self.read()?.documents.values().cloned().collect())
    }

    async fn delete_document(&self, id: i64) -> IndexResult<bool> {
        Ok(self.write()?.documents.remove(&id).is_some())
    }

    async fn get_vector_index(&self, document_id: i64) -> IndexResult<Option<VectorIndex>> {
        Ok(self.read()?.indexes.get(&document_id).cloned())
    }

    async fn list_vector_indexes(&self) -> IndexResult<Vec<VectorIndex>> {
        Ok(self.read()?.indexes.values().cloned().collect())
    }

    async fn replace_vector_index(
        &self,
        index: &NewVectorIndex,
    ) -> IndexResult<(VectorIndex, Option<VectorIndex>)> {
        let mut tables = self.write()?;
        tables.next_index_id += 1;
        let row = VectorIndex {
            id: tables.next_index_id,
            document_id: index.document_id,
            index_path: index.index_path.clone(),
            index_hash: index.index_hash.clone(),
            chunk_count: index.chunk_count,
            created_at: chrono::Utc::now().timestamp(),
        };
        let previous = tables.indexes.insert(index.document_id, row.clone());
        Ok((row, previous))
    }

    async fn update_chunk_count(&self, document_id: i64, chunk_count: usize) -> IndexResult<()> {
        if let Some(row) = self.write()?.indexes.get_mut(&document_id) {
            row.chunk_count = chunk_count;
        }
        Ok(())
    }

    async fn delete_vector_index(&self, document_id: i64) -> IndexResult<bool> {
        Ok(self.write()?.indexes.remove(&document_id).is_some())
    }

    async fn remove_orphan_indexes(&self) -> IndexResult<usize> {
        let mut tables = self.write()?;
        let Tables {
            documents, indexes, ..
        } = &mut *tables;
        let before = indexes.len();
        indexes.retain(|doc_id, _| documents.contains_key(doc_id));
        Ok(before - indexes.len())
    }

    async fn ping(&self) -> bool {
        self.tables.read().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn new_doc(path: &str) -> NewDocument {
        NewDocument {
            title: "t".to_string(),
            file_path: PathBuf::from(path),
            content_hash: "abc".to_string(),
            mime_type: "text/plain".to_string(),
            file_size: 3,
        }
    }

    #[tokio::test]
    async fn test_upsert_keeps_id_for_same_path() {
        let store = InMemoryStore::new();
        let a = store.upsert_document(&new_doc("/a.txt")).await.unwrap();
        let again = store.upsert_document(&new_doc("/a.txt")).await.unwrap();
        let b = store.upsert_document(&new_doc("/b.txt")).await.unwrap();
        assert_eq!(a.id, again.id);
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn test_replace_returns_previous_and_orphans_are_removed() {
        let store = InMemoryStore::new();
        let doc = store.upsert_document(&new_doc("/a.txt")).await.unwrap();
        let first = NewVectorIndex {
            document_id: doc.id,
            index_path: PathBuf::from("/idx/doc_1_aaaaaaaa"),
            index_hash: "aaaaaaaa".to_string(),
            chunk_count: 2,
        };
        let (_, prev) = store.replace_vector_index(&first).await.unwrap();
        assert!(prev.is_none());
        let (row, prev) = store.replace_vector_index(&first).await.unwrap();
        assert!(prev.is_some());
        assert_eq!(store.list_vector_indexes().await.unwrap(), vec![row]);

        store.delete_document(doc.id).await.unwrap();
        assert_eq!(store.remove_orphan_indexes().await.unwrap(), 1);
        assert!(store.get_vector_index(doc.id).await.unwrap().is_none());
    }
}
