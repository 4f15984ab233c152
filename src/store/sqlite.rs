//! SQLite-backed [`MetadataStore`] implementation.
//!
//! Wraps a [`SqlitePool`] and maps every trait method onto the schema
//! created by [`crate::migrate`].

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::path::PathBuf;

use crate::config::Config;
use crate::db;
use crate::error::IndexResult;
use crate::migrate;
use crate::models::{Document, NewDocument, NewVectorIndex, VectorIndex};

use super::MetadataStore;

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to the configured database and make sure the schema exists.
    pub async fn open(config: &Config) -> anyhow::Result<Self> {
        let pool = db::connect(&config.db).await?;
        migrate::apply(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn row_to_document(row: &SqliteRow) -> Document {
    let path: String = row.get("file_path");
    let size: i64 = row.get("file_size");
    Document {
        id: row.get("id"),
        title: row.get("title"),
        file_path: PathBuf::from(path),
        content_hash: row.get("content_hash"),
        mime_type: row.get("mime_type"),
        file_size: size.max(0) as u64,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn row_to_index(row: &SqliteRow) -> VectorIndex {
    let path: String = row.get("index_path");
    let count: i64 = row.get("chunk_count");
    VectorIndex {
        id: row.get("id"),
        document_id: row.get("document_id"),
        index_path: PathBuf::from(path),
        index_hash: row.get("index_hash"),
        chunk_count: count.max(0) as usize,
        created_at: row.get("created_at"),
    }
}

const INDEX_COLUMNS: &str = "id, document_id, index_path, index_hash, chunk_count, created_at";
const DOCUMENT_COLUMNS: &str =
    "id, title, file_path, content_hash, mime_type, file_size, created_at, updated_at";

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn upsert_document(&self, doc: &NewDocument) -> IndexResult<Document> {
        let now = chrono::Utc::now().timestamp();
        let path = doc.file_path.to_string_lossy().to_string();

        sqlx::query(
            r#"
            INSERT INTO documents (title, file_path, content_hash, mime_type, file_size, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(file_path) DO UPDATE SET
                title = excluded.title,
                content_hash = excluded.content_hash,
                mime_type = excluded.mime_type,
                file_size = excluded.file_size,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&doc.title)
        .bind(&path)
        .bind(&doc.content_hash)
        .bind(&doc.mime_type)
        .bind(doc.file_size as i64)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE file_path = ?",
            DOCUMENT_COLUMNS
        ))
        .bind(&path)
        .fetch_one(&self.pool)
        .await?;

        Ok(row_to_document(&row))
    }

    async fn get_document(&self, id: i64) -> IndexResult<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE id = ?",
            DOCUMENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_document))
    }

    async fn list_documents(&self) -> IndexResult<Vec<Document>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM documents ORDER BY id",
            DOCUMENT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_document).collect())
    }

    async fn delete_document(&self, id: i64) -> IndexResult<bool> {
        let result = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_vector_index(&self, document_id: i64) -> IndexResult<Option<VectorIndex>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM vector_indexes WHERE document_id = ?",
            INDEX_COLUMNS
        ))
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_index))
    }

    async fn list_vector_indexes(&self) -> IndexResult<Vec<VectorIndex>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM vector_indexes ORDER BY document_id",
            INDEX_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_index).collect())
    }

    async fn replace_vector_index(
        &self,
        index: &NewVectorIndex,
    ) -> IndexResult<(VectorIndex, Option<VectorIndex>)> {
        let mut tx = self.pool.begin().await?;

        let previous = sqlx::query(&format!(
            "SELECT {} FROM vector_indexes WHERE document_id = ?",
            INDEX_COLUMNS
        ))
        .bind(index.document_id)
        .fetch_optional(&mut *tx)
        .await?
        .as_ref()
        .map(row_to_index);

        sqlx::query("DELETE FROM vector_indexes WHERE document_id = ?")
            .bind(index.document_id)
            .execute(&mut *tx)
            .await?;

        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            INSERT INTO vector_indexes (document_id, index_path, index_hash, chunk_count, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(index.document_id)
        .bind(index.index_path.to_string_lossy().to_string())
        .bind(&index.index_hash)
        .bind(index.chunk_count as i64)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let row = VectorIndex {
            id: result.last_insert_rowid(),
            document_id: index.document_id,
            index_path: index.index_path.clone(),
            index_hash: index.index_hash.clone(),
            chunk_count: index.chunk_count,
            created_at: now,
        };
        Ok((row, previous))
    }

    async fn update_chunk_count(&self, document_id: i64, chunk_count: usize) -> IndexResult<()> {
        sqlx::query("UPDATE vector_indexes SET chunk_count = ? WHERE document_id = ?")
            .bind(chunk_count as i64)
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_vector_index(&self, document_id: i64) -> IndexResult<bool> {
        let result = sqlx::query("DELETE FROM vector_indexes WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove_orphan_indexes(&self) -> IndexResult<usize> {
        let result = sqlx::query(
            "DELETE FROM vector_indexes WHERE document_id NOT IN (SELECT id FROM documents)",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn ping(&self) -> bool {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }
}
