//! SQLite connection pool for the metadata store.
//!
//! The store lives in a single SQLite file opened in WAL mode so that
//! health checks and queries can read while a build commits its record.
//! Foreign keys are enforced and writers wait `db.busy_timeout_ms` on a
//! locked file instead of failing at once.

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};

use crate::config::DbConfig;
use crate::error::{IndexError, IndexResult};

/// Open a pool on `db.path`, creating the file and its parent directories.
pub async fn connect(db: &DbConfig) -> IndexResult<SqlitePool> {
    if let Some(parent) = db.path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            IndexError::storage_io(format!("create database directory {}", parent.display()), e)
        })?;
    }

    let options = SqliteConnectOptions::new()
        .filename(&db.path)
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(db.busy_timeout());

    let pool = SqlitePoolOptions::new()
        .max_connections(db.max_connections.max(1))
        .connect_with(options)
        .await
        .map_err(|e| {
            IndexError::Metadata(format!("open database {}: {}", db.path.display(), e))
        })?;

    tracing::debug!(path = %db.path.display(), "metadata database connected");
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn db_config(tmp: &TempDir) -> DbConfig {
        toml::from_str(&format!(
            "path = \"{}\"",
            tmp.path().join("nested/dir/meta.sqlite").display()
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_connect_creates_file_in_wal_mode() {
        let tmp = TempDir::new().unwrap();
        let db = db_config(&tmp);
        let pool = connect(&db).await.unwrap();
        assert!(db.path.exists());

        let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        let fk: i64 = sqlx::query_scalar("PRAGMA foreign_keys")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(fk, 1);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_unusable_path_is_a_storage_error() {
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        let db: DbConfig =
            toml::from_str(&format!("path = \"{}\"", blocker.join("meta.sqlite").display()))
                .unwrap();
        let err = connect(&db).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Storage);
    }
}
