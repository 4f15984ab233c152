use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Notify;

use docindex::artifact::{GRAPH_STORE_FILE, INDEX_STORE_FILE, METADATA_FILE, PRIMARY_FILE};
use docindex::config::Config;
use docindex::coordinator::Coordinator;
use docindex::embedding::HashEmbedder;
use docindex::error::{IndexError, IndexResult};
use docindex::extract::FileDocumentSource;
use docindex::llm::ExtractiveAnswerer;
use docindex::models::Chunk;
use docindex::provider::{IndexProvider, LoadedIndex, VectorIndexProvider};
use docindex::recovery::{HealthStatus, RecoveryAction, Severity};
use docindex::resilience::CircuitState;
use docindex::store::{MetadataStore, SqliteStore};

const BACKUPS: &str = "Backups run every night at two.\n\n\
    Restores are tested on the first Monday of each month.\n\n\
    Old snapshots are pruned after ninety days.";

const ONCALL: &str = "The pager rotation changes every Wednesday.\n\n\
    Escalations go to the platform lead after fifteen minutes.\n\n\
    Incident reviews are written within three working days.";

fn test_config(root: &Path) -> Config {
    let mut config: Config = toml::from_str(&format!(
        "[db]\npath = \"{}\"\n\n[storage]\nroot = \"{}\"\n",
        root.join("data/meta.sqlite").display(),
        root.join("indexes").display()
    ))
    .unwrap();
    config.chunking.strategy = "paragraph".to_string();
    config.chunking.chunk_size = 80;
    config.chunking.chunk_overlap = 0;
    config.chunking.min_chunk_size = 10;
    config.retry.initial_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config
}

fn write_doc(root: &Path, name: &str, body: &str) -> PathBuf {
    let path = root.join(name);
    fs::write(&path, body).unwrap();
    path
}

#[tokio::test]
async fn test_index_survives_reopen() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let doc = write_doc(tmp.path(), "backups.md", BACKUPS);

    let record = {
        let coord = Coordinator::open(&config).await.unwrap();
        coord.index_file(&doc, false).await.unwrap()
    };
    assert_eq!(record.chunk_count, 3);

    let coord = Coordinator::open(&config).await.unwrap();
    let status = coord.index_status(record.document_id).await.unwrap();
    assert!(status.exists);
    assert!(status.verified);
    assert!(!status.loaded);

    let answer = coord
        .query(record.document_id, "When are restores tested?")
        .await
        .unwrap();
    assert!(answer.answer.contains("first Monday"), "got: {}", answer.answer);
    assert!(coord.index_status(record.document_id).await.unwrap().loaded);
}

#[tokio::test]
async fn test_building_unchanged_content_twice_needs_overwrite() {
    let tmp = TempDir::new().unwrap();
    let coord = Coordinator::open(&test_config(tmp.path())).await.unwrap();
    let doc = write_doc(tmp.path(), "backups.md", BACKUPS);

    let first = coord.index_file(&doc, false).await.unwrap();
    let err = coord.index_file(&doc, false).await.unwrap_err();
    assert!(matches!(err, IndexError::AlreadyExists(_)));

    let second = coord.index_file(&doc, true).await.unwrap();
    assert_eq!(second.index_path, first.index_path);
    assert!(coord.files().verify(&second.index_path));
    assert_eq!(coord.list_indexes().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_identical_content_gets_separate_indexes_per_document() {
    let tmp = TempDir::new().unwrap();
    let coord = Coordinator::open(&test_config(tmp.path())).await.unwrap();

    let a = coord
        .index_file(&write_doc(tmp.path(), "a.txt", BACKUPS), false)
        .await
        .unwrap();
    let b = coord
        .index_file(&write_doc(tmp.path(), "b.txt", BACKUPS), false)
        .await
        .unwrap();

    assert_ne!(a.document_id, b.document_id);
    assert_ne!(a.index_path, b.index_path);
    assert_eq!(a.index_hash, b.index_hash);
}

#[tokio::test]
async fn test_damage_grades_and_recovers() {
    let tmp = TempDir::new().unwrap();
    let coord = Coordinator::open(&test_config(tmp.path())).await.unwrap();
    let record = coord
        .index_file(&write_doc(tmp.path(), "backups.md", BACKUPS), false)
        .await
        .unwrap();
    let id = record.document_id;

    assert_eq!(coord.verify(id).await.unwrap().severity, Severity::None);

    // losing only the optional metadata file is drift
    fs::remove_file(record.index_path.join(METADATA_FILE)).unwrap();
    assert_eq!(coord.verify(id).await.unwrap().severity, Severity::Light);

    // a damaged secondary is moderate
    fs::write(record.index_path.join(GRAPH_STORE_FILE), "{ not json").unwrap();
    let report = coord.verify(id).await.unwrap();
    assert_eq!(report.severity, Severity::Moderate);
    assert_eq!(report.corrupted_files, vec![GRAPH_STORE_FILE.to_string()]);

    let repaired = coord.recover(id, false).await.unwrap();
    assert_eq!(repaired.action, RecoveryAction::PartialRepair);
    assert!(repaired.success);
    assert!(coord.files().verify(&record.index_path));

    // a missing primary is critical and forces a rebuild
    fs::remove_file(record.index_path.join(PRIMARY_FILE)).unwrap();
    assert_eq!(coord.verify(id).await.unwrap().severity, Severity::Critical);
    let rebuilt = coord.recover(id, false).await.unwrap();
    assert_eq!(rebuilt.severity_before, Severity::Critical);
    assert_eq!(rebuilt.action, RecoveryAction::Rebuilt);
    assert!(rebuilt.success);

    let answer = coord.query(id, "How long are old snapshots kept?").await.unwrap();
    assert!(answer.answer.contains("ninety days"), "got: {}", answer.answer);
}

#[tokio::test]
async fn test_orphan_cleanup_removes_only_orphans() {
    let tmp = TempDir::new().unwrap();
    let coord = Coordinator::open(&test_config(tmp.path())).await.unwrap();

    let mut records = Vec::new();
    for (name, body) in [("a.txt", BACKUPS), ("b.txt", ONCALL), ("c.txt", BACKUPS)] {
        records.push(
            coord
                .index_file(&write_doc(tmp.path(), name, body), false)
                .await
                .unwrap(),
        );
    }

    // one document deleted behind the index's back, one stray directory
    assert!(coord.store().delete_document(records[1].document_id).await.unwrap());
    fs::create_dir_all(coord.files().root().join("doc_404_deadbeef")).unwrap();

    let removed = coord.cleanup_orphans().await.unwrap();
    assert_eq!(removed, 3);
    assert!(!records[1].index_path.exists());
    assert!(records[0].index_path.exists());
    assert!(records[2].index_path.exists());
    assert_eq!(coord.list_indexes().await.unwrap().len(), 2);

    assert_eq!(coord.cleanup_orphans().await.unwrap(), 0);
}

#[tokio::test]
async fn test_concurrent_queries_across_documents() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(tmp.path());
    config.query.cache_capacity = 1;
    let coord = Arc::new(Coordinator::open(&config).await.unwrap());

    let backups = coord
        .index_file(&write_doc(tmp.path(), "backups.md", BACKUPS), false)
        .await
        .unwrap();
    let oncall = coord
        .index_file(&write_doc(tmp.path(), "oncall.md", ONCALL), false)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let coord = coord.clone();
        let (id, question, expected) = if i % 2 == 0 {
            (backups.document_id, "When are restores tested?", "first Monday")
        } else {
            (oncall.document_id, "When does the pager rotation change?", "Wednesday")
        };
        handles.push(tokio::spawn(async move {
            let answer = coord.query(id, question).await.unwrap();
            assert_eq!(answer.document_id, id);
            assert!(answer.answer.contains(expected), "got: {}", answer.answer);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let stats = coord.get_stats().await.unwrap();
    assert_eq!(stats.query.queries, 8);
    assert_eq!(stats.query.query_failures, 0);
    assert!(stats.query.loaded_documents.len() <= 1);
}

/// Delegates to a real provider but fails queries while `failing` is set.
struct FlakyProvider {
    inner: VectorIndexProvider,
    failing: AtomicBool,
}

#[async_trait]
impl IndexProvider for FlakyProvider {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn check_credentials(&self) -> Vec<String> {
        Vec::new()
    }

    async fn embed_and_index(&self, chunks: &[Chunk], dir: &Path) -> IndexResult<usize> {
        self.inner.embed_and_index(chunks, dir).await
    }

    async fn load(&self, dir: &Path) -> IndexResult<LoadedIndex> {
        self.inner.load(dir).await
    }

    async fn query(&self, index: &LoadedIndex, text: &str) -> IndexResult<String> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(IndexError::provider("upstream unavailable", false));
        }
        self.inner.query(index, text).await
    }
}

#[tokio::test]
async fn test_failing_provider_opens_query_circuit() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(tmp.path());
    config.retry.max_attempts = 1;
    config.circuit_breaker.failure_threshold = 2;

    let provider = Arc::new(FlakyProvider {
        inner: VectorIndexProvider::new(
            Arc::new(HashEmbedder::new(64)),
            Arc::new(ExtractiveAnswerer::default()),
        ),
        failing: AtomicBool::new(true),
    });
    let store = Arc::new(SqliteStore::open(&config).await.unwrap());
    let coord =
        Coordinator::with_parts(&config, store, provider.clone(), Arc::new(FileDocumentSource))
            .unwrap();

    let record = coord
        .index_file(&write_doc(tmp.path(), "backups.md", BACKUPS), false)
        .await
        .unwrap();
    let id = record.document_id;

    for _ in 0..2 {
        let err = coord.query(id, "When do backups run?").await.unwrap_err();
        assert!(matches!(err, IndexError::QueryExecution { .. }), "got: {err}");
    }

    // the breaker now rejects without calling the provider
    provider.failing.store(false, Ordering::SeqCst);
    let err = coord.query(id, "When do backups run?").await.unwrap_err();
    assert!(matches!(err, IndexError::CircuitOpen { .. }), "got: {err}");

    let stats = coord.get_stats().await.unwrap();
    let query_breaker = stats.breakers.iter().find(|b| b.name == "query").unwrap();
    assert_eq!(query_breaker.state, CircuitState::Open);
    assert!(query_breaker.rejected >= 1);

    let health = coord.health_check().await.unwrap();
    assert_eq!(health.status, HealthStatus::Degraded);
    assert_eq!(health.checks.get("circuit_query"), Some(&false));
}

/// Pauses the first `load` after the index is read, until released.
struct GatedProvider {
    inner: VectorIndexProvider,
    armed: AtomicBool,
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl IndexProvider for GatedProvider {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn check_credentials(&self) -> Vec<String> {
        Vec::new()
    }

    async fn embed_and_index(&self, chunks: &[Chunk], dir: &Path) -> IndexResult<usize> {
        self.inner.embed_and_index(chunks, dir).await
    }

    async fn load(&self, dir: &Path) -> IndexResult<LoadedIndex> {
        let loaded = self.inner.load(dir).await?;
        if self.armed.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        Ok(loaded)
    }

    async fn query(&self, index: &LoadedIndex, text: &str) -> IndexResult<String> {
        self.inner.query(index, text).await
    }
}

#[tokio::test]
async fn test_rebuild_during_load_does_not_cache_stale_index() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let provider = Arc::new(GatedProvider {
        inner: VectorIndexProvider::new(
            Arc::new(HashEmbedder::new(64)),
            Arc::new(ExtractiveAnswerer::default()),
        ),
        armed: AtomicBool::new(false),
        entered: Notify::new(),
        release: Notify::new(),
    });
    let store = Arc::new(SqliteStore::open(&config).await.unwrap());
    let coord = Arc::new(
        Coordinator::with_parts(&config, store, provider.clone(), Arc::new(FileDocumentSource))
            .unwrap(),
    );

    let doc = write_doc(tmp.path(), "backups.md", BACKUPS);
    let id = coord.index_file(&doc, false).await.unwrap().document_id;

    provider.armed.store(true, Ordering::SeqCst);
    let in_flight = {
        let coord = coord.clone();
        tokio::spawn(async move { coord.query(id, "When do backups run?").await })
    };
    provider.entered.notified().await;

    fs::write(&doc, BACKUPS.replace("every night at two", "every Sunday at noon")).unwrap();
    coord.rebuild_index(id).await.unwrap();

    provider.release.notify_one();
    // the query that started before the rebuild may answer from either version
    in_flight.await.unwrap().unwrap();

    let answer = coord.query(id, "When do backups run?").await.unwrap();
    assert!(answer.answer.contains("Sunday at noon"), "got: {}", answer.answer);
    assert!(!answer.answer.contains("night at two"), "got: {}", answer.answer);
}

#[tokio::test]
async fn test_one_broken_index_does_not_block_other_documents() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(tmp.path());
    config.retry.max_attempts = 1;
    config.circuit_breaker.failure_threshold = 2;
    let coord = Coordinator::open(&config).await.unwrap();

    let broken = coord
        .index_file(&write_doc(tmp.path(), "backups.md", BACKUPS), false)
        .await
        .unwrap();
    let healthy = coord
        .index_file(&write_doc(tmp.path(), "oncall.md", ONCALL), false)
        .await
        .unwrap();

    // well-formed, but names nodes the primary does not hold
    let index_store = broken.index_path.join(INDEX_STORE_FILE);
    let mut value: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&index_store).unwrap()).unwrap();
    let ghosts: Vec<String> = (0..broken.chunk_count).map(|i| format!("ghost-{i}")).collect();
    value["node_ids"] = serde_json::json!(ghosts);
    fs::write(&index_store, value.to_string()).unwrap();
    assert!(coord.files().verify(&broken.index_path));

    for _ in 0..5 {
        let err = coord.query(broken.document_id, "When do backups run?").await.unwrap_err();
        assert!(matches!(err, IndexError::QueryExecution { .. }), "got: {err}");
    }

    let answer = coord
        .query(healthy.document_id, "When does the pager rotation change?")
        .await
        .unwrap();
    assert!(answer.answer.contains("Wednesday"), "got: {}", answer.answer);

    let stats = coord.get_stats().await.unwrap();
    let load_breaker = stats.breakers.iter().find(|b| b.name == "load").unwrap();
    assert_eq!(load_breaker.state, CircuitState::Closed);
    assert_eq!(load_breaker.trips, 0);
}

#[tokio::test]
async fn test_mistyped_primary_fails_verify_and_is_rebuilt() {
    let tmp = TempDir::new().unwrap();
    let coord = Coordinator::open(&test_config(tmp.path())).await.unwrap();
    let record = coord
        .index_file(&write_doc(tmp.path(), "backups.md", BACKUPS), false)
        .await
        .unwrap();
    let id = record.document_id;

    fs::write(
        record.index_path.join(PRIMARY_FILE),
        r#"{"embedding_dict": [], "text_id_to_ref_doc_id": 0, "metadata_dict": "x"}"#,
    )
    .unwrap();
    assert!(!coord.files().verify(&record.index_path));
    let report = coord.verify(id).await.unwrap();
    assert_eq!(report.severity, Severity::Critical);
    assert!(report.corruption_detected);
    assert!(!coord.load_index(id).await);

    let result = coord.recover(id, false).await.unwrap();
    assert_eq!(result.action, RecoveryAction::Rebuilt);
    assert!(result.success);
    assert!(coord.load_index(id).await);
}

#[tokio::test]
async fn test_cleanup_removes_backups_left_by_an_interrupted_overwrite() {
    let tmp = TempDir::new().unwrap();
    let coord = Coordinator::open(&test_config(tmp.path())).await.unwrap();
    let record = coord
        .index_file(&write_doc(tmp.path(), "backups.md", BACKUPS), false)
        .await
        .unwrap();

    let dir_name = record.index_path.file_name().unwrap().to_str().unwrap();
    let leftover = coord.files().root().join(format!(".{dir_name}.prev-0123abcd"));
    fs::create_dir_all(&leftover).unwrap();
    coord.files().copy(&record.index_path, &leftover).unwrap();

    assert_eq!(coord.cleanup_orphans().await.unwrap(), 1);
    assert!(!leftover.exists());
    assert!(coord.files().verify(&record.index_path));

    // a clean overwrite leaves no backup behind either
    coord.rebuild_index(record.document_id).await.unwrap();
    assert_eq!(coord.cleanup_orphans().await.unwrap(), 0);
}
