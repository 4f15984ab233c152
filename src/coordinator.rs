//! The façade CLI and API layers talk to.
//!
//! [`Coordinator`] wires the services together and owns the cross-service
//! steps: persisting the index record after a build, swapping out the old
//! index directory, invalidating cached indexes after a rebuild or
//! recovery, and publishing [`IndexEvent`]s.
//!
//! # Construction
//!
//! ```rust,no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use std::path::Path;
//!
//! let config = docindex::config::load_config(Path::new("config/docindex.toml"))?;
//! let coordinator = docindex::coordinator::Coordinator::open(&config).await?;
//! let doc = coordinator.register_document(Path::new("notes/design.md")).await?;
//! coordinator.build_index(&doc, false).await?;
//! let answer = coordinator.query(doc.id, "What is the retry policy?").await?;
//! println!("{}", answer.answer);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::broadcast;

use crate::chunk::Chunker;
use crate::config::Config;
use crate::error::{IndexError, IndexResult, ValidationReport};
use crate::events::{EventBus, IndexEvent};
use crate::extract::{self, DocumentSource, FileDocumentSource};
use crate::file_manager::{FileManager, StorageStats};
use crate::index_builder::{BuilderStats, IndexBuilder};
use crate::models::{Document, NewDocument, NewVectorIndex, VectorIndex};
use crate::provider::{IndexProvider, VectorIndexProvider};
use crate::query_engine::{IndexStatus, QueryAnswer, QueryEngine, QueryStats};
use crate::recovery::{
    CorruptionReport, HealthReport, RecoveryResult, RecoveryService, RecoveryStats,
};
use crate::resilience::{
    CircuitBreaker, CircuitSnapshot, CircuitState, HealthChecker, Retry, RetryPolicy, RetryStats,
    ScopedCleanup,
};
use crate::store::{MetadataStore, SqliteStore};

/// Share of `storage.max_total_bytes` above which headroom is reported low.
const HEADROOM_RATIO: f64 = 0.9;

/// Everything `get_stats` knows, in one serialisable value.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStats {
    pub documents: usize,
    pub indexes: usize,
    pub storage: StorageStats,
    pub builder: BuilderStats,
    pub query: QueryStats,
    pub recovery: RecoveryStats,
    pub retry: RetryStats,
    pub breakers: Vec<CircuitSnapshot>,
    pub generated_at: i64,
}

pub struct Coordinator {
    store: Arc<dyn MetadataStore>,
    files: FileManager,
    builder: IndexBuilder,
    engine: QueryEngine,
    recovery: RecoveryService,
    retry: Arc<Retry>,
    breakers: Vec<Arc<CircuitBreaker>>,
    health: HealthChecker,
    events: EventBus,
    build_locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
    /// Builds share it; orphan sweeps take it exclusively so they never see
    /// a half-registered index or a backup still in use.
    sweep_gate: tokio::sync::RwLock<()>,
}

impl Coordinator {
    /// SQLite metadata store and the configured providers.
    pub async fn open(config: &Config) -> anyhow::Result<Self> {
        let store = Arc::new(SqliteStore::open(config).await?);
        let provider = Arc::new(VectorIndexProvider::from_config(config)?);
        Ok(Self::with_parts(
            config,
            store,
            provider,
            Arc::new(FileDocumentSource),
        )?)
    }

    /// Assemble from explicit collaborators.
    pub fn with_parts(
        config: &Config,
        store: Arc<dyn MetadataStore>,
        provider: Arc<dyn IndexProvider>,
        source: Arc<dyn DocumentSource>,
    ) -> IndexResult<Self> {
        let chunker = Chunker::from_config(&config.chunking).map_err(|e| {
            let mut report = ValidationReport::new();
            report.error(e.to_string(), "Set chunking.strategy to a known strategy");
            IndexError::Validation(report)
        })?;

        let files = FileManager::new(&config.storage.root);
        let retry = Arc::new(Retry::new(RetryPolicy::from_config(&config.retry)));
        let build_breaker = Arc::new(CircuitBreaker::new("build", &config.circuit_breaker));
        let load_breaker = Arc::new(CircuitBreaker::new("load", &config.circuit_breaker));
        let query_breaker = Arc::new(CircuitBreaker::new("query", &config.circuit_breaker));
        let events = EventBus::default();

        let builder = IndexBuilder::new(
            files.clone(),
            provider.clone(),
            source,
            chunker,
            build_breaker.clone(),
            retry.clone(),
        )
        .with_temp_root(config.storage.temp_root())
        .with_large_file_warning(config.storage.large_file_warn_bytes);

        let engine = QueryEngine::new(
            store.clone(),
            files.clone(),
            provider,
            config.query.cache_capacity,
            load_breaker.clone(),
            query_breaker.clone(),
            retry.clone(),
            events.clone(),
        );

        let recovery = RecoveryService::new(store.clone(), files.clone());
        let breakers = vec![build_breaker, load_breaker, query_breaker];
        let health = health_checker(&store, &files, &breakers, config.storage.max_total_bytes);

        Ok(Self {
            store,
            files,
            builder,
            engine,
            recovery,
            retry,
            breakers,
            health,
            events,
            build_locks: Mutex::new(HashMap::new()),
            sweep_gate: tokio::sync::RwLock::new(()),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IndexEvent> {
        self.events.subscribe()
    }

    pub fn files(&self) -> &FileManager {
        &self.files
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    /// Record `path` as a document, hashing its current content.
    ///
    /// Registering the same path again updates the existing document.
    pub async fn register_document(&self, path: &Path) -> IndexResult<Document> {
        let file_path = match tokio::fs::canonicalize(path).await {
            Ok(p) => p,
            Err(_) => {
                let mut report = ValidationReport::new();
                report.error(
                    format!("document file not found: {}", path.display()),
                    "Check the path and try again",
                );
                return Err(IndexError::Validation(report));
            }
        };
        let meta = tokio::fs::metadata(&file_path).await?;
        if !meta.is_file() {
            let mut report = ValidationReport::new();
            report.error(
                format!("{} is not a file", file_path.display()),
                "Pass a single document file",
            );
            return Err(IndexError::Validation(report));
        }

        let content_hash = extract::content_hash_async(file_path.clone()).await?;
        let title = file_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("untitled")
            .to_string();

        let doc = self
            .store
            .upsert_document(&NewDocument {
                title,
                mime_type: extract::detect_mime(&file_path).to_string(),
                file_path,
                content_hash,
                file_size: meta.len(),
            })
            .await?;
        tracing::debug!(document_id = doc.id, path = %doc.file_path.display(), "document registered");
        Ok(doc)
    }

    pub async fn document(&self, document_id: i64) -> IndexResult<Document> {
        self.store
            .get_document(document_id)
            .await?
            .ok_or(IndexError::DocumentNotFound(document_id))
    }

    pub async fn list_documents(&self) -> IndexResult<Vec<Document>> {
        self.store.list_documents().await
    }

    fn build_lock(&self, document_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.build_locks.lock().unwrap_or_else(|p| p.into_inner());
        locks.entry(document_id).or_default().clone()
    }

    /// Build, persist and register the index for `document`.
    ///
    /// The new record replaces the old one in a single store transaction;
    /// the old directory is removed afterwards when it lives elsewhere.
    pub async fn build_index(&self, document: &Document, overwrite: bool) -> IndexResult<VectorIndex> {
        let _building = self.sweep_gate.read().await;
        let lock = self.build_lock(document.id);
        let _guard = lock.lock().await;

        let built = self.builder.build(document, overwrite).await?;

        let mut cleanup = ScopedCleanup::new();
        let previous_path = self
            .store
            .get_vector_index(document.id)
            .await?
            .map(|r| r.index_path);
        if previous_path.as_deref() != Some(built.index_path.as_path()) {
            cleanup.register_path(&built.index_path);
        }

        if built.index_hash != document.content_hash {
            let size = tokio::fs::metadata(&document.file_path)
                .await
                .map(|m| m.len())
                .unwrap_or(document.file_size);
            self.store
                .upsert_document(&NewDocument {
                    title: document.title.clone(),
                    file_path: document.file_path.clone(),
                    content_hash: built.index_hash.clone(),
                    mime_type: document.mime_type.clone(),
                    file_size: size,
                })
                .await?;
        }

        let (record, previous) = self
            .store
            .replace_vector_index(&NewVectorIndex {
                document_id: document.id,
                index_path: built.index_path.clone(),
                index_hash: built.index_hash.clone(),
                chunk_count: built.chunk_count,
            })
            .await?;
        cleanup.disarm_path(&built.index_path);

        if let Some(previous) = previous {
            if previous.index_path != record.index_path {
                let files = self.files.clone();
                let old = previous.index_path.clone();
                let removed = tokio::task::spawn_blocking(move || files.cleanup(&old)).await?;
                tracing::debug!(path = %previous.index_path.display(), removed, "removed superseded index");
            }
        }

        self.engine.evict(document.id);
        self.events.emit(IndexEvent::Built {
            document_id: document.id,
            index_path: record.index_path.clone(),
            chunk_count: record.chunk_count,
        });
        Ok(record)
    }

    /// Register `path` and build its index in one step.
    pub async fn index_file(&self, path: &Path, overwrite: bool) -> IndexResult<VectorIndex> {
        let doc = self.register_document(path).await?;
        self.build_index(&doc, overwrite).await
    }

    /// `true` when the document's index is loaded and ready for queries.
    pub async fn load_index(&self, document_id: i64) -> bool {
        self.engine.try_load(document_id).await
    }

    pub async fn query(&self, document_id: i64, text: &str) -> IndexResult<QueryAnswer> {
        self.engine.query(document_id, text).await
    }

    /// Rebuild from the document's current content, replacing the old index.
    pub async fn rebuild_index(&self, document_id: i64) -> IndexResult<VectorIndex> {
        let doc = self.document(document_id).await?;
        self.build_index(&doc, true).await
    }

    pub async fn recover(&self, document_id: i64, force_rebuild: bool) -> IndexResult<RecoveryResult> {
        let result = self
            .recovery
            .recover(document_id, force_rebuild, || self.rebuild_index(document_id))
            .await?;
        self.engine.evict(document_id);
        self.events.emit(IndexEvent::Recovered {
            document_id,
            severity: result.severity_before,
            action: result.action,
        });
        Ok(result)
    }

    /// Grade a document's index without repairing anything.
    pub async fn verify(&self, document_id: i64) -> IndexResult<CorruptionReport> {
        let record = self
            .store
            .get_vector_index(document_id)
            .await?
            .ok_or_else(|| IndexError::IndexLoad {
                document_id,
                reason: "no index has been built for this document".to_string(),
            })?;
        self.recovery
            .analyze(&record.index_path, Some(record.chunk_count))
            .await
    }

    pub async fn index_status(&self, document_id: i64) -> IndexResult<IndexStatus> {
        self.engine.status(document_id).await
    }

    pub async fn list_indexes(&self) -> IndexResult<Vec<VectorIndex>> {
        self.store.list_vector_indexes().await
    }

    /// Remove orphaned rows and directories; returns how many went.
    pub async fn cleanup_orphans(&self) -> IndexResult<usize> {
        let _sweeping = self.sweep_gate.write().await;
        let count = self.recovery.cleanup_orphans().await?.total();
        self.events.emit(IndexEvent::OrphansRemoved { count });
        Ok(count)
    }

    pub async fn health_check(&self) -> IndexResult<HealthReport> {
        let _sweeping = self.sweep_gate.write().await;
        let report = self.recovery.system_health(&self.health).await?;
        if report.orphans_removed > 0 {
            self.events.emit(IndexEvent::OrphansRemoved {
                count: report.orphans_removed,
            });
        }
        self.events.emit(IndexEvent::HealthChecked {
            status: report.status,
        });
        Ok(report)
    }

    pub async fn get_stats(&self) -> IndexResult<CoordinatorStats> {
        Ok(CoordinatorStats {
            documents: self.store.list_documents().await?.len(),
            indexes: self.store.list_vector_indexes().await?.len(),
            storage: self.files.storage_stats_async().await?,
            builder: self.builder.stats(),
            query: self.engine.stats(),
            recovery: self.recovery.stats(),
            retry: self.retry.stats(),
            breakers: self.breakers.iter().map(|b| b.snapshot()).collect(),
            generated_at: chrono::Utc::now().timestamp(),
        })
    }

    /// Drop every cached index.
    pub fn clear_cache(&self) {
        self.engine.clear();
    }
}

fn health_checker(
    store: &Arc<dyn MetadataStore>,
    files: &FileManager,
    breakers: &[Arc<CircuitBreaker>],
    max_total_bytes: Option<u64>,
) -> HealthChecker {
    let mut checker = HealthChecker::default();

    let fm = files.clone();
    checker.register("storage", move || {
        let fm = fm.clone();
        async move {
            tokio::task::spawn_blocking(move || fm.ensure_root().is_ok() && fm.is_accessible())
                .await
                .unwrap_or(false)
        }
    });

    let store = store.clone();
    checker.register("metadata_store", move || {
        let store = store.clone();
        async move { store.ping().await }
    });

    let fm = files.clone();
    checker.register("resource_headroom", move || {
        let fm = fm.clone();
        async move {
            let Some(limit) = max_total_bytes else {
                return true;
            };
            match fm.storage_stats_async().await {
                Ok(stats) => (stats.total_bytes as f64) < limit as f64 * HEADROOM_RATIO,
                Err(_) => false,
            }
        }
    });

    for breaker in breakers {
        let breaker = breaker.clone();
        checker.register_sync(format!("circuit_{}", breaker.name()), move || {
            breaker.state() != CircuitState::Open
        });
    }

    checker
}

/// Directories `dix init` creates.
pub fn storage_dirs(config: &Config) -> Vec<PathBuf> {
    vec![config.storage.root.clone(), config.storage.temp_root()]
}
