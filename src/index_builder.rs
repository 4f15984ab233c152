//! Build one verified, persisted index for one document.
//!
//! The build is three-phase and crash-consistent rather than transactional:
//!
//! 1. extract, chunk and embed into `<temp_root>/.build-<uuid>`,
//! 2. copy the finished build to `doc_{id}_{hash8}` under the storage root,
//! 3. re-verify the final directory.
//!
//! A [`ScopedCleanup`] owns the temporary directory, the partially copied
//! final directory, and any previous index moved aside by an overwrite, so
//! every exit route (error, panic, dropped future) leaves either the old
//! index or a fully verified new one in place.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::artifact::{self, IndexMetadata, FORMAT_VERSION, METADATA_FILE};
use crate::chunk::Chunker;
use crate::error::{IndexError, IndexResult, ValidationReport};
use crate::extract::{self, DocumentSource};
use crate::file_manager::{format_bytes, FileManager};
use crate::models::Document;
use crate::provider::IndexProvider;
use crate::resilience::{guarded, CircuitBreaker, Retry, ScopedCleanup};

/// Outcome of a successful build.
#[derive(Debug, Clone, Serialize)]
pub struct BuildResult {
    pub index_path: PathBuf,
    /// Content hash of the document the index was built from.
    pub index_hash: String,
    pub chunk_count: usize,
    pub build_duration: Duration,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BuilderStats {
    pub builds: u64,
    pub failures: u64,
    pub chunks_indexed: u64,
    pub last_build_ms: Option<u64>,
}

pub struct IndexBuilder {
    files: FileManager,
    provider: Arc<dyn IndexProvider>,
    source: Arc<dyn DocumentSource>,
    chunker: Chunker,
    temp_root: PathBuf,
    large_file_warn_bytes: u64,
    breaker: Arc<CircuitBreaker>,
    retry: Arc<Retry>,
    stats: Mutex<BuilderStats>,
}

impl IndexBuilder {
    pub fn new(
        files: FileManager,
        provider: Arc<dyn IndexProvider>,
        source: Arc<dyn DocumentSource>,
        chunker: Chunker,
        breaker: Arc<CircuitBreaker>,
        retry: Arc<Retry>,
    ) -> Self {
        let temp_root = files.root().join(".tmp");
        Self {
            files,
            provider,
            source,
            chunker,
            temp_root,
            large_file_warn_bytes: 100 * 1024 * 1024,
            breaker,
            retry,
            stats: Mutex::new(BuilderStats::default()),
        }
    }

    pub fn with_temp_root(mut self, temp_root: impl Into<PathBuf>) -> Self {
        self.temp_root = temp_root.into();
        self
    }

    pub fn with_large_file_warning(mut self, bytes: u64) -> Self {
        self.large_file_warn_bytes = bytes;
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn stats(&self) -> BuilderStats {
        self.stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Check every build precondition without touching the index directory.
    pub fn validate(&self, document: &Document) -> ValidationReport {
        let mut report = ValidationReport::new();
        let path = &document.file_path;

        match std::fs::metadata(path) {
            Ok(meta) if !meta.is_file() => report.error(
                format!("{} is not a regular file", path.display()),
                "Point the document at a file, not a directory",
            ),
            Ok(meta) if meta.len() == 0 => report.error(
                format!("{} is empty", path.display()),
                "Provide a document with content",
            ),
            Ok(meta) => {
                if meta.len() > self.large_file_warn_bytes {
                    report.warn(format!(
                        "{} is {}; the build may take a while",
                        path.display(),
                        format_bytes(meta.len())
                    ));
                }
            }
            Err(_) => report.error(
                format!("document file not found: {}", path.display()),
                "Check the document path or re-register the document",
            ),
        }

        if !self.files.root_is_usable() {
            report.error(
                format!("storage root {} is not writable", self.files.root().display()),
                "Check storage.root in the config and its permissions",
            );
        }

        for problem in self.provider.check_credentials() {
            report.error(problem, "Configure the provider credentials and retry");
        }

        report
    }

    /// Build the index for `document`.
    ///
    /// Fails with [`IndexError::AlreadyExists`] when the target directory
    /// exists and `overwrite` is false.
    pub async fn build(&self, document: &Document, overwrite: bool) -> IndexResult<BuildResult> {
        let started = Instant::now();
        let result = self.build_inner(document, overwrite, started).await;

        if let Ok(mut stats) = self.stats.lock() {
            match &result {
                Ok(built) => {
                    stats.builds += 1;
                    stats.chunks_indexed += built.chunk_count as u64;
                    stats.last_build_ms = Some(built.build_duration.as_millis() as u64);
                }
                Err(_) => stats.failures += 1,
            }
        }

        match &result {
            Ok(built) => tracing::info!(
                document_id = document.id,
                path = %built.index_path.display(),
                chunks = built.chunk_count,
                ms = built.build_duration.as_millis() as u64,
                "index built"
            ),
            Err(e) => tracing::warn!(document_id = document.id, error = %e, "index build failed"),
        }
        result
    }

    async fn build_inner(
        &self,
        document: &Document,
        overwrite: bool,
        started: Instant,
    ) -> IndexResult<BuildResult> {
        let report = self.validate(document).into_result()?;
        for warning in &report.warnings {
            tracing::warn!(document_id = document.id, "{}", warning);
        }

        let content_hash = extract::content_hash_async(document.file_path.clone()).await?;
        if content_hash != document.content_hash {
            tracing::debug!(
                document_id = document.id,
                "document changed since registration; indexing current content"
            );
        }
        self.files.ensure_root()?;
        let index_path = self.files.generate_path(document.id, &content_hash);
        if index_path.exists() && !overwrite {
            return Err(IndexError::AlreadyExists(index_path));
        }

        let mut cleanup = ScopedCleanup::new();
        let build_dir = self.temp_root.join(format!(".build-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&build_dir).map_err(|e| {
            IndexError::storage_io(format!("create build dir {}", build_dir.display()), e)
        })?;
        cleanup.register_path(&build_dir);

        let extracted = self.source.extract(document).await?;
        if extracted.text.trim().is_empty() {
            return Err(IndexError::Processing(format!(
                "no extractable text in {}",
                document.file_path.display()
            )));
        }
        tracing::debug!(
            document_id = document.id,
            words = extracted.word_count,
            pages = ?extracted.page_count,
            "extracted text"
        );

        let chunker = self.chunker.clone();
        let text = extracted.text;
        let chunks = tokio::task::spawn_blocking(move || chunker.chunk(&text)).await?;
        if chunks.is_empty() {
            return Err(IndexError::Processing("chunking produced no chunks".to_string()));
        }

        let chunk_count = guarded(&self.breaker, &self.retry, || {
            self.provider.embed_and_index(&chunks, &build_dir)
        })
        .await?;

        artifact::write_json(
            &build_dir.join(METADATA_FILE),
            &IndexMetadata {
                format_version: FORMAT_VERSION,
                document_id: document.id,
                content_hash: content_hash.clone(),
                chunk_count,
                chunking_strategy: self.chunker.kind().to_string(),
                embedding_model: self.provider.model_name().to_string(),
                created_at: chrono::Utc::now().timestamp(),
            },
        )?;

        if overwrite && index_path.exists() {
            let backup = set_aside(&index_path)?;
            let files = self.files.clone();
            let final_path = index_path.clone();
            cleanup.register_handler("restore previous index", move || {
                if files.verify(&final_path) {
                    std::fs::remove_dir_all(&backup)
                } else {
                    files.cleanup(&final_path);
                    std::fs::rename(&backup, &final_path)
                }
            });
        }

        if let Err(e) = self.persist(&build_dir, &index_path, &mut cleanup).await {
            let removed = self.files.cleanup(&index_path);
            tracing::warn!(
                path = %index_path.display(),
                removed,
                "emergency cleanup of partial index"
            );
            return Err(match e {
                IndexError::AlreadyExists(p) => IndexError::AlreadyExists(p),
                other => IndexError::IndexCreation(format!(
                    "persisting {} failed: {}",
                    index_path.display(),
                    other
                )),
            });
        }

        let failed = cleanup.run();
        if failed > 0 {
            tracing::warn!(failed, "some build cleanup actions failed");
        }

        Ok(BuildResult {
            index_path,
            index_hash: content_hash,
            chunk_count,
            build_duration: started.elapsed(),
        })
    }

    async fn persist(
        &self,
        build_dir: &Path,
        index_path: &Path,
        cleanup: &mut ScopedCleanup,
    ) -> IndexResult<()> {
        self.files.prepare(index_path, false)?;
        cleanup.register_path(index_path);

        let bytes = self
            .files
            .copy_async(build_dir.to_path_buf(), index_path.to_path_buf())
            .await?;

        if !self.files.verify(index_path) {
            return Err(IndexError::corruption(
                index_path,
                "final artifacts failed verification after copy",
            ));
        }
        cleanup.disarm_path(index_path);
        tracing::debug!(path = %index_path.display(), bytes, "index persisted");
        Ok(())
    }
}

/// Move an existing index to its backup name beside it.
fn set_aside(index_path: &Path) -> IndexResult<PathBuf> {
    let name = index_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("index");
    let backup = index_path.with_file_name(artifact::backup_dir_name(name));
    std::fs::rename(index_path, &backup).map_err(|e| {
        IndexError::storage_io(format!("move aside {}", index_path.display()), e)
    })?;
    Ok(backup)
}
