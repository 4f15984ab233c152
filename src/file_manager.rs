//! Filesystem side of the index lifecycle.
//!
//! [`FileManager`] is the only component that creates, copies, or deletes
//! index directories under the storage root. Index directories follow the
//! `doc_{document_id}_{hash8}` convention from [`crate::artifact`]; anything
//! else under the root (the `.tmp` build area, stray files) is ignored by
//! orphan discovery and counted only in byte totals.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Serialize;
use walkdir::WalkDir;

use crate::artifact::{
    self, GraphStore, IndexMetadata, IndexStore, VectorStore, GRAPH_STORE_FILE, INDEX_STORE_FILE,
    METADATA_FILE, PRIMARY_FILE, PRIMARY_KEYS, REQUIRED_FILES,
};
use crate::error::{IndexError, IndexResult};

/// What a single artifact file looks like on disk.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum FileStatus {
    Ok,
    Missing,
    Empty,
    Unparseable(String),
    /// Parses, but lacks required top-level keys.
    MissingKeys(Vec<String>),
}

impl FileStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, FileStatus::Ok)
    }
}

/// Per-file status of one index directory.
#[derive(Debug, Clone, Serialize)]
pub struct Inspection {
    pub path: PathBuf,
    pub dir_exists: bool,
    /// Every required artifact plus the optional metadata file.
    pub files: BTreeMap<String, FileStatus>,
}

impl Inspection {
    pub fn status(&self, file: &str) -> &FileStatus {
        self.files.get(file).unwrap_or(&FileStatus::Missing)
    }

    /// All required files are sound and the metadata file is absent or sound.
    pub fn is_valid(&self) -> bool {
        self.dir_exists
            && REQUIRED_FILES.iter().all(|f| self.status(f).is_ok())
            && matches!(self.status(METADATA_FILE), FileStatus::Ok | FileStatus::Missing)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StorageStats {
    pub root: PathBuf,
    pub index_count: usize,
    pub total_bytes: u64,
    pub accessible: bool,
}

#[derive(Debug, Clone)]
pub struct FileManager {
    root: PathBuf,
}

impl FileManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure_root(&self) -> IndexResult<()> {
        std::fs::create_dir_all(&self.root).map_err(|e| {
            IndexError::storage_io(format!("create storage root {}", self.root.display()), e)
        })
    }

    /// The root exists, is a directory, and accepts writes.
    pub fn is_accessible(&self) -> bool {
        if !self.root.is_dir() {
            return false;
        }
        let marker = self.root.join(format!(".write-check-{}", uuid::Uuid::new_v4()));
        let ok = std::fs::write(&marker, b"ok").is_ok();
        let _ = std::fs::remove_file(&marker);
        ok
    }

    /// The root accepts writes, or does not exist yet but could be created
    /// because its nearest existing ancestor is a writable directory.
    pub fn root_is_usable(&self) -> bool {
        if self.root.exists() {
            return self.is_accessible();
        }
        self.root
            .ancestors()
            .skip(1)
            .map(|p| if p.as_os_str().is_empty() { Path::new(".") } else { p })
            .find(|p| p.exists())
            .and_then(|p| std::fs::metadata(p).ok())
            .map(|m| m.is_dir() && !m.permissions().readonly())
            .unwrap_or(false)
    }

    /// Deterministic location for an index of `content_hash` belonging to
    /// `document_id`.
    pub fn generate_path(&self, document_id: i64, content_hash: &str) -> PathBuf {
        self.root.join(artifact::dir_name(document_id, content_hash))
    }

    pub fn inspect(&self, index_path: &Path) -> Inspection {
        let mut files = BTreeMap::new();
        let dir_exists = index_path.is_dir();
        if dir_exists {
            for name in REQUIRED_FILES.iter().chain(std::iter::once(&METADATA_FILE)) {
                files.insert(name.to_string(), inspect_file(&index_path.join(name), name));
            }
        }
        Inspection {
            path: index_path.to_path_buf(),
            dir_exists,
            files,
        }
    }

    /// All-or-nothing structural check of an index directory.
    pub fn verify(&self, index_path: &Path) -> bool {
        let inspection = self.inspect(index_path);
        let ok = inspection.is_valid();
        if !ok {
            tracing::debug!(path = %index_path.display(), files = ?inspection.files, "verification failed");
        }
        ok
    }

    /// Make `path` an empty directory.
    ///
    /// Fails with [`IndexError::AlreadyExists`] when it exists and
    /// `overwrite` is false.
    pub fn prepare(&self, path: &Path, overwrite: bool) -> IndexResult<()> {
        if path.exists() {
            if !overwrite {
                return Err(IndexError::AlreadyExists(path.to_path_buf()));
            }
            std::fs::remove_dir_all(path)
                .map_err(|e| IndexError::storage_io(format!("clear {}", path.display()), e))?;
        }
        std::fs::create_dir_all(path)
            .map_err(|e| IndexError::storage_io(format!("create {}", path.display()), e))
    }

    /// Recursive copy preserving structure. Returns bytes copied.
    pub fn copy(&self, source: &Path, dest: &Path) -> IndexResult<u64> {
        let mut copied = 0u64;
        for entry in WalkDir::new(source) {
            let entry = entry.map_err(|e| {
                IndexError::storage(format!("walk {}: {}", source.display(), e))
            })?;
            let rel = entry
                .path()
                .strip_prefix(source)
                .map_err(|e| IndexError::storage(e.to_string()))?;
            let target = dest.join(rel);
            if entry.file_type().is_dir() {
                std::fs::create_dir_all(&target).map_err(|e| {
                    IndexError::storage_io(format!("create {}", target.display()), e)
                })?;
            } else {
                copied += std::fs::copy(entry.path(), &target).map_err(|e| {
                    IndexError::storage_io(format!("copy to {}", target.display()), e)
                })?;
            }
        }
        Ok(copied)
    }

    /// [`copy`](Self::copy) on a blocking worker thread.
    pub async fn copy_async(&self, source: PathBuf, dest: PathBuf) -> IndexResult<u64> {
        let fm = self.clone();
        tokio::task::spawn_blocking(move || fm.copy(&source, &dest)).await?
    }

    /// Best-effort recursive delete. Returns whether something was removed.
    pub fn cleanup(&self, path: &Path) -> bool {
        if !path.exists() {
            return false;
        }
        match std::fs::remove_dir_all(path) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove index directory");
                false
            }
        }
    }

    /// Chunk count from the metadata artifact, else the primary's embedding
    /// map size, else 0.
    pub fn chunk_count(&self, index_path: &Path) -> usize {
        if let Ok(meta) = artifact::read_json::<IndexMetadata>(&index_path.join(METADATA_FILE)) {
            return meta.chunk_count;
        }
        self.primary_chunk_count(index_path).unwrap_or(0)
    }

    /// Number of embeddings actually present in the primary artifact.
    pub fn primary_chunk_count(&self, index_path: &Path) -> Option<usize> {
        artifact::read_json::<VectorStore>(&index_path.join(PRIMARY_FILE))
            .ok()
            .map(|s| s.len())
    }

    /// Index-shaped directories under the root that are not in `valid_paths`,
    /// plus every overwrite backup.
    ///
    /// Paths are matched by directory name, so relative and absolute forms
    /// of the same index compare equal. A build restores or removes its own
    /// backup before returning, so one found here outlived a crashed build;
    /// callers must not sweep while builds are running.
    pub fn find_orphans(&self, valid_paths: &[PathBuf]) -> Vec<PathBuf> {
        let valid: HashSet<&std::ffi::OsStr> =
            valid_paths.iter().filter_map(|p| p.file_name()).collect();

        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(root = %self.root.display(), error = %e, "cannot list storage root");
                return Vec::new();
            }
        };

        let mut orphans: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter(|e| match e.file_name().to_str() {
                Some(name) if artifact::parse_backup_name(name).is_some() => true,
                Some(name) => {
                    artifact::parse_dir_name(name).is_some()
                        && !valid.contains(e.file_name().as_os_str())
                }
                None => false,
            })
            .map(|e| e.path())
            .collect();
        orphans.sort();
        orphans
    }

    /// Delete each orphan; returns how many were actually removed.
    pub fn cleanup_orphans(&self, orphans: &[PathBuf]) -> usize {
        let removed = orphans.iter().filter(|p| self.cleanup(p)).count();
        if removed > 0 {
            tracing::info!(removed, "removed orphaned index directories");
        }
        removed
    }

    pub fn storage_stats(&self) -> StorageStats {
        let accessible = self.is_accessible();
        let mut stats = StorageStats {
            root: self.root.clone(),
            accessible,
            ..StorageStats::default()
        };
        if !self.root.is_dir() {
            return stats;
        }

        for entry in WalkDir::new(&self.root).min_depth(1).into_iter().flatten() {
            if entry.depth() == 1
                && entry.file_type().is_dir()
                && entry
                    .file_name()
                    .to_str()
                    .and_then(artifact::parse_dir_name)
                    .is_some()
            {
                stats.index_count += 1;
            }
            if entry.file_type().is_file() {
                stats.total_bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
            }
        }
        stats
    }

    /// [`storage_stats`](Self::storage_stats) on a blocking worker thread.
    pub async fn storage_stats_async(&self) -> IndexResult<StorageStats> {
        let fm = self.clone();
        Ok(tokio::task::spawn_blocking(move || fm.storage_stats()).await?)
    }
}

fn inspect_file(path: &Path, name: &str) -> FileStatus {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return FileStatus::Missing,
        Err(e) => return FileStatus::Unparseable(e.to_string()),
    };
    if bytes.is_empty() {
        return FileStatus::Empty;
    }
    let value: serde_json::Value = match serde_json::from_slice(&bytes) {
        Ok(v) => v,
        Err(e) => return FileStatus::Unparseable(e.to_string()),
    };
    if name == PRIMARY_FILE {
        let missing: Vec<String> = PRIMARY_KEYS
            .iter()
            .filter(|k| value.get(**k).is_none())
            .map(|k| k.to_string())
            .collect();
        if !missing.is_empty() {
            return FileStatus::MissingKeys(missing);
        }
    }

    // well-formed JSON of the wrong shape still cannot be loaded
    let typed = match name {
        PRIMARY_FILE => serde_json::from_value::<VectorStore>(value).map(drop),
        GRAPH_STORE_FILE => serde_json::from_value::<GraphStore>(value).map(drop),
        INDEX_STORE_FILE => serde_json::from_value::<IndexStore>(value).map(drop),
        METADATA_FILE => serde_json::from_value::<IndexMetadata>(value).map(drop),
        _ => Ok(()),
    };
    match typed {
        Ok(()) => FileStatus::Ok,
        Err(e) => FileStatus::Unparseable(e.to_string()),
    }
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
