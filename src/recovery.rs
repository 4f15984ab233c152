//! Corruption analysis and repair of persisted indexes.
//!
//! [`RecoveryService::analyze`] grades an index directory on a four-step
//! [`Severity`] scale and [`RecoveryService::recover`] picks the repair:
//!
//! | Severity | Meaning | Repair |
//! |----------|---------|--------|
//! | `critical` | directory or a required file missing, primary unreadable | full rebuild via callback |
//! | `moderate` | a secondary artifact empty or unparseable | regenerate secondaries from the primary, else rebuild |
//! | `light` | structurally sound but drifted (counts disagree, metadata absent, repaired before) | reconcile `chunk_count` |
//! | `none` | sound | reconcile `chunk_count` |
//!
//! The service also owns the system-wide sweep: corrupted-index discovery,
//! orphan cleanup across the metadata store and the filesystem, and the
//! aggregated health report.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::artifact::{self, IndexMetadata, METADATA_FILE, PRIMARY_FILE, REQUIRED_FILES};
use crate::error::{IndexError, IndexResult};
use crate::file_manager::{FileManager, FileStatus};
use crate::models::VectorIndex;
use crate::resilience::HealthChecker;
use crate::store::MetadataStore;

const HISTORY_LIMIT: usize = 100;

/// Probes whose failure makes the whole system critical rather than degraded.
pub const CRITICAL_PROBES: [&str; 2] = ["storage", "metadata_store"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    None,
    Light,
    Moderate,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::None => "none",
            Severity::Light => "light",
            Severity::Moderate => "moderate",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CorruptionType {
    MissingDirectory,
    MissingFiles,
    EmptyFiles,
    CorruptedFiles,
    Drift,
}

#[derive(Debug, Clone, Serialize)]
pub struct CorruptionReport {
    pub path: PathBuf,
    pub severity: Severity,
    /// Severity is `moderate` or worse.
    pub corruption_detected: bool,
    pub corruption_types: Vec<CorruptionType>,
    pub missing_files: Vec<String>,
    pub empty_files: Vec<String>,
    pub corrupted_files: Vec<String>,
    /// Human-readable drift signals behind a `light` grade.
    pub drift: Vec<String>,
    /// Chunk count recoverable from the primary artifact.
    pub actual_chunk_count: Option<usize>,
    pub recommendations: Vec<String>,
}

impl CorruptionReport {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            severity: Severity::None,
            corruption_detected: false,
            corruption_types: Vec::new(),
            missing_files: Vec::new(),
            empty_files: Vec::new(),
            corrupted_files: Vec::new(),
            drift: Vec::new(),
            actual_chunk_count: None,
            recommendations: Vec::new(),
        }
    }

    fn raise(&mut self, severity: Severity, kind: CorruptionType) {
        self.severity = self.severity.max(severity);
        self.corruption_detected = self.severity >= Severity::Moderate;
        if !self.corruption_types.contains(&kind) {
            self.corruption_types.push(kind);
        }
    }

    /// Needs more than a count reconciliation.
    pub fn is_corrupted(&self) -> bool {
        self.corruption_detected
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Sound and consistent; nothing changed.
    Verified,
    /// Persisted chunk count corrected.
    Reconciled,
    /// Secondary artifacts regenerated from the primary.
    PartialRepair,
    Rebuilt,
}

impl RecoveryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryAction::Verified => "verified",
            RecoveryAction::Reconciled => "reconciled",
            RecoveryAction::PartialRepair => "partial_repair",
            RecoveryAction::Rebuilt => "rebuilt",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryResult {
    pub document_id: i64,
    pub success: bool,
    pub action: RecoveryAction,
    pub severity_before: Severity,
    pub severity_after: Severity,
    pub index_path: Option<PathBuf>,
    pub chunk_count: usize,
    pub message: String,
    pub duration: Duration,
}

/// One entry of the recovery history.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryRecord {
    pub document_id: i64,
    pub path: Option<PathBuf>,
    pub severity: Severity,
    pub action: Option<RecoveryAction>,
    pub success: bool,
    pub at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CorruptedIndex {
    pub document_id: i64,
    pub path: PathBuf,
    pub severity: Severity,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checks: BTreeMap<String, bool>,
    pub corrupted: Vec<CorruptedIndex>,
    pub orphans_removed: usize,
    pub recommendations: Vec<String>,
    pub checked_at: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OrphanCleanup {
    pub rows: usize,
    pub directories: usize,
}

impl OrphanCleanup {
    pub fn total(&self) -> usize {
        self.rows + self.directories
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryStats {
    pub analyses: u64,
    pub recoveries: u64,
    pub verifications: u64,
    pub reconciliations: u64,
    pub partial_repairs: u64,
    pub rebuilds: u64,
    pub failures: u64,
    pub orphans_removed: u64,
}

/// Grade `path` from its files alone.
///
/// `expected_count` is the persisted `chunk_count`, if known;
/// `repaired_before` feeds the drift check.
pub fn analyze_path(
    files: &FileManager,
    path: &Path,
    expected_count: Option<usize>,
    repaired_before: bool,
) -> CorruptionReport {
    let mut report = CorruptionReport::new(path);
    let inspection = files.inspect(path);

    if !inspection.dir_exists {
        report.raise(Severity::Critical, CorruptionType::MissingDirectory);
        report
            .recommendations
            .push("Index directory is gone; rebuild the index".to_string());
        return report;
    }

    for name in REQUIRED_FILES.iter().chain(std::iter::once(&METADATA_FILE)) {
        let primary = *name == PRIMARY_FILE;
        let optional = *name == METADATA_FILE;
        match inspection.status(name) {
            FileStatus::Ok => {}
            FileStatus::Missing if optional => {
                report.drift.push(format!("{} is missing", METADATA_FILE));
            }
            FileStatus::Missing => {
                report.missing_files.push(name.to_string());
                report.raise(Severity::Critical, CorruptionType::MissingFiles);
            }
            FileStatus::Empty => {
                report.empty_files.push(name.to_string());
                if primary {
                    report.raise(Severity::Critical, CorruptionType::EmptyFiles);
                } else {
                    report.raise(Severity::Moderate, CorruptionType::EmptyFiles);
                }
            }
            FileStatus::Unparseable(_) | FileStatus::MissingKeys(_) => {
                report.corrupted_files.push(name.to_string());
                if primary {
                    report.raise(Severity::Critical, CorruptionType::CorruptedFiles);
                } else {
                    report.raise(Severity::Moderate, CorruptionType::CorruptedFiles);
                }
            }
        }
    }

    report.actual_chunk_count = files.primary_chunk_count(path);

    if let Some(actual) = report.actual_chunk_count {
        if let Ok(meta) = artifact::read_json::<IndexMetadata>(&path.join(METADATA_FILE)) {
            if meta.chunk_count != actual {
                report.drift.push(format!(
                    "metadata records {} chunks but the primary holds {}",
                    meta.chunk_count, actual
                ));
            }
        }
        if let Some(expected) = expected_count {
            if expected != actual {
                report.drift.push(format!(
                    "store records {} chunks but the primary holds {}",
                    expected, actual
                ));
            }
        }
    }
    if repaired_before {
        report.drift.push("index was repaired before".to_string());
    }
    if !report.drift.is_empty() {
        report.raise(Severity::Light, CorruptionType::Drift);
    }

    match report.severity {
        Severity::Critical => report.recommendations.push(
            "Primary artifact or a required file is unusable; rebuild the index".to_string(),
        ),
        Severity::Moderate => report.recommendations.push(
            "Secondary artifacts are damaged; `dix recover` can regenerate them".to_string(),
        ),
        Severity::Light => report
            .recommendations
            .push("Run `dix recover` to reconcile chunk counts".to_string()),
        Severity::None => {}
    }
    report
}

pub struct RecoveryService {
    store: Arc<dyn MetadataStore>,
    files: FileManager,
    history: Mutex<VecDeque<RecoveryRecord>>,
    stats: Mutex<RecoveryStats>,
}

impl RecoveryService {
    pub fn new(store: Arc<dyn MetadataStore>, files: FileManager) -> Self {
        Self {
            store,
            files,
            history: Mutex::new(VecDeque::new()),
            stats: Mutex::new(RecoveryStats::default()),
        }
    }

    fn record_stat(&self, f: impl FnOnce(&mut RecoveryStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }

    fn remember(&self, entry: RecoveryRecord) {
        if let Ok(mut history) = self.history.lock() {
            if history.len() == HISTORY_LIMIT {
                history.pop_front();
            }
            history.push_back(entry);
        }
    }

    fn repaired_before(&self, path: &Path) -> bool {
        self.history
            .lock()
            .map(|h| {
                h.iter().any(|r| {
                    r.success
                        && r.path.as_deref() == Some(path)
                        && matches!(r.action, Some(RecoveryAction::PartialRepair))
                })
            })
            .unwrap_or(false)
    }

    /// Newest last.
    pub fn history(&self) -> Vec<RecoveryRecord> {
        self.history
            .lock()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> RecoveryStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Grade an index directory on a blocking worker thread.
    pub async fn analyze(
        &self,
        path: &Path,
        expected_count: Option<usize>,
    ) -> IndexResult<CorruptionReport> {
        self.record_stat(|s| s.analyses += 1);
        let files = self.files.clone();
        let path = path.to_path_buf();
        let repaired = self.repaired_before(&path);
        let report = tokio::task::spawn_blocking(move || {
            analyze_path(&files, &path, expected_count, repaired)
        })
        .await?;
        tracing::debug!(
            path = %report.path.display(),
            severity = %report.severity,
            "analyzed index"
        );
        Ok(report)
    }

    /// Regenerate the secondary artifacts from the primary and re-verify.
    pub async fn repair_partial(&self, path: &Path) -> IndexResult<usize> {
        let files = self.files.clone();
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let count = artifact::regenerate_secondaries(&path)?;
            if files.verify(&path) {
                Ok(count)
            } else {
                Err(IndexError::corruption(
                    &path,
                    "still fails verification after regenerating secondaries",
                ))
            }
        })
        .await?
    }

    /// Bring the persisted chunk count in line with the primary artifact.
    /// Returns whether anything changed.
    async fn reconcile(&self, record: &VectorIndex, actual: Option<usize>) -> IndexResult<bool> {
        match actual {
            Some(actual) if actual != record.chunk_count => {
                self.store
                    .update_chunk_count(record.document_id, actual)
                    .await?;
                tracing::info!(
                    document_id = record.document_id,
                    from = record.chunk_count,
                    to = actual,
                    "reconciled chunk count"
                );
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Repair the index of `document_id`.
    ///
    /// `rebuild` performs a full rebuild and returns the new record; it is
    /// called for critical damage, when `force_rebuild` is set, when there is
    /// no index record at all, and when a partial repair fails.
    pub async fn recover<F, Fut>(
        &self,
        document_id: i64,
        force_rebuild: bool,
        rebuild: F,
    ) -> IndexResult<RecoveryResult>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = IndexResult<VectorIndex>>,
    {
        let started = Instant::now();
        self.record_stat(|s| s.recoveries += 1);

        let record = self.store.get_vector_index(document_id).await?;
        let (before, report) = match &record {
            Some(r) => {
                let report = self.analyze(&r.index_path, Some(r.chunk_count)).await?;
                (report.severity, Some(report))
            }
            None => (Severity::Critical, None),
        };

        let outcome = self
            .apply(document_id, force_rebuild, record.as_ref(), report, rebuild)
            .await;

        let result = match outcome {
            Ok((action, new_record, message)) => {
                let after = self
                    .analyze(&new_record.index_path, Some(new_record.chunk_count))
                    .await?;
                // a repaired index is expected to report the repair as drift
                let success = after.severity <= Severity::Light;
                RecoveryResult {
                    document_id,
                    success,
                    action,
                    severity_before: before,
                    severity_after: after.severity,
                    chunk_count: new_record.chunk_count,
                    index_path: Some(new_record.index_path),
                    message,
                    duration: started.elapsed(),
                }
            }
            Err(e) => {
                self.record_stat(|s| s.failures += 1);
                self.remember(RecoveryRecord {
                    document_id,
                    path: record.as_ref().map(|r| r.index_path.clone()),
                    severity: before,
                    action: None,
                    success: false,
                    at: chrono::Utc::now().timestamp(),
                });
                tracing::warn!(document_id, severity = %before, error = %e, "recovery failed");
                return Err(e);
            }
        };

        if !result.success {
            self.record_stat(|s| s.failures += 1);
        }
        self.remember(RecoveryRecord {
            document_id,
            path: result.index_path.clone(),
            severity: before,
            action: Some(result.action),
            success: result.success,
            at: chrono::Utc::now().timestamp(),
        });
        tracing::info!(
            document_id,
            before = %before,
            after = %result.severity_after,
            action = ?result.action,
            "recovery finished"
        );
        Ok(result)
    }

    async fn apply<F, Fut>(
        &self,
        document_id: i64,
        force_rebuild: bool,
        record: Option<&VectorIndex>,
        report: Option<CorruptionReport>,
        rebuild: F,
    ) -> IndexResult<(RecoveryAction, VectorIndex, String)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = IndexResult<VectorIndex>>,
    {
        let (record, report) = match (record, report) {
            (Some(record), Some(report)) if !force_rebuild => (record, report),
            _ => {
                let reason = if force_rebuild {
                    "rebuild forced"
                } else {
                    "no index record"
                };
                tracing::info!(document_id, reason, "rebuilding index");
                let rebuilt = rebuild().await?;
                self.record_stat(|s| s.rebuilds += 1);
                return Ok((RecoveryAction::Rebuilt, rebuilt, reason.to_string()));
            }
        };

        match report.severity {
            Severity::Critical => {
                tracing::info!(document_id, "critical damage, rebuilding index");
                let rebuilt = rebuild().await?;
                self.record_stat(|s| s.rebuilds += 1);
                Ok((
                    RecoveryAction::Rebuilt,
                    rebuilt,
                    "critical damage, index rebuilt".to_string(),
                ))
            }
            Severity::Moderate => match self.repair_partial(&record.index_path).await {
                Ok(count) => {
                    self.record_stat(|s| s.partial_repairs += 1);
                    self.reconcile(record, Some(count)).await?;
                    let mut repaired = record.clone();
                    repaired.chunk_count = count;
                    Ok((
                        RecoveryAction::PartialRepair,
                        repaired,
                        format!(
                            "regenerated {} secondary artifacts",
                            report.empty_files.len() + report.corrupted_files.len()
                        ),
                    ))
                }
                Err(e) => {
                    tracing::warn!(document_id, error = %e, "partial repair failed, rebuilding");
                    let rebuilt = rebuild().await?;
                    self.record_stat(|s| s.rebuilds += 1);
                    Ok((
                        RecoveryAction::Rebuilt,
                        rebuilt,
                        format!("partial repair failed ({}), index rebuilt", e),
                    ))
                }
            },
            Severity::Light | Severity::None => {
                self.record_stat(|s| s.verifications += 1);
                let changed = self.reconcile(record, report.actual_chunk_count).await?;
                let mut current = record.clone();
                if changed {
                    self.record_stat(|s| s.reconciliations += 1);
                    current.chunk_count = report.actual_chunk_count.unwrap_or(current.chunk_count);
                    Ok((
                        RecoveryAction::Reconciled,
                        current,
                        "chunk count reconciled".to_string(),
                    ))
                } else {
                    Ok((RecoveryAction::Verified, current, "index verified".to_string()))
                }
            }
        }
    }

    /// Every index whose severity is moderate or worse.
    pub async fn find_corrupted(&self) -> IndexResult<Vec<CorruptedIndex>> {
        let mut corrupted = Vec::new();
        for record in self.store.list_vector_indexes().await? {
            let report = self
                .analyze(&record.index_path, Some(record.chunk_count))
                .await?;
            if report.is_corrupted() {
                corrupted.push(CorruptedIndex {
                    document_id: record.document_id,
                    path: record.index_path,
                    severity: report.severity,
                });
            }
        }
        Ok(corrupted)
    }

    /// Remove index rows without a document, then index directories without
    /// a row.
    pub async fn cleanup_orphans(&self) -> IndexResult<OrphanCleanup> {
        let rows = self.store.remove_orphan_indexes().await?;
        let valid: Vec<PathBuf> = self
            .store
            .list_vector_indexes()
            .await?
            .into_iter()
            .map(|r| r.index_path)
            .collect();

        let files = self.files.clone();
        let directories = tokio::task::spawn_blocking(move || {
            let orphans = files.find_orphans(&valid);
            files.cleanup_orphans(&orphans)
        })
        .await?;

        let cleanup = OrphanCleanup { rows, directories };
        self.record_stat(|s| s.orphans_removed += cleanup.total() as u64);
        if cleanup.total() > 0 {
            tracing::info!(rows, directories, "orphans removed");
        }
        Ok(cleanup)
    }

    /// Run the probes, sweep for corruption, and clean up orphans.
    pub async fn system_health(&self, checker: &HealthChecker) -> IndexResult<HealthReport> {
        let checks = checker.run_all().await;
        let mut status = HealthStatus::Healthy;
        let mut recommendations = Vec::new();

        for (name, ok) in &checks {
            if *ok {
                continue;
            }
            if CRITICAL_PROBES.contains(&name.as_str()) {
                status = status.max(HealthStatus::Critical);
            } else {
                status = status.max(HealthStatus::Degraded);
            }
            recommendations.push(probe_recommendation(name));
        }

        let corrupted = self.find_corrupted().await?;
        if !corrupted.is_empty() {
            status = status.max(HealthStatus::Degraded);
            for c in &corrupted {
                recommendations.push(format!(
                    "Run `dix recover {}` ({} damage)",
                    c.document_id, c.severity
                ));
            }
        }

        let orphans = self.cleanup_orphans().await?;

        Ok(HealthReport {
            status,
            checks,
            corrupted,
            orphans_removed: orphans.total(),
            recommendations,
            checked_at: chrono::Utc::now().timestamp(),
        })
    }
}

fn probe_recommendation(name: &str) -> String {
    match name {
        "storage" => "Storage root is not writable; check storage.root and permissions".to_string(),
        "metadata_store" => "Metadata database is unreachable; check db.path".to_string(),
        "resource_headroom" => {
            "Index storage is near its quota; remove old indexes or raise storage.max_total_bytes"
                .to_string()
        }
        other if other.starts_with("circuit_") => format!(
            "Provider breaker '{}' is open; check provider connectivity",
            other.trim_start_matches("circuit_")
        ),
        other => format!("Health probe '{}' failed", other),
    }
}
