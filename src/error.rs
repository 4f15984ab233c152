//! Error taxonomy for the index lifecycle.
//!
//! Every service returns [`IndexResult`]. Errors are classified by
//! [`ErrorKind`] rather than by message text, and each kind carries a
//! retryable flag consulted by [`crate::resilience::Retry`].

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Result alias used throughout the library.
pub type IndexResult<T> = Result<T, IndexError>;

/// Coarse classification of an [`IndexError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    AlreadyExists,
    Provider,
    Storage,
    Corruption,
    IndexLoad,
    QueryExecution,
    IndexCreation,
    CircuitOpen,
    RetryExhausted,
    Cancelled,
    NotFound,
    Metadata,
    Processing,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::Provider => "provider",
            ErrorKind::Storage => "storage",
            ErrorKind::Corruption => "corruption",
            ErrorKind::IndexLoad => "index_load",
            ErrorKind::QueryExecution => "query_execution",
            ErrorKind::IndexCreation => "index_creation",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::RetryExhausted => "retry_exhausted",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Metadata => "metadata",
            ErrorKind::Processing => "processing",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured outcome of a precondition check.
///
/// Errors make the report invalid; warnings are informational only
/// (e.g. a very large input file).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub recommendations: Vec<String>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn error(&mut self, msg: impl Into<String>, recommendation: impl Into<String>) {
        self.errors.push(msg.into());
        self.recommendations.push(recommendation.into());
    }

    pub fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Convert into `Err(IndexError::Validation)` when any error was recorded.
    pub fn into_result(self) -> IndexResult<ValidationReport> {
        if self.is_valid() {
            Ok(self)
        } else {
            Err(IndexError::Validation(self))
        }
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() {
            return f.write_str("ok");
        }
        f.write_str(&self.errors.join("; "))
    }
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("validation failed: {0}")]
    Validation(ValidationReport),

    #[error("index already exists at {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("provider error: {message}")]
    Provider { message: String, retryable: bool },

    #[error("storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("index corrupted at {}: {reason}", path.display())]
    Corruption { path: PathBuf, reason: String },

    #[error("failed to load index for document {document_id}: {reason}")]
    IndexLoad { document_id: i64, reason: String },

    #[error("query failed for document {document_id}: {reason}")]
    QueryExecution { document_id: i64, reason: String },

    #[error("index creation failed: {0}")]
    IndexCreation(String),

    #[error("circuit '{name}' is open, next probe in {remaining:?}")]
    CircuitOpen { name: String, remaining: Duration },

    #[error("gave up after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: Box<IndexError> },

    #[error("operation cancelled")]
    Cancelled,

    #[error("document {0} not found")]
    DocumentNotFound(i64),

    #[error("metadata store error: {0}")]
    Metadata(String),

    #[error("document processing failed: {0}")]
    Processing(String),
}

impl IndexError {
    pub fn provider(msg: impl Into<String>, retryable: bool) -> Self {
        Self::Provider {
            message: msg.into(),
            retryable,
        }
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage {
            message: msg.into(),
            source: None,
        }
    }

    pub fn storage_io(msg: impl Into<String>, source: std::io::Error) -> Self {
        Self::Storage {
            message: msg.into(),
            source: Some(source),
        }
    }

    pub fn corruption(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Corruption {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            IndexError::Validation(_) => ErrorKind::Validation,
            IndexError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            IndexError::Provider { .. } => ErrorKind::Provider,
            IndexError::Storage { .. } => ErrorKind::Storage,
            IndexError::Corruption { .. } => ErrorKind::Corruption,
            IndexError::IndexLoad { .. } => ErrorKind::IndexLoad,
            IndexError::QueryExecution { .. } => ErrorKind::QueryExecution,
            IndexError::IndexCreation(_) => ErrorKind::IndexCreation,
            IndexError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            IndexError::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            IndexError::Cancelled => ErrorKind::Cancelled,
            IndexError::DocumentNotFound(_) => ErrorKind::NotFound,
            IndexError::Metadata(_) => ErrorKind::Metadata,
            IndexError::Processing(_) => ErrorKind::Processing,
        }
    }

    /// Only provider failures flagged transient are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IndexError::Provider {
                retryable: true,
                ..
            }
        )
    }

    /// Failures that say something about the upstream service rather than
    /// about one document. Only these count against a circuit breaker.
    pub fn trips_breaker(&self) -> bool {
        matches!(self.kind(), ErrorKind::Provider | ErrorKind::RetryExhausted)
    }

    /// The innermost error, unwrapping retry exhaustion.
    pub fn root(&self) -> &IndexError {
        match self {
            IndexError::RetryExhausted { last, .. } => last.root(),
            other => other,
        }
    }

    /// Operator-facing next actions for this failure.
    pub fn recommendations(&self) -> Vec<String> {
        match self {
            IndexError::Validation(report) => report.recommendations.clone(),
            IndexError::AlreadyExists(_) => {
                vec!["Pass --overwrite or use `dix rebuild` to replace the index".to_string()]
            }
            IndexError::Storage { .. } => vec![
                "Check that the storage root exists and is writable".to_string(),
                "Check free disk space".to_string(),
            ],
            IndexError::Corruption { .. } => vec![
                "Run `dix verify <document-id>` to see the damage".to_string(),
                "Run `dix recover <document-id>` to repair or rebuild".to_string(),
            ],
            IndexError::IndexLoad { .. } => {
                vec!["Build the index first with `dix build <file>`".to_string()]
            }
            IndexError::CircuitOpen { .. } => {
                vec!["The provider is failing; wait for the cooldown and retry".to_string()]
            }
            IndexError::RetryExhausted { last, .. } => last.recommendations(),
            IndexError::Provider { .. } => {
                vec!["Check provider credentials and network connectivity".to_string()]
            }
            _ => Vec::new(),
        }
    }
}

impl From<sqlx::Error> for IndexError {
    fn from(err: sqlx::Error) -> Self {
        IndexError::Metadata(err.to_string())
    }
}

impl From<std::io::Error> for IndexError {
    fn from(err: std::io::Error) -> Self {
        IndexError::storage_io("I/O failure", err)
    }
}

impl From<tokio::task::JoinError> for IndexError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            IndexError::Cancelled
        } else {
            IndexError::storage(format!("worker task panicked: {}", err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_provider_errors_retry() {
        assert!(IndexError::provider("429", true).is_retryable());
        assert!(!IndexError::provider("401", false).is_retryable());
        assert!(!IndexError::Cancelled.is_retryable());
        assert!(!IndexError::storage("disk full").is_retryable());
        assert!(!IndexError::Validation(ValidationReport::new()).is_retryable());
    }

    #[test]
    fn test_root_unwraps_exhaustion() {
        let err = IndexError::RetryExhausted {
            attempts: 3,
            last: Box::new(IndexError::provider("timeout", true)),
        };
        assert_eq!(err.kind(), ErrorKind::RetryExhausted);
        assert_eq!(err.root().kind(), ErrorKind::Provider);
        assert!(err.to_string().contains("3 attempts"));
    }

    #[test]
    fn test_validation_report() {
        let mut report = ValidationReport::new();
        report.warn("file is large");
        assert!(report.is_valid());
        assert!(report.clone().into_result().is_ok());

        report.error("file is empty", "Provide a non-empty document");
        let err = report.into_result().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.recommendations(), vec!["Provide a non-empty document"]);
        assert!(err.to_string().contains("file is empty"));
    }

    #[test]
    fn test_io_error_maps_to_storage() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: IndexError = io.into();
        assert_eq!(err.kind(), ErrorKind::Storage);
        assert!(!err.recommendations().is_empty());
    }

    #[test]
    fn test_storage_io_keeps_source_out_of_message() {
        use std::error::Error as _;

        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err = IndexError::storage_io("read /idx/vector_store.json", io);
        assert_eq!(err.to_string(), "storage error: read /idx/vector_store.json");
        assert_eq!(err.source().map(|s| s.to_string()).as_deref(), Some("no such file"));

        let chained = format!("{:#}", anyhow::Error::new(err));
        assert_eq!(chained.matches("no such file").count(), 1);
    }

    #[test]
    fn test_only_upstream_failures_trip_breakers() {
        assert!(IndexError::provider("401", false).trips_breaker());
        assert!(IndexError::RetryExhausted {
            attempts: 2,
            last: Box::new(IndexError::provider("timeout", true)),
        }
        .trips_breaker());
        assert!(!IndexError::corruption("/idx", "bad").trips_breaker());
        assert!(!IndexError::Cancelled.trips_breaker());
        assert!(!IndexError::storage("gone").trips_breaker());
    }
}
