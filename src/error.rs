//! Error taxonomy for the sync engine
//!
//! Client-side operations return [`SyncError`]. Each variant falls into one
//! [`ErrorCategory`], which decides whether a batch keeps going (skip the
//! asset, log, continue) or the invoking command has to stop.

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the client half of the crate
pub type Result<T> = std::result::Result<T, SyncError>;

/// Main error type for client-side sync operations
#[derive(Debug, Error)]
pub enum SyncError {
    /// Asset or machine missing, or not owned by the caller
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed input, rejected before anything was mutated
    #[error("invalid input: {0}")]
    Validation(String),

    /// A version string that is not `MAJOR.MINOR.PATCH`
    #[error("invalid version: {0}")]
    InvalidVersion(String),

    /// Transport failure talking to the version authority
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The version authority answered with a non-success status
    #[error("server rejected request ({status}): {message}")]
    Remote { status: u16, message: String },

    /// Local filesystem failure while reading or writing an asset file
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The link registry could not be persisted
    #[error("failed to write link registry {path:?}: {source}")]
    RegistryWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File watcher backend failure
    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),

    /// Missing or unusable client configuration
    #[error("configuration error: {0}")]
    Config(String),
}

/// Categorized error types for per-asset handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Asset/machine missing or not owned; skip with a warning
    NotFound,

    /// Malformed input; rejected before mutation
    Validation,

    /// Network failure; the next cycle tries again
    Transient,

    /// Local file trouble on a single asset
    LocalFilesystem,

    /// Registry write failures and unusable configuration
    Fatal,
}

impl ErrorCategory {
    /// Whether a batch command must stop instead of moving to the next asset
    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorCategory::Fatal)
    }
}

impl SyncError {
    /// Categorize this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            SyncError::NotFound(_) => ErrorCategory::NotFound,
            SyncError::Validation(_) | SyncError::InvalidVersion(_) | SyncError::Json(_) => {
                ErrorCategory::Validation
            }
            SyncError::Network(_) => ErrorCategory::Transient,
            SyncError::Remote { status, .. } if *status >= 500 || *status == 429 => {
                ErrorCategory::Transient
            }
            SyncError::Remote { status, .. } if *status == 404 => ErrorCategory::NotFound,
            SyncError::Remote { .. } => ErrorCategory::Validation,
            SyncError::Io(_) | SyncError::Watch(_) => ErrorCategory::LocalFilesystem,
            SyncError::RegistryWrite { .. } | SyncError::Config(_) => ErrorCategory::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.category().is_fatal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categorization() {
        assert_eq!(
            SyncError::NotFound("asset a".into()).category(),
            ErrorCategory::NotFound
        );
        assert_eq!(
            SyncError::InvalidVersion("1.0".into()).category(),
            ErrorCategory::Validation
        );
        assert_eq!(
            SyncError::Remote {
                status: 503,
                message: "busy".into()
            }
            .category(),
            ErrorCategory::Transient
        );
        assert_eq!(
            SyncError::Remote {
                status: 404,
                message: "gone".into()
            }
            .category(),
            ErrorCategory::NotFound
        );
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        assert_eq!(SyncError::Io(io).category(), ErrorCategory::LocalFilesystem);
    }

    #[test]
    fn test_only_registry_and_config_are_fatal() {
        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert!(SyncError::RegistryWrite {
            path: PathBuf::from("/tmp/config.json"),
            source: denied,
        }
        .is_fatal());
        assert!(SyncError::Config("no machine".into()).is_fatal());
        assert!(!SyncError::NotFound("x".into()).is_fatal());
    }
}
