//! Error types for xcp
//!
//! This module defines all error types used throughout the crate, so that
//! callers can tell a malformed address from a missing object from a
//! transport failure without parsing messages.

use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Main error type for xcp operations
#[derive(Error, Debug, Clone)]
pub enum XcpError {
    /// The address string could not be parsed
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The glob filter could not be compiled
    #[error("Invalid filter pattern '{pattern}': {message}")]
    Filter { pattern: String, message: String },

    /// File or object not found
    #[error("Path not found: {0}")]
    NotFound(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// I/O error during read, write or enumerate
    #[error("I/O error at '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: Arc<io::Error>,
    },

    /// Object store request failed
    #[error("Remote storage error at '{key}': {message}")]
    Remote { key: String, message: String },

    /// No backend is registered for this scheme
    #[error("Unsupported storage scheme: {0}")]
    UnsupportedScheme(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Operation cancelled by user
    #[error("Operation cancelled")]
    Cancelled,

    /// A transfer worker panicked
    #[error("Worker pool error: {0}")]
    WorkerPool(String),

    /// Multiple errors occurred
    #[error("Multiple errors occurred ({count} errors)")]
    MultipleErrors { count: usize, errors: Vec<XcpError> },

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<XcpError>,
    },
}

impl XcpError {
    /// Create an error from an I/O failure, keeping the not-found and
    /// permission cases distinguishable.
    pub fn io(path: impl Into<String>, source: io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            io::ErrorKind::NotFound => Self::NotFound(path),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(path),
            _ => Self::Io {
                path,
                source: Arc::new(source),
            },
        }
    }

    /// Create an invalid URL error
    pub fn invalid_url(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Create a remote storage error
    pub fn remote(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Remote {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError(message.into())
    }

    /// Check if this error is recoverable (can be retried)
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { .. } | Self::Remote { .. } => true,
            Self::WithContext { source, .. } => source.is_recoverable(),
            _ => false,
        }
    }

    /// Check if this error is a permission issue
    pub fn is_permission_error(&self) -> bool {
        match self {
            Self::PermissionDenied(_) => true,
            Self::Io { source, .. } => source.kind() == io::ErrorKind::PermissionDenied,
            Self::WithContext { source, .. } => source.is_permission_error(),
            _ => false,
        }
    }

    /// Check if this error reports a missing file or object
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::WithContext { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// Get the path or key associated with this error, if any
    pub fn path(&self) -> Option<&str> {
        match self {
            Self::Io { path, .. } | Self::NotFound(path) | Self::PermissionDenied(path) => {
                Some(path)
            }
            Self::Remote { key, .. } => Some(key),
            Self::WithContext { source, .. } => source.path(),
            _ => None,
        }
    }
}

/// Result type alias for xcp operations
pub type Result<T> = std::result::Result<T, XcpError>;

impl From<io::Error> for XcpError {
    fn from(err: io::Error) -> Self {
        XcpError::io(String::new(), err)
    }
}

impl From<serde_json::Error> for XcpError {
    fn from(err: serde_json::Error) -> Self {
        XcpError::ConfigError(err.to_string())
    }
}

/// Extension trait for adding path context to std::io::Result
pub trait IoResultExt<T> {
    /// Add path context to an I/O error
    fn with_path(self, path: impl Into<String>) -> Result<T>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn with_path(self, path: impl Into<String>) -> Result<T> {
        self.map_err(|e| XcpError::io(path, e))
    }
}

/// Folds a list of errors into one representative error.
///
/// Returns `None` for an empty list, the error itself for a single one,
/// and `MultipleErrors` otherwise.
pub fn join_errors(mut errors: Vec<XcpError>) -> Option<XcpError> {
    match errors.len() {
        0 => None,
        1 => errors.pop(),
        count => Some(XcpError::MultipleErrors { count, errors }),
    }
}

/// Collects multiple results into a single result
pub fn collect_errors<T>(results: Vec<Result<T>>) -> Result<Vec<T>> {
    let mut successes = Vec::new();
    let mut errors = Vec::new();

    for result in results {
        match result {
            Ok(value) => successes.push(value),
            Err(e) => errors.push(e),
        }
    }

    match join_errors(errors) {
        None => Ok(successes),
        Some(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_classification() {
        let err = XcpError::io("/a/b", io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert!(matches!(err, XcpError::NotFound(ref p) if p == "/a/b"));

        let err = XcpError::io("/a/b", io::Error::new(io::ErrorKind::PermissionDenied, "no"));
        assert!(err.is_permission_error());

        let err = XcpError::io("/a/b", io::Error::new(io::ErrorKind::Other, "disk"));
        assert!(matches!(err, XcpError::Io { .. }));
        assert_eq!(err.path(), Some("/a/b"));
    }

    #[test]
    fn test_cloned_io_error_keeps_source() {
        let err = XcpError::io("/a/b", io::Error::new(io::ErrorKind::Other, "disk"));
        let copy = err.clone();
        assert_eq!(copy.to_string(), err.to_string());
        match copy {
            XcpError::Io { source, .. } => assert_eq!(source.kind(), io::ErrorKind::Other),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_error_recoverability() {
        assert!(XcpError::remote("k", "timeout").is_recoverable());
        assert!(!XcpError::NotFound("k".into()).is_recoverable());
        assert!(!XcpError::PermissionDenied("k".into()).is_recoverable());
        assert!(XcpError::remote("k", "reset")
            .with_context("upload")
            .is_recoverable());
    }

    #[test]
    fn test_context_keeps_path() {
        let err = XcpError::NotFound("bucket/key".into()).with_context("reading");
        assert!(err.is_not_found());
        assert_eq!(err.path(), Some("bucket/key"));
        assert_eq!(err.to_string(), "reading: Path not found: bucket/key");
    }

    #[test]
    fn test_collect_errors() {
        let results: Vec<Result<i32>> = vec![Ok(1), Ok(2), Ok(3)];
        assert_eq!(collect_errors(results).unwrap(), vec![1, 2, 3]);

        let results: Vec<Result<i32>> = vec![
            Ok(1),
            Err(XcpError::Cancelled),
            Err(XcpError::NotFound("x".into())),
        ];
        match collect_errors(results) {
            Err(XcpError::MultipleErrors { count, .. }) => assert_eq!(count, 2),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_join_single_error() {
        assert!(join_errors(Vec::new()).is_none());
        let err = join_errors(vec![XcpError::Cancelled]).unwrap();
        assert!(matches!(err, XcpError::Cancelled));
    }
}
