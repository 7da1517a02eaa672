//! Storage error types
//!
//! Every provider maps its native failures onto [`StorageError`]. A lost
//! conditional-write race is not an error: it is reported as
//! [`WriteOutcome::PreconditionFailed`](super::WriteOutcome::PreconditionFailed).

use std::sync::Arc;
use std::time::Duration;

/// A boxed error type for source chain tracking
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    /// Network failure, server-side error or throttling. Retried with backoff.
    #[error("Transient storage error: {message}")]
    Transient {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// An attempt did not finish within its deadline. Retried with backoff.
    #[error("Storage operation timed out after {}ms", .after.as_millis())]
    Timeout { after: Duration },

    /// Credentials or ACL rejected. Never retried.
    #[error("Permission denied: {message}")]
    PermissionDenied { message: String },

    #[error("Invalid object path '{path}'")]
    InvalidPath { path: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Storage configuration error: {message}")]
    Config { message: String },

    /// Unexpected provider response that retrying will not fix
    #[error("Internal storage error: {message}")]
    Internal { message: String },
}

impl StorageError {
    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self::Transient { message: message.into(), source: None }
    }

    pub fn transient_with_source<S, E>(message: S, source: E) -> Self
    where
        S: Into<String>,
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Transient { message: message.into(), source: Some(Arc::new(source)) }
    }

    pub fn permission_denied<S: Into<String>>(message: S) -> Self {
        Self::PermissionDenied { message: message.into() }
    }

    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config { message: message.into() }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Classify a non-success HTTP status from an object store REST API
    pub fn from_status(status: u16, context: &str, body: &str) -> Self {
        let message = if body.is_empty() {
            format!("{context}: HTTP {status}")
        } else {
            format!("{context}: HTTP {status}: {}", truncate(body, 256))
        };

        match status {
            401 | 403 => Self::PermissionDenied { message },
            408 | 429 | 500..=599 => Self::Transient { message, source: None },
            _ => Self::Internal { message },
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Timeout { .. })
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::PermissionDenied { .. })
    }
}

impl From<reqwest::Error> for StorageError {
    fn from(error: reqwest::Error) -> Self {
        match error.status() {
            Some(status) => Self::from_status(status.as_u16(), "request failed", ""),
            None if error.is_decode() => Self::Serialization { message: error.to_string() },
            None => Self::transient_with_source("request failed", error),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization { message: error.to_string() }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(StorageError::from_status(403, "put", "").is_permission_denied());
        assert!(StorageError::from_status(401, "put", "").is_permission_denied());
        assert!(StorageError::from_status(503, "put", "").is_retryable());
        assert!(StorageError::from_status(429, "put", "").is_retryable());
        assert!(!StorageError::from_status(400, "put", "").is_retryable());
        assert!(!StorageError::from_status(403, "put", "").is_retryable());
    }

    #[test]
    fn timeout_is_retryable() {
        let error = StorageError::Timeout { after: Duration::from_millis(1500) };
        assert!(error.is_retryable());
        assert_eq!(error.to_string(), "Storage operation timed out after 1500ms");
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "x".repeat(1000);
        let error = StorageError::from_status(500, "get", &body);
        assert!(error.to_string().len() < 400);
    }
}
