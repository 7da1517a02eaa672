//! # Error Types
//!
//! Crate-wide error type for the OIDC bridge using `thiserror`.

use crate::cache::CacheError;
use crate::storage::StorageError;
use crate::upstream::UpstreamError;

/// Custom result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Main error type for the OIDC bridge
#[derive(thiserror::Error, Debug)]
pub enum BridgeError {
    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Validation errors
    #[error("Validation error: {message}")]
    Validation { message: String, field: Option<String> },

    /// Upstream discovery/JWKS fetch failed or returned a malformed document
    #[error("Upstream fetch failed: {source}")]
    UpstreamFetch {
        #[from]
        source: UpstreamError,
    },

    /// Configured public base URL does not match the upstream issuer claim
    #[error("Issuer mismatch: configured '{configured}' but upstream advertises '{upstream}'")]
    IssuerMismatch { configured: String, upstream: String },

    /// Object storage errors that are not permission faults
    #[error("Storage error on '{path}': {source}")]
    Storage {
        path: String,
        #[source]
        source: StorageError,
    },

    /// Object storage rejected our credentials or ACL
    #[error("Permission denied writing '{path}': {message}")]
    PermissionDenied { path: String, message: String },

    /// Shared cache errors
    #[error("Shared cache error: {0}")]
    Cache(#[from] CacheError),

    /// Leadership flipped while a leader-only cycle was in flight
    #[error("Leadership lost during {operation}")]
    LeaderLost { operation: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {context}")]
    Serialization {
        #[source]
        source: serde_json::Error,
        context: String,
    },

    /// Kubernetes client construction errors
    #[error("Kubernetes client error: {0}")]
    Kubernetes(#[from] kube::Error),

    /// I/O errors with additional context
    #[error("I/O error: {context}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },

    /// Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl BridgeError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config { message: message.into(), source: None }
    }

    /// Create a configuration error with source
    pub fn config_with_source<S: Into<String>>(
        message: S,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::Config { message: message.into(), source: Some(source) }
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation { message: message.into(), field: None }
    }

    /// Create a validation error with field information
    pub fn validation_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Validation { message: message.into(), field: Some(field.into()) }
    }

    /// Create an issuer mismatch error
    pub fn issuer_mismatch<C: Into<String>, U: Into<String>>(configured: C, upstream: U) -> Self {
        Self::IssuerMismatch { configured: configured.into(), upstream: upstream.into() }
    }

    /// Classify a storage error for a path; permission faults get their own kind
    pub fn storage<P: Into<String>>(path: P, source: StorageError) -> Self {
        let path = path.into();
        match source {
            StorageError::PermissionDenied { message } => Self::PermissionDenied { path, message },
            source => Self::Storage { path, source },
        }
    }

    /// Create a leader-lost error
    pub fn leader_lost<S: Into<String>>(operation: S) -> Self {
        Self::LeaderLost { operation: operation.into() }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Operator-facing hard failures: these need a configuration change, not a retry
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::PermissionDenied { .. }
                | BridgeError::IssuerMismatch { .. }
                | BridgeError::Config { .. }
                | BridgeError::Validation { .. }
        )
    }

    /// Check if this error should be retried within the current cycle
    pub fn is_retryable(&self) -> bool {
        match self {
            BridgeError::Storage { source, .. } => source.is_retryable(),
            BridgeError::UpstreamFetch { source } => source.is_retryable(),
            BridgeError::Io { .. } => true,
            _ => false,
        }
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(error: std::io::Error) -> Self {
        Self::Io { source: error, context: "I/O operation failed".to_string() }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization { source: error, context: "JSON serialization failed".to_string() }
    }
}

impl From<validator::ValidationErrors> for BridgeError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let mut fields: Vec<String> = errors
            .field_errors()
            .iter()
            .map(|(field, field_errors)| {
                let error_messages: Vec<String> = field_errors
                    .iter()
                    .map(|e| {
                        e.message.as_ref().map_or("Invalid value".to_string(), |m| m.to_string())
                    })
                    .collect();
                format!("{}: {}", field, error_messages.join(", "))
            })
            .collect();
        fields.sort();

        Self::validation(format!("Validation failed: {}", fields.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = BridgeError::config("Test configuration error");
        assert!(matches!(error, BridgeError::Config { .. }));
        assert_eq!(error.to_string(), "Configuration error: Test configuration error");
    }

    #[test]
    fn test_validation_error() {
        let error = BridgeError::validation_field("Invalid cluster id", "cluster_id");
        if let BridgeError::Validation { field, .. } = error {
            assert_eq!(field, Some("cluster_id".to_string()));
        } else {
            panic!("expected validation error");
        }
    }

    #[test]
    fn test_storage_permission_denied_is_promoted() {
        let error = BridgeError::storage(
            "openid/v1/jwks",
            StorageError::PermissionDenied { message: "403 Forbidden".into() },
        );
        assert!(matches!(error, BridgeError::PermissionDenied { .. }));
        assert!(error.is_fatal());
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_transient_storage_is_retryable() {
        let error = BridgeError::storage("openid/v1/jwks", StorageError::transient("503"));
        assert!(error.is_retryable());
        assert!(!error.is_fatal());
    }

    #[test]
    fn test_issuer_mismatch_display() {
        let error = BridgeError::issuer_mismatch("https://a.example/", "https://a.example");
        assert!(error.is_fatal());
        assert!(error.to_string().contains("'https://a.example/'"));
        assert!(error.to_string().contains("'https://a.example'"));
    }

    #[test]
    fn test_error_conversions() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let bridge_error: BridgeError = io_error.into();
        assert!(matches!(bridge_error, BridgeError::Io { .. }));

        let json_error = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let bridge_error: BridgeError = json_error.into();
        assert!(matches!(bridge_error, BridgeError::Serialization { .. }));
    }
}
