//! # Shared Cache
//!
//! Versioned, watchable store for the last-known-good snapshot. Every replica
//! reads it and subscribes to it; only the leader's Bridge writes it.
//!
//! Writes are optimistic: the caller passes the version it last read, and a
//! write against any other version fails with [`CacheError::Conflict`]. Change
//! notifications coalesce, so a subscriber may skip intermediate versions and
//! must always re-read the current state rather than trust the notification.

pub mod configmap;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;

use crate::domain::{KeySet, RotationState};

pub use configmap::ConfigMapCache;
pub use memory::MemoryCache;

/// Opaque optimistic-concurrency token of a cache entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheVersion(String);

impl CacheVersion {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Last committed upstream observation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub rotation: RotationState,
    pub fetched_at: DateTime<Utc>,
    pub issuer: String,
}

impl CacheSnapshot {
    /// Keys every replica publishes for this snapshot
    pub fn published(&self) -> KeySet {
        self.rotation.published()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CacheError> {
        serde_json::to_vec(self).map_err(CacheError::from)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CacheError> {
        serde_json::from_slice(bytes).map_err(CacheError::from)
    }
}

/// A snapshot together with the version it was read at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedSnapshot {
    pub snapshot: CacheSnapshot,
    pub version: CacheVersion,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    /// Someone else wrote since our read; re-read before deriving anything new
    #[error("cache write conflict: expected version {}", .expected.as_ref().map_or("<absent>", |v| v.as_str()))]
    Conflict { expected: Option<CacheVersion> },

    #[error("cache backend error: {message}")]
    Backend { message: String },

    #[error("cache entry could not be decoded: {message}")]
    Serialization { message: String },
}

impl CacheError {
    pub fn backend<S: Into<String>>(message: S) -> Self {
        Self::Backend { message: message.into() }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization { message: error.to_string() }
    }
}

#[async_trait]
pub trait SharedCache: Send + Sync + fmt::Debug {
    /// Current snapshot, or `None` before the first commit
    async fn read(&self) -> Result<Option<VersionedSnapshot>, CacheError>;

    /// Commit `snapshot` if the entry is still at `expected` (`None` = absent)
    async fn write(
        &self,
        snapshot: &CacheSnapshot,
        expected: Option<&CacheVersion>,
    ) -> Result<CacheVersion, CacheError>;

    /// Latest-value change channel; holds the most recently observed version
    fn subscribe(&self) -> watch::Receiver<Option<CacheVersion>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn snapshot_round_trips() {
        let snapshot = CacheSnapshot {
            rotation: RotationState::new(Duration::from_secs(60)),
            fetched_at: Utc::now(),
            issuer: "https://oidc.example.com".to_string(),
        };
        let bytes = snapshot.to_bytes().unwrap();
        assert_eq!(CacheSnapshot::from_slice(&bytes).unwrap(), snapshot);
    }

    #[test]
    fn conflict_display_names_expected_version() {
        let err = CacheError::Conflict { expected: Some(CacheVersion::new("17")) };
        assert_eq!(err.to_string(), "cache write conflict: expected version 17");
        let err = CacheError::Conflict { expected: None };
        assert!(err.to_string().contains("<absent>"));
        assert!(err.is_conflict());
    }
}
