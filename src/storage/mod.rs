//! # Object Storage
//!
//! Conditional-read/conditional-write abstraction over the object stores the
//! published documents live in.
//!
//! A write succeeds if and only if the object's current version equals the
//! supplied precondition, or the object does not exist and
//! [`Precondition::Absent`] was supplied. Anything else is reported as
//! [`WriteOutcome::PreconditionFailed`], which callers treat as "another
//! writer got there first", never as an error.
//!
//! The provider is chosen once at startup ([`ObjectStore::from_config`]);
//! services are generic over [`StorageBackend`] and never branch on the
//! provider themselves.

pub mod conformance;
pub mod error;
pub mod memory;
pub mod retry;

#[cfg(feature = "azure")]
pub mod azure;
#[cfg(feature = "gcs")]
pub mod gcs;
#[cfg(feature = "s3")]
pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::config::StorageConfig;

pub use error::{StorageError, StorageResult};
pub use memory::MemoryBackend;
pub use retry::{ConditionalWriter, PublishOutcome, RetryConfig};

/// Opaque provider version token (generation number, ETag, ...)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectVersion(String);

impl ObjectVersion {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Object contents together with the version they were read at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub bytes: Bytes,
    pub version: ObjectVersion,
}

/// Expected state of the object for a conditional write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// The object must not exist yet
    Absent,
    /// The object must still be at this version
    Matches(ObjectVersion),
}

impl Precondition {
    /// Precondition matching what a preceding read observed
    pub fn from_current(current: Option<&StoredObject>) -> Self {
        match current {
            Some(object) => Self::Matches(object.version.clone()),
            None => Self::Absent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Written(ObjectVersion),
    /// The object changed since it was read; someone else won the race
    PreconditionFailed,
}

/// Supported storage providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackendType {
    /// In-process store, for development and tests
    Memory,
    /// Google Cloud Storage JSON API
    Gcs,
    /// Amazon S3 or an S3-compatible store
    S3,
    /// Azure Blob Storage
    Azure,
}

impl StorageBackendType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Gcs => "gcs",
            Self::S3 => "s3",
            Self::Azure => "azure",
        }
    }
}

impl FromStr for StorageBackendType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "gcs" => Ok(Self::Gcs),
            "s3" => Ok(Self::S3),
            "azure" => Ok(Self::Azure),
            _ => Err(format!("Unknown storage backend type: {}", s)),
        }
    }
}

impl fmt::Display for StorageBackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Trait for object storage providers
///
/// Implementations must be Send + Sync for use in async contexts. Paths are
/// relative object names without a leading slash.
#[async_trait]
pub trait StorageBackend: Send + Sync + fmt::Debug {
    /// Read an object. `Ok(None)` means the object does not exist.
    async fn read(&self, path: &str) -> StorageResult<Option<StoredObject>>;

    /// Replace an object if it is still in the expected state
    async fn write_if_match(
        &self,
        path: &str,
        bytes: Bytes,
        precondition: &Precondition,
    ) -> StorageResult<WriteOutcome>;

    /// List object paths starting with `prefix`, in lexicographic order
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;

    fn backend_type(&self) -> StorageBackendType;
}

/// Reject paths that would escape the configured prefix or confuse providers
pub fn validate_path(path: &str) -> StorageResult<()> {
    let invalid = path.is_empty()
        || path.starts_with('/')
        || path.contains("//")
        || path.split('/').any(|segment| segment == ".." || segment == ".");

    if invalid {
        Err(StorageError::InvalidPath { path: path.to_string() })
    } else {
        Ok(())
    }
}

/// The provider selected at startup
#[derive(Debug, Clone)]
pub enum StorageProvider {
    Memory(MemoryBackend),
    #[cfg(feature = "gcs")]
    Gcs(gcs::GcsBackend),
    #[cfg(feature = "s3")]
    S3(s3::S3Backend),
    #[cfg(feature = "azure")]
    Azure(azure::AzureBackend),
}

macro_rules! dispatch {
    ($provider:expr, $backend:ident => $call:expr) => {
        match $provider {
            StorageProvider::Memory($backend) => $call,
            #[cfg(feature = "gcs")]
            StorageProvider::Gcs($backend) => $call,
            #[cfg(feature = "s3")]
            StorageProvider::S3($backend) => $call,
            #[cfg(feature = "azure")]
            StorageProvider::Azure($backend) => $call,
        }
    };
}

/// Configured provider plus the optional object prefix every path is joined onto
#[derive(Debug, Clone)]
pub struct ObjectStore {
    provider: StorageProvider,
    prefix: String,
}

impl ObjectStore {
    pub fn new(provider: StorageProvider, prefix: &str) -> Self {
        let prefix = prefix.trim_matches('/');
        let prefix = if prefix.is_empty() { String::new() } else { format!("{prefix}/") };
        Self { provider, prefix }
    }

    pub fn memory(backend: MemoryBackend) -> Self {
        Self::new(StorageProvider::Memory(backend), "")
    }

    /// Build the provider named in configuration
    pub async fn from_config(config: &StorageConfig) -> StorageResult<Self> {
        let provider = match config.backend {
            StorageBackendType::Memory => StorageProvider::Memory(MemoryBackend::new()),

            #[cfg(feature = "gcs")]
            StorageBackendType::Gcs => StorageProvider::Gcs(gcs::GcsBackend::from_config(config)?),
            #[cfg(not(feature = "gcs"))]
            StorageBackendType::Gcs => {
                return Err(StorageError::config("GCS support requires the 'gcs' feature"))
            }

            #[cfg(feature = "s3")]
            StorageBackendType::S3 => StorageProvider::S3(s3::S3Backend::from_config(config).await?),
            #[cfg(not(feature = "s3"))]
            StorageBackendType::S3 => {
                return Err(StorageError::config("S3 support requires the 's3' feature"))
            }

            #[cfg(feature = "azure")]
            StorageBackendType::Azure => {
                StorageProvider::Azure(azure::AzureBackend::from_config(config)?)
            }
            #[cfg(not(feature = "azure"))]
            StorageBackendType::Azure => {
                return Err(StorageError::config("Azure support requires the 'azure' feature"))
            }
        };

        Ok(Self::new(provider, &config.prefix))
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn full_path(&self, path: &str) -> StorageResult<String> {
        validate_path(path)?;
        Ok(format!("{}{}", self.prefix, path))
    }
}

#[async_trait]
impl StorageBackend for ObjectStore {
    async fn read(&self, path: &str) -> StorageResult<Option<StoredObject>> {
        let path = self.full_path(path)?;
        dispatch!(&self.provider, backend => backend.read(&path).await)
    }

    async fn write_if_match(
        &self,
        path: &str,
        bytes: Bytes,
        precondition: &Precondition,
    ) -> StorageResult<WriteOutcome> {
        let path = self.full_path(path)?;
        dispatch!(&self.provider, backend => backend.write_if_match(&path, bytes, precondition).await)
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let full_prefix = format!("{}{}", self.prefix, prefix);
        let paths = dispatch!(&self.provider, backend => backend.list(&full_prefix).await)?;
        Ok(paths
            .into_iter()
            .filter_map(|p| p.strip_prefix(self.prefix.as_str()).map(str::to_string))
            .collect())
    }

    fn backend_type(&self) -> StorageBackendType {
        dispatch!(&self.provider, backend => backend.backend_type())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_type_roundtrip() {
        for bt in [
            StorageBackendType::Memory,
            StorageBackendType::Gcs,
            StorageBackendType::S3,
            StorageBackendType::Azure,
        ] {
            let parsed: StorageBackendType = bt.as_str().parse().unwrap();
            assert_eq!(bt, parsed);
        }
        assert!("ftp".parse::<StorageBackendType>().is_err());
    }

    #[test]
    fn test_path_validation() {
        assert!(validate_path("openid/v1/jwks").is_ok());
        assert!(validate_path(".well-known/openid-configuration").is_ok());
        for bad in ["", "/openid/v1/jwks", "a//b", "a/../b", "./a"] {
            assert!(validate_path(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[tokio::test]
    async fn test_prefix_is_applied_and_stripped() {
        let backend = MemoryBackend::new();
        let store = ObjectStore::new(StorageProvider::Memory(backend.clone()), "/tenant-a/");
        assert_eq!(store.prefix(), "tenant-a/");

        let outcome = store
            .write_if_match("openid/v1/jwks", Bytes::from_static(b"{}"), &Precondition::Absent)
            .await
            .unwrap();
        assert!(matches!(outcome, WriteOutcome::Written(_)));

        assert!(backend.get_bytes("tenant-a/openid/v1/jwks").await.is_some());
        assert_eq!(store.list("openid/").await.unwrap(), vec!["openid/v1/jwks".to_string()]);
        assert!(store.read("openid/v1/jwks").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_memory_from_config() {
        let config = StorageConfig::default();
        let store = ObjectStore::from_config(&config).await.unwrap();
        assert_eq!(store.backend_type(), StorageBackendType::Memory);
    }
}
