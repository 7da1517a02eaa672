//! # Upstream Source
//!
//! Fetches the cluster's own discovery document and JWKS. Sources only move
//! bytes; parsing and validation live here so every source rejects the same
//! malformed input the same way. A fetch either yields a complete, non-empty
//! key set or an error; there is no partial result.
//!
//! The JWKS is always fetched from the source's own `/openid/v1/jwks` rather
//! than the discovery document's `jwks_uri`, which normally points back at the
//! public mirror this controller maintains.

pub mod http;
pub mod kubernetes;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

use crate::domain::{Jwk, KeyEntry, KeyError, KeySet};

pub use self::http::HttpSource;
pub use kubernetes::KubernetesSource;

pub const DISCOVERY_ENDPOINT: &str = "/.well-known/openid-configuration";
pub const JWKS_ENDPOINT: &str = "/openid/v1/jwks";

#[derive(Debug, Clone, thiserror::Error)]
pub enum UpstreamError {
    #[error("request to {endpoint} failed: {message}")]
    Http { endpoint: String, message: String },

    #[error("{endpoint} returned HTTP {status}")]
    Status { endpoint: String, status: u16 },

    #[error("request to {endpoint} timed out after {}s", .after.as_secs())]
    Timeout { endpoint: String, after: Duration },

    #[error("malformed {document}: {message}")]
    Malformed { document: &'static str, message: String },

    #[error("upstream JWKS contains no usable signing keys")]
    EmptyKeySet,

    #[error("Kubernetes API error: {message}")]
    Kubernetes { message: String },
}

impl UpstreamError {
    pub fn malformed<S: Into<String>>(document: &'static str, message: S) -> Self {
        Self::Malformed { document, message: message.into() }
    }

    /// Network-level and server-side failures; malformed content is not
    /// expected to fix itself between immediate retries
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http { .. } | Self::Timeout { .. } | Self::Kubernetes { .. } => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Malformed { .. } | Self::EmptyKeySet => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Http { .. } => "http",
            Self::Status { .. } => "status",
            Self::Timeout { .. } => "timeout",
            Self::Malformed { .. } => "malformed",
            Self::EmptyKeySet => "empty_key_set",
            Self::Kubernetes { .. } => "kubernetes",
        }
    }
}

/// The parts of the upstream discovery document this controller relies on
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UpstreamDiscovery {
    pub issuer: String,
    #[serde(default)]
    pub jwks_uri: Option<String>,
}

/// One complete upstream observation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamObservation {
    pub issuer: String,
    pub key_set: KeySet,
    pub fetched_at: DateTime<Utc>,
}

#[async_trait]
pub trait UpstreamSource: Send + Sync + std::fmt::Debug {
    /// Raw discovery document bytes
    async fn discovery(&self) -> Result<Vec<u8>, UpstreamError>;

    /// Raw JWKS bytes
    async fn jwks(&self) -> Result<Vec<u8>, UpstreamError>;

    /// Human-readable source location for logs
    fn describe(&self) -> String;

    /// Fetch and validate both documents
    async fn fetch(&self, now: DateTime<Utc>) -> Result<UpstreamObservation, UpstreamError> {
        let discovery = parse_discovery(&self.discovery().await?)?;
        let key_set = parse_jwks(&self.jwks().await?, now)?;
        Ok(UpstreamObservation { issuer: discovery.issuer, key_set, fetched_at: now })
    }
}

pub fn parse_discovery(bytes: &[u8]) -> Result<UpstreamDiscovery, UpstreamError> {
    let discovery: UpstreamDiscovery = serde_json::from_slice(bytes)
        .map_err(|e| UpstreamError::malformed("discovery document", e.to_string()))?;
    if discovery.issuer.is_empty() {
        return Err(UpstreamError::malformed("discovery document", "empty issuer"));
    }
    Ok(discovery)
}

/// Parse a JWKS into a key set.
///
/// Keys marked for encryption are skipped. Any other key that cannot be
/// published rejects the whole document, so a half-understood key set is
/// never committed.
pub fn parse_jwks(bytes: &[u8], first_seen: DateTime<Utc>) -> Result<KeySet, UpstreamError> {
    #[derive(Deserialize)]
    struct RawJwks {
        keys: Vec<serde_json::Value>,
    }

    let raw: RawJwks =
        serde_json::from_slice(bytes).map_err(|e| UpstreamError::malformed("JWKS", e.to_string()))?;

    let mut key_set = KeySet::new();
    for value in raw.keys {
        let jwk = Jwk::from_value(value).map_err(jwks_error)?;
        if !jwk.is_signing_key() {
            continue;
        }

        let entry = KeyEntry::from_jwk(jwk, first_seen).map_err(jwks_error)?;
        let kid = entry.kid.clone();
        if !key_set.insert(entry) {
            warn!(kid = %kid, "Upstream JWKS repeats a kid, keeping the first key");
        }
    }

    if key_set.is_empty() {
        return Err(UpstreamError::EmptyKeySet);
    }
    Ok(key_set)
}

fn jwks_error(error: KeyError) -> UpstreamError {
    UpstreamError::malformed("JWKS", error.to_string())
}
