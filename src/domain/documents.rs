//! Published OIDC documents
//!
//! Both documents are derived purely from a key set and the configured issuer,
//! so every replica that builds them from the same cache version produces the
//! same bytes.

use super::key::Jwk;
use super::key_set::KeySet;
use serde::{Deserialize, Serialize};

/// Object path of the discovery document, relative to the publication root
pub const DISCOVERY_PATH: &str = ".well-known/openid-configuration";

/// Object path of the key set, relative to the publication root
pub const JWKS_PATH: &str = "openid/v1/jwks";

/// `jwks_uri` advertised for an issuer
pub fn jwks_uri_for(issuer: &str) -> String {
    format!("{}/{}", issuer.trim_end_matches('/'), JWKS_PATH)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryDocument {
    /// Copied byte-for-byte from configuration; never normalized
    pub issuer: String,
    pub jwks_uri: String,
    pub response_types_supported: Vec<String>,
    pub subject_types_supported: Vec<String>,
    pub id_token_signing_alg_values_supported: Vec<String>,
}

impl DiscoveryDocument {
    pub fn new(issuer: &str, keys: &KeySet) -> Self {
        Self {
            issuer: issuer.to_string(),
            jwks_uri: jwks_uri_for(issuer),
            response_types_supported: vec!["id_token".to_string()],
            subject_types_supported: vec!["public".to_string()],
            id_token_signing_alg_values_supported: keys
                .algorithms()
                .into_iter()
                .map(|alg| alg.to_string())
                .collect(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwksDocument {
    pub keys: Vec<Jwk>,
}

impl JwksDocument {
    pub fn new(keys: &KeySet) -> Self {
        Self { keys: keys.iter().map(|entry| entry.to_jwk()).collect() }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
