//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use oidc_bridge::domain::{KeyEntry, KeySet, PublicKeyMaterial, SigningAlgorithm};
use oidc_bridge::storage::RetryConfig;
use oidc_bridge::upstream::{UpstreamError, UpstreamObservation, UpstreamSource};

pub const ISSUER: &str = "https://oidc.example.com/cluster-a";
pub const DAY: Duration = Duration::from_secs(24 * 3600);

// RFC 7638 section 3.1 example modulus
pub const RFC7638_N: &str = "0vx7agoebGcQSuuPiLJXZptN9nndrQmbXEps2aiAFbWhM78LhWx4cbbfAAtVT86zwu1RK7aPFFxuhDR1L6tSoc_BJECPebWKRXjBZCiFV4n3oknjhMstn64tZ_2W-5JsGY4Hc5n9yBXArwl93lqt7_RN5w6Cf0h4QyQ5v-65YGjQR0_FDW2QvzqY368QQMicAtaSqzs8KJZgnYb9c7d0zgdAZHzu6qMQvRL5hajrn1n91CbOpbISD08qNLyrdkt-bFTWhAI4vMQFh6WeZu0fM4lFd2NcRwr3XPksINHaQ-G_xBniIqbw0Ls1jF44-csFCur-kEgU8awapJzKnqDKgw";

/// Distinct RSA public key material per seed
pub fn rsa_key(seed: &str) -> KeyEntry {
    let material = PublicKeyMaterial::Rsa {
        n: URL_SAFE_NO_PAD.encode(format!("modulus-{seed}").as_bytes()),
        e: "AQAB".to_string(),
    };
    KeyEntry::new(material, SigningAlgorithm::RS256, epoch())
}

pub fn key_set(keys: &[&KeyEntry]) -> KeySet {
    keys.iter().map(|k| (*k).clone()).collect()
}

pub fn epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

pub fn at_hours(h: i64) -> DateTime<Utc> {
    epoch() + chrono::Duration::hours(h)
}

pub fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        ..RetryConfig::default()
    }
}

/// Upstream double whose advertised keys are swapped between polls
#[derive(Debug)]
pub struct ScriptedUpstream {
    issuer: Mutex<String>,
    keys: Mutex<Result<KeySet, UpstreamError>>,
}

impl ScriptedUpstream {
    pub fn new(issuer: &str, keys: KeySet) -> Arc<Self> {
        Arc::new(Self { issuer: Mutex::new(issuer.to_string()), keys: Mutex::new(Ok(keys)) })
    }

    pub fn advertise(&self, keys: KeySet) {
        *self.keys.lock().unwrap() = Ok(keys);
    }

    pub fn fail(&self, error: UpstreamError) {
        *self.keys.lock().unwrap() = Err(error);
    }

    pub fn set_issuer(&self, issuer: &str) {
        *self.issuer.lock().unwrap() = issuer.to_string();
    }
}

#[async_trait]
impl UpstreamSource for ScriptedUpstream {
    async fn discovery(&self) -> Result<Vec<u8>, UpstreamError> {
        let issuer = self.issuer.lock().unwrap().clone();
        Ok(serde_json::to_vec(&serde_json::json!({ "issuer": issuer })).unwrap())
    }

    async fn jwks(&self) -> Result<Vec<u8>, UpstreamError> {
        unreachable!("fetch is overridden")
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }

    async fn fetch(&self, now: DateTime<Utc>) -> Result<UpstreamObservation, UpstreamError> {
        let key_set = self.keys.lock().unwrap().clone()?;
        Ok(UpstreamObservation { issuer: self.issuer.lock().unwrap().clone(), key_set, fetched_at: now })
    }
}

/// `kid`s of a published JWKS document
pub fn published_kids(bytes: &[u8]) -> Vec<String> {
    let jwks: serde_json::Value = serde_json::from_slice(bytes).unwrap();
    jwks["keys"]
        .as_array()
        .unwrap()
        .iter()
        .map(|k| k["kid"].as_str().unwrap().to_string())
        .collect()
}
