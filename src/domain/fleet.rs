//! Fleet records and aggregation
//!
//! Each cluster publishes a [`ClusterRecord`] under
//! `<fleet>/clusters/<cluster_id>/openid/v1/jwks`. The fleet aggregate is the
//! `kid`-deduplicated union of every record that is younger than the cluster TTL.

use super::documents::{DISCOVERY_PATH, JWKS_PATH};
use super::key::{Jwk, KeyEntry, KeyError};
use super::key_set::KeySet;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

static CLUSTER_ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9-]*[a-z0-9]$").expect("valid cluster id regex"));

/// Validated cluster identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClusterId(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid cluster id '{0}': must match ^[a-z0-9][a-z0-9-]*[a-z0-9]$")]
pub struct InvalidClusterId(pub String);

impl ClusterId {
    pub fn parse(s: &str) -> Result<Self, InvalidClusterId> {
        if CLUSTER_ID_PATTERN.is_match(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(InvalidClusterId(s.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_valid(s: &str) -> bool {
        CLUSTER_ID_PATTERN.is_match(s)
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ClusterId {
    type Err = InvalidClusterId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ClusterId {
    type Error = InvalidClusterId;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<ClusterId> for String {
    fn from(id: ClusterId) -> Self {
        id.0
    }
}

/// Storage layout of one fleet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetLayout {
    fleet: String,
}

impl FleetLayout {
    pub fn new(fleet: impl Into<String>) -> Self {
        Self { fleet: fleet.into().trim_matches('/').to_string() }
    }

    pub fn name(&self) -> &str {
        &self.fleet
    }

    pub fn discovery_path(&self) -> String {
        format!("{}/{}", self.fleet, DISCOVERY_PATH)
    }

    pub fn jwks_path(&self) -> String {
        format!("{}/{}", self.fleet, JWKS_PATH)
    }

    /// Listing prefix covering every cluster record
    pub fn clusters_prefix(&self) -> String {
        format!("{}/clusters/", self.fleet)
    }

    pub fn cluster_record_path(&self, cluster: &ClusterId) -> String {
        format!("{}{}/{}", self.clusters_prefix(), cluster, JWKS_PATH)
    }

    /// Recover the cluster id from a listed object path, ignoring anything
    /// under the clusters prefix that is not a record
    pub fn cluster_from_path(&self, path: &str) -> Option<ClusterId> {
        let rest = path.strip_prefix(&self.clusters_prefix())?;
        let (cluster, tail) = rest.split_once('/')?;
        if tail != JWKS_PATH {
            return None;
        }
        ClusterId::parse(cluster).ok()
    }
}

/// One cluster's published key set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterRecord {
    pub cluster_id: ClusterId,
    pub key_set: KeySet,
    pub last_published: DateTime<Utc>,
}

/// Wire form: a JWKS document extended with the record metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRecordDocument {
    pub keys: Vec<Jwk>,
    pub cluster_id: ClusterId,
    pub last_published: DateTime<Utc>,
}

impl ClusterRecord {
    pub fn to_document(&self) -> ClusterRecordDocument {
        ClusterRecordDocument {
            keys: self.key_set.iter().map(|entry| entry.to_jwk()).collect(),
            cluster_id: self.cluster_id.clone(),
            last_published: self.last_published,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.to_document())
    }

    pub fn from_document(doc: ClusterRecordDocument) -> Result<Self, KeyError> {
        let mut key_set = KeySet::new();
        for jwk in doc.keys {
            key_set.insert(KeyEntry::from_jwk(jwk, doc.last_published)?);
        }
        Ok(Self { cluster_id: doc.cluster_id, key_set, last_published: doc.last_published })
    }

    /// Parse stored bytes into a record
    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        let doc: ClusterRecordDocument =
            serde_json::from_slice(bytes).map_err(|e| KeyError::Malformed(e.to_string()))?;
        Self::from_document(doc)
    }

    /// Age relative to `now`; records stamped in the future count as fresh
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_published).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_live(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        self.age(now) < ttl
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetAggregate {
    pub issuer: String,
    pub key_set: KeySet,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationResult {
    pub aggregate: FleetAggregate,
    pub live: Vec<ClusterId>,
    pub stale: Vec<ClusterId>,
}

/// Union the keys of every live record.
///
/// Records are visited in `cluster_id` order and the first occurrence of a
/// `kid` wins, so the result does not depend on listing order.
pub fn aggregate(
    records: &[ClusterRecord],
    issuer: &str,
    now: DateTime<Utc>,
    ttl: Duration,
) -> AggregationResult {
    let mut ordered: Vec<&ClusterRecord> = records.iter().collect();
    ordered.sort_by(|a, b| a.cluster_id.cmp(&b.cluster_id));

    let mut key_set = KeySet::new();
    let mut live = Vec::new();
    let mut stale = Vec::new();

    for record in ordered {
        if record.is_live(now, ttl) {
            key_set.extend_new(&record.key_set);
            live.push(record.cluster_id.clone());
        } else {
            stale.push(record.cluster_id.clone());
        }
    }

    AggregationResult {
        aggregate: FleetAggregate { issuer: issuer.to_string(), key_set },
        live,
        stale,
    }
}
