//! # Configuration Settings
//!
//! Defines the configuration structure for the OIDC bridge controller.

use crate::domain::{ClusterId, FleetLayout};
use crate::errors::{BridgeError, Result};
use crate::leader::LeaseConfig;
use crate::secrets::SecretString;
use crate::storage::{RetryConfig, StorageBackendType};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use validator::Validate;

/// Prefix shared by every environment variable the controller reads
pub const ENV_PREFIX: &str = "OIDC_BRIDGE_";

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
pub struct AppConfig {
    /// Upstream polling and rotation configuration
    #[validate(nested)]
    pub bridge: BridgeConfig,

    /// Fleet aggregation configuration
    #[validate(nested)]
    pub fleet: FleetConfig,

    /// Object storage configuration
    #[validate(nested)]
    pub storage: StorageConfig,

    /// Upstream source configuration
    #[validate(nested)]
    pub upstream: UpstreamConfig,

    /// Shared cache configuration
    #[validate(nested)]
    pub cache: CacheConfig,

    /// Leader election configuration
    #[validate(nested)]
    pub leader: LeaderConfig,

    /// Observability configuration
    #[validate(nested)]
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Load every section from `OIDC_BRIDGE_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup; keys are full variable names
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvSource::new(&lookup);
        Ok(Self {
            bridge: BridgeConfig::from_source(&env)?,
            fleet: FleetConfig::from_source(&env)?,
            storage: StorageConfig::from_source(&env)?,
            upstream: UpstreamConfig::from_source(&env)?,
            cache: CacheConfig::from_source(&env)?,
            leader: LeaderConfig::from_source(&env)?,
            observability: ObservabilityConfig::from_source(&env)?,
        })
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<()> {
        Validate::validate(self).map_err(BridgeError::from)?;
        self.validate_custom()?;
        Ok(())
    }

    /// Cross-field rules the validator derives cannot express
    fn validate_custom(&self) -> Result<()> {
        let issuer = url::Url::parse(&self.bridge.public_base_url).map_err(|e| {
            BridgeError::validation_field(format!("Invalid public base URL: {e}"), "public_base_url")
        })?;
        if issuer.host_str().is_none() {
            return Err(BridgeError::validation_field(
                "Public base URL must be absolute",
                "public_base_url",
            ));
        }

        if self.fleet.is_enabled() {
            if self.fleet.name.contains('/') || self.fleet.name.trim() != self.fleet.name {
                return Err(BridgeError::validation_field(
                    "Fleet name must be a single path segment",
                    "fleet.name",
                ));
            }
            match self.fleet.cluster_id.as_deref() {
                None | Some("") => {
                    return Err(BridgeError::validation_field(
                        "Cluster ID is required when a fleet name is set",
                        "fleet.cluster_id",
                    ))
                }
                Some(id) if !ClusterId::is_valid(id) => {
                    return Err(BridgeError::validation_field(
                        format!("Cluster ID '{id}' must match ^[a-z0-9][a-z0-9-]*[a-z0-9]$"),
                        "fleet.cluster_id",
                    ))
                }
                Some(_) => {}
            }
            if self.fleet.aggregation_interval_seconds < self.bridge.poll_interval_seconds {
                return Err(BridgeError::validation_field(
                    "Aggregation interval must be at least the poll interval",
                    "fleet.aggregation_interval_seconds",
                ));
            }
            if self.fleet.record_refresh_seconds < self.bridge.poll_interval_seconds {
                return Err(BridgeError::validation_field(
                    "Record refresh interval must be at least the poll interval",
                    "fleet.record_refresh_seconds",
                ));
            }
            if self.fleet.cluster_ttl_seconds <= self.fleet.record_refresh_seconds {
                return Err(BridgeError::validation_field(
                    "Cluster TTL must be longer than the record refresh interval",
                    "fleet.cluster_ttl_seconds",
                ));
            }
        }

        if self.storage.backend != StorageBackendType::Memory && self.storage.bucket.is_empty() {
            return Err(BridgeError::validation_field(
                format!("A bucket is required for the {} storage backend", self.storage.backend),
                "storage.bucket",
            ));
        }
        if self.storage.backend == StorageBackendType::Azure
            && self.storage.azure_account.is_none()
            && self.storage.endpoint.is_none()
        {
            return Err(BridgeError::validation_field(
                "Azure storage requires an account name or an explicit endpoint",
                "storage.azure_account",
            ));
        }

        if self.upstream.source == UpstreamSourceType::Http && self.upstream.url.is_none() {
            return Err(BridgeError::validation_field(
                "The http upstream source requires an upstream URL",
                "upstream.url",
            ));
        }

        if self.leader.mode == LeaderElectionMode::Lease {
            let leader = &self.leader;
            if !(leader.retry_period_seconds < leader.renew_deadline_seconds
                && leader.renew_deadline_seconds < leader.lease_duration_seconds)
            {
                return Err(BridgeError::validation_field(
                    "Lease timings must satisfy retry period < renew deadline < lease duration",
                    "leader",
                ));
            }
        }

        Ok(())
    }
}

/// Upstream polling and key rotation
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BridgeConfig {
    /// Issuer URL published in the discovery document, copied byte-for-byte
    #[validate(length(min = 1, message = "Public base URL cannot be empty"))]
    pub public_base_url: String,

    /// Upstream poll interval in seconds
    #[validate(range(min = 5, max = 86400, message = "Poll interval must be between 5 and 86400 seconds"))]
    pub poll_interval_seconds: u64,

    /// How long a vanished key stays published (0 = drop immediately)
    pub overlap_seconds: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            public_base_url: String::new(),
            poll_interval_seconds: 60,
            overlap_seconds: 24 * 3600,
        }
    }
}

impl BridgeConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn overlap(&self) -> Duration {
        Duration::from_secs(self.overlap_seconds)
    }

    fn from_source(env: &EnvSource<'_>) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            public_base_url: env.string("PUBLIC_BASE_URL").unwrap_or_default(),
            poll_interval_seconds: env.parse("POLL_INTERVAL_SECONDS", defaults.poll_interval_seconds)?,
            overlap_seconds: env.parse("OVERLAP_SECONDS", defaults.overlap_seconds)?,
        })
    }
}

/// Fleet mode; an empty name disables it
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct FleetConfig {
    /// Fleet name, also the storage sub-path of the fleet documents
    pub name: String,

    /// This cluster's identifier within the fleet
    pub cluster_id: Option<String>,

    /// Aggregation interval in seconds
    #[validate(range(min = 5, message = "Aggregation interval must be at least 5 seconds"))]
    pub aggregation_interval_seconds: u64,

    /// Records older than this are left out of the aggregate
    #[validate(range(min = 60, message = "Cluster TTL must be at least 60 seconds"))]
    pub cluster_ttl_seconds: u64,

    /// Re-publish an unchanged record after this long so it does not go stale
    #[validate(range(min = 5, message = "Record refresh must be at least 5 seconds"))]
    pub record_refresh_seconds: u64,

    /// Run the aggregator role in this cluster
    pub aggregate: bool,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            cluster_id: None,
            aggregation_interval_seconds: 300,
            cluster_ttl_seconds: 48 * 3600,
            record_refresh_seconds: 3600,
            aggregate: true,
        }
    }
}

impl FleetConfig {
    pub fn is_enabled(&self) -> bool {
        !self.name.is_empty()
    }

    /// Storage layout of the fleet, if fleet mode is on
    pub fn layout(&self) -> Option<FleetLayout> {
        self.is_enabled().then(|| FleetLayout::new(self.name.clone()))
    }

    /// Parsed cluster ID; `None` outside fleet mode
    pub fn cluster(&self) -> Result<Option<ClusterId>> {
        if !self.is_enabled() {
            return Ok(None);
        }
        let id = self.cluster_id.as_deref().unwrap_or_default();
        ClusterId::parse(id)
            .map(Some)
            .map_err(|e| BridgeError::validation_field(e.to_string(), "fleet.cluster_id"))
    }

    pub fn aggregation_interval(&self) -> Duration {
        Duration::from_secs(self.aggregation_interval_seconds)
    }

    pub fn cluster_ttl(&self) -> Duration {
        Duration::from_secs(self.cluster_ttl_seconds)
    }

    pub fn record_refresh(&self) -> Duration {
        Duration::from_secs(self.record_refresh_seconds)
    }

    fn from_source(env: &EnvSource<'_>) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            name: env.string("FLEET_NAME").unwrap_or_default(),
            cluster_id: env.string("CLUSTER_ID"),
            aggregation_interval_seconds: env
                .parse("AGGREGATION_INTERVAL_SECONDS", defaults.aggregation_interval_seconds)?,
            cluster_ttl_seconds: env.parse("CLUSTER_TTL_SECONDS", defaults.cluster_ttl_seconds)?,
            record_refresh_seconds: env
                .parse("RECORD_REFRESH_SECONDS", defaults.record_refresh_seconds)?,
            aggregate: env.flag("FLEET_AGGREGATE", defaults.aggregate)?,
        })
    }
}

/// Object storage provider and credentials
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct StorageConfig {
    /// Provider selected once at startup
    pub backend: StorageBackendType,

    /// Bucket (GCS, S3) or container (Azure)
    pub bucket: String,

    /// Object key prefix prepended to every published path
    pub prefix: String,

    /// Provider endpoint override
    pub endpoint: Option<String>,

    /// S3 region
    pub region: Option<String>,

    /// Azure storage account name
    pub azure_account: Option<String>,

    /// Azure SAS token (query string form)
    pub azure_sas_token: Option<SecretString>,

    /// File holding a GCS OAuth access token; the metadata server is used otherwise
    pub gcs_token_file: Option<PathBuf>,

    /// Per-attempt timeout in seconds
    #[validate(range(min = 1, max = 120, message = "Storage timeout must be between 1 and 120 seconds"))]
    pub timeout_seconds: u64,

    /// Attempts per storage operation, including the first
    #[validate(range(min = 1, max = 10, message = "Storage max attempts must be between 1 and 10"))]
    pub max_attempts: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackendType::Memory,
            bucket: String::new(),
            prefix: String::new(),
            endpoint: None,
            region: None,
            azure_account: None,
            azure_sas_token: None,
            gcs_token_file: None,
            timeout_seconds: 10,
            max_attempts: 5,
        }
    }
}

impl StorageConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            attempt_timeout: self.timeout(),
            ..RetryConfig::default()
        }
    }

    fn from_source(env: &EnvSource<'_>) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            backend: env.parse("STORAGE_BACKEND", defaults.backend)?,
            bucket: env.string("STORAGE_BUCKET").unwrap_or_default(),
            prefix: env.string("STORAGE_PREFIX").unwrap_or_default(),
            endpoint: env.string("STORAGE_ENDPOINT"),
            region: env.string("STORAGE_REGION"),
            azure_account: env.string("AZURE_ACCOUNT"),
            azure_sas_token: env.string("AZURE_SAS_TOKEN").map(SecretString::from),
            gcs_token_file: env.string("GCS_TOKEN_FILE").map(PathBuf::from),
            timeout_seconds: env.parse("STORAGE_TIMEOUT_SECONDS", defaults.timeout_seconds)?,
            max_attempts: env.parse("STORAGE_MAX_ATTEMPTS", defaults.max_attempts)?,
        })
    }
}

/// Where upstream documents are fetched from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamSourceType {
    /// The API server, through the in-cluster Kubernetes client
    Kubernetes,
    /// Any HTTPS base URL
    Http,
}

impl FromStr for UpstreamSourceType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "kubernetes" => Ok(Self::Kubernetes),
            "http" => Ok(Self::Http),
            other => Err(format!("unknown upstream source '{other}' (expected kubernetes or http)")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct UpstreamConfig {
    pub source: UpstreamSourceType,

    /// Base URL for the http source
    pub url: Option<String>,

    /// Bearer token file for the http source
    pub token_file: Option<PathBuf>,

    /// Request timeout in seconds
    #[validate(range(min = 1, max = 120, message = "Upstream timeout must be between 1 and 120 seconds"))]
    pub timeout_seconds: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            source: UpstreamSourceType::Kubernetes,
            url: None,
            token_file: None,
            timeout_seconds: 10,
        }
    }
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    fn from_source(env: &EnvSource<'_>) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            source: env.parse("UPSTREAM_SOURCE", defaults.source)?,
            url: env.string("UPSTREAM_URL"),
            token_file: env.string("UPSTREAM_TOKEN_FILE").map(PathBuf::from),
            timeout_seconds: env.parse("UPSTREAM_TIMEOUT_SECONDS", defaults.timeout_seconds)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackendType {
    /// A ConfigMap shared by every replica
    ConfigMap,
    /// In-process only; replicas do not share it
    Memory,
}

impl FromStr for CacheBackendType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "configmap" => Ok(Self::ConfigMap),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown cache backend '{other}' (expected configmap or memory)")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CacheConfig {
    pub backend: CacheBackendType,

    /// ConfigMap name
    #[validate(length(min = 1, max = 253, message = "Cache name must be 1-253 characters"))]
    pub name: String,

    /// Namespace of the cache ConfigMap and the leader Lease
    #[validate(length(min = 1, max = 63, message = "Namespace must be 1-63 characters"))]
    pub namespace: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackendType::ConfigMap,
            name: "oidc-bridge-cache".to_string(),
            namespace: "default".to_string(),
        }
    }
}

impl CacheConfig {
    fn from_source(env: &EnvSource<'_>) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            backend: env.parse("CACHE_BACKEND", defaults.backend)?,
            name: env.string("CACHE_NAME").unwrap_or(defaults.name),
            namespace: env.string("NAMESPACE").unwrap_or(defaults.namespace),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaderElectionMode {
    /// Kubernetes Lease election
    Lease,
    /// Always leader; single-replica deployments only
    Static,
}

impl FromStr for LeaderElectionMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lease" => Ok(Self::Lease),
            "static" => Ok(Self::Static),
            other => Err(format!("unknown leader election mode '{other}' (expected lease or static)")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct LeaderConfig {
    pub mode: LeaderElectionMode,

    #[validate(length(min = 1, message = "Lease name cannot be empty"))]
    pub lease_name: String,

    #[validate(range(min = 1, message = "Lease duration must be at least 1 second"))]
    pub lease_duration_seconds: u64,

    #[validate(range(min = 1, message = "Renew deadline must be at least 1 second"))]
    pub renew_deadline_seconds: u64,

    #[validate(range(min = 1, message = "Retry period must be at least 1 second"))]
    pub retry_period_seconds: u64,

    /// Lease holder identity
    #[validate(length(min = 1, message = "Leader identity cannot be empty"))]
    pub identity: String,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            mode: LeaderElectionMode::Lease,
            lease_name: "oidc-bridge-leader".to_string(),
            lease_duration_seconds: 15,
            renew_deadline_seconds: 10,
            retry_period_seconds: 2,
            identity: default_identity(),
        }
    }
}

impl LeaderConfig {
    pub fn lease_config(&self, namespace: &str) -> LeaseConfig {
        LeaseConfig {
            name: self.lease_name.clone(),
            namespace: namespace.to_string(),
            identity: self.identity.clone(),
            lease_duration: Duration::from_secs(self.lease_duration_seconds),
            renew_deadline: Duration::from_secs(self.renew_deadline_seconds),
            retry_period: Duration::from_secs(self.retry_period_seconds),
        }
    }

    fn from_source(env: &EnvSource<'_>) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            mode: env.parse("LEADER_ELECTION", defaults.mode)?,
            lease_name: env.string("LEASE_NAME").unwrap_or(defaults.lease_name),
            lease_duration_seconds: env
                .parse("LEASE_DURATION_SECONDS", defaults.lease_duration_seconds)?,
            renew_deadline_seconds: env
                .parse("LEASE_RENEW_DEADLINE_SECONDS", defaults.renew_deadline_seconds)?,
            retry_period_seconds: env
                .parse("LEASE_RETRY_PERIOD_SECONDS", defaults.retry_period_seconds)?,
            identity: env.string("POD_NAME").unwrap_or(defaults.identity),
        })
    }
}

/// Pod hostname when available, otherwise a random identity
fn default_identity() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| format!("oidc-bridge-{}", uuid::Uuid::new_v4()))
}

/// Logging and metrics
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[validate(length(min = 1, message = "Log level cannot be empty"))]
    pub log_level: String,

    /// Enable JSON structured logging
    pub json_logging: bool,

    /// Prometheus exporter port (0 = disabled)
    pub metrics_port: u16,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { log_level: "info".to_string(), json_logging: false, metrics_port: 0 }
    }
}

impl ObservabilityConfig {
    /// Get metrics bind address (None if disabled)
    pub fn metrics_bind_address(&self) -> Option<String> {
        if self.metrics_port == 0 {
            None
        } else {
            Some(format!("0.0.0.0:{}", self.metrics_port))
        }
    }

    fn from_source(env: &EnvSource<'_>) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            log_level: env.string("LOG_LEVEL").unwrap_or(defaults.log_level),
            json_logging: env.flag("LOG_JSON", defaults.json_logging)?,
            metrics_port: env.parse("METRICS_PORT", defaults.metrics_port)?,
        })
    }
}

/// Prefixed variable lookup with typed parsing
struct EnvSource<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl<'a> EnvSource<'a> {
    fn new(lookup: &'a dyn Fn(&str) -> Option<String>) -> Self {
        Self { lookup }
    }

    fn key(name: &str) -> String {
        format!("{ENV_PREFIX}{name}")
    }

    /// Non-empty value of `OIDC_BRIDGE_<name>`
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(&Self::key(name)).filter(|v| !v.trim().is_empty())
    }

    fn parse<T>(&self, name: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.string(name) {
            None => Ok(default),
            Some(raw) => raw.trim().parse::<T>().map_err(|e| {
                BridgeError::config(format!("Invalid value for {}: '{}' ({})", Self::key(name), raw, e))
            }),
        }
    }

    fn flag(&self, name: &str, default: bool) -> Result<bool> {
        match self.string(name) {
            None => Ok(default),
            Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(true),
                "false" | "0" | "no" => Ok(false),
                _ => Err(BridgeError::config(format!(
                    "Invalid value for {}: '{}' (expected true or false)",
                    Self::key(name),
                    raw
                ))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<AppConfig> {
        let map: HashMap<String, String> =
            vars.iter().map(|(k, v)| (format!("{ENV_PREFIX}{k}"), v.to_string())).collect();
        AppConfig::from_lookup(|key| map.get(key).cloned())
    }

    fn valid_base() -> Vec<(&'static str, &'static str)> {
        vec![("PUBLIC_BASE_URL", "https://oidc.example.com/cluster-a")]
    }

    #[test]
    fn test_defaults() {
        let config = load(&valid_base()).unwrap();
        assert_eq!(config.bridge.poll_interval(), Duration::from_secs(60));
        assert_eq!(config.bridge.overlap(), Duration::from_secs(86400));
        assert!(!config.fleet.is_enabled());
        assert_eq!(config.fleet.aggregation_interval(), Duration::from_secs(300));
        assert_eq!(config.fleet.cluster_ttl(), Duration::from_secs(172800));
        assert_eq!(config.storage.backend, StorageBackendType::Memory);
        assert_eq!(config.upstream.source, UpstreamSourceType::Kubernetes);
        assert_eq!(config.cache.backend, CacheBackendType::ConfigMap);
        assert_eq!(config.leader.mode, LeaderElectionMode::Lease);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_public_base_url_required() {
        let config = load(&[]).unwrap();
        assert!(config.validate().is_err());

        let config = load(&[("PUBLIC_BASE_URL", "not a url")]).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_public_base_url_kept_verbatim() {
        let config = load(&[("PUBLIC_BASE_URL", "https://oidc.example.com/")]).unwrap();
        assert_eq!(config.bridge.public_base_url, "https://oidc.example.com/");
    }

    #[test]
    fn test_poll_interval_minimum() {
        let mut vars = valid_base();
        vars.push(("POLL_INTERVAL_SECONDS", "4"));
        assert!(load(&vars).unwrap().validate().is_err());
    }

    #[test]
    fn test_unparseable_number_is_config_error() {
        let mut vars = valid_base();
        vars.push(("POLL_INTERVAL_SECONDS", "soon"));
        assert!(matches!(load(&vars), Err(BridgeError::Config { .. })));
    }

    #[test]
    fn test_fleet_requires_valid_cluster_id() {
        let mut vars = valid_base();
        vars.push(("FLEET_NAME", "prod"));
        assert!(load(&vars).unwrap().validate().is_err());

        vars.push(("CLUSTER_ID", "Cluster_A"));
        assert!(load(&vars).unwrap().validate().is_err());

        let mut vars = valid_base();
        vars.extend([("FLEET_NAME", "prod"), ("CLUSTER_ID", "cluster-a")]);
        let config = load(&vars).unwrap();
        config.validate().unwrap();
        assert_eq!(config.fleet.cluster().unwrap().unwrap().as_str(), "cluster-a");
        assert_eq!(config.fleet.layout().unwrap().name(), "prod");
    }

    #[test]
    fn test_aggregation_interval_not_below_poll_interval() {
        let mut vars = valid_base();
        vars.extend([
            ("FLEET_NAME", "prod"),
            ("CLUSTER_ID", "cluster-a"),
            ("POLL_INTERVAL_SECONDS", "120"),
            ("AGGREGATION_INTERVAL_SECONDS", "60"),
        ]);
        assert!(load(&vars).unwrap().validate().is_err());
    }

    #[test]
    fn test_cluster_ttl_must_exceed_record_refresh() {
        let mut vars = valid_base();
        vars.extend([
            ("FLEET_NAME", "prod"),
            ("CLUSTER_ID", "cluster-a"),
            ("RECORD_REFRESH_SECONDS", "7200"),
            ("CLUSTER_TTL_SECONDS", "7200"),
        ]);
        assert!(load(&vars).unwrap().validate().is_err());
    }

    #[test]
    fn test_cloud_backend_requires_bucket() {
        let mut vars = valid_base();
        vars.push(("STORAGE_BACKEND", "GCS"));
        let config = load(&vars).unwrap();
        assert_eq!(config.storage.backend, StorageBackendType::Gcs);
        assert!(config.validate().is_err());

        vars.push(("STORAGE_BUCKET", "oidc-public"));
        assert!(load(&vars).unwrap().validate().is_ok());
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let mut vars = valid_base();
        vars.push(("STORAGE_BACKEND", "ftp"));
        assert!(load(&vars).is_err());
    }

    #[test]
    fn test_http_upstream_requires_url() {
        let mut vars = valid_base();
        vars.push(("UPSTREAM_SOURCE", "http"));
        assert!(load(&vars).unwrap().validate().is_err());
    }

    #[test]
    fn test_lease_timing_order() {
        let mut vars = valid_base();
        vars.extend([("LEASE_DURATION_SECONDS", "10"), ("LEASE_RENEW_DEADLINE_SECONDS", "10")]);
        assert!(load(&vars).unwrap().validate().is_err());

        let mut vars = valid_base();
        vars.extend([
            ("LEADER_ELECTION", "static"),
            ("LEASE_DURATION_SECONDS", "10"),
            ("LEASE_RENEW_DEADLINE_SECONDS", "10"),
        ]);
        assert!(load(&vars).unwrap().validate().is_ok());
    }

    #[test]
    fn test_storage_retry_config() {
        let config = StorageConfig { timeout_seconds: 3, max_attempts: 2, ..Default::default() };
        let retry = config.retry_config();
        assert_eq!(retry.max_attempts, 2);
        assert_eq!(retry.attempt_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_sas_token_redacted_in_debug() {
        let mut vars = valid_base();
        vars.push(("AZURE_SAS_TOKEN", "sv=2021&sig=secret"));
        let config = load(&vars).unwrap();
        assert!(!format!("{:?}", config.storage).contains("sig=secret"));
    }

    #[test]
    fn test_observability_config_metrics_address() {
        let config = ObservabilityConfig { metrics_port: 9090, ..Default::default() };
        assert_eq!(config.metrics_bind_address(), Some("0.0.0.0:9090".to_string()));
        assert_eq!(ObservabilityConfig::default().metrics_bind_address(), None);
    }
}
