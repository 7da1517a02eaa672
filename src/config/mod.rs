//! # Configuration Management
//!
//! All settings come from `OIDC_BRIDGE_*` environment variables, optionally
//! seeded from a `.env` file. Loading parses every value; validation then
//! checks ranges and cross-field rules. Either failure stops startup.

pub mod settings;

pub use settings::{
    AppConfig, BridgeConfig, CacheBackendType, CacheConfig, FleetConfig, LeaderConfig,
    LeaderElectionMode, ObservabilityConfig, StorageConfig, UpstreamConfig, UpstreamSourceType,
    ENV_PREFIX,
};

use crate::errors::Result;

/// Load `.env` (if present), read the environment and validate
pub fn load() -> Result<AppConfig> {
    if let Ok(path) = dotenvy::dotenv() {
        tracing::debug!(path = %path.display(), "Loaded environment file");
    }

    let config = AppConfig::from_env()?;
    config.validate()?;
    Ok(config)
}
