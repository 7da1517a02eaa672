//! # Structured Logging
//!
//! Subscriber setup and span macros. `RUST_LOG` takes precedence over the
//! configured level so operators can raise verbosity for one module without a
//! config change.

use crate::config::ObservabilityConfig;
use crate::errors::{BridgeError, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// Create a tracing span for one controller cycle.
///
/// ```rust,ignore
/// let span = cycle_span!("bridge");
/// let span = cycle_span!("aggregator", fleet = "prod");
/// ```
#[macro_export]
macro_rules! cycle_span {
    ($role:expr) => {
        tracing::info_span!(
            "cycle",
            role = %$role,
            cycle_id = %uuid::Uuid::new_v4()
        )
    };
    ($role:expr, $($field:tt)*) => {
        tracing::info_span!(
            "cycle",
            role = %$role,
            cycle_id = %uuid::Uuid::new_v4(),
            $($field)*
        )
    };
}

/// Create a tracing span for a storage operation.
///
/// ```rust,ignore
/// let span = storage_span!("publish", "openid/v1/jwks");
/// ```
#[macro_export]
macro_rules! storage_span {
    ($operation:expr, $path:expr) => {
        tracing::debug_span!(
            "storage_operation",
            operation = %$operation,
            path = %$path
        )
    };
    ($operation:expr, $path:expr, $($field:tt)*) => {
        tracing::debug_span!(
            "storage_operation",
            operation = %$operation,
            path = %$path,
            $($field)*
        )
    };
}

/// Install the global subscriber. A subscriber that is already installed
/// (integration tests) is left in place.
pub fn init_logging(config: &ObservabilityConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log_level).map_err(|e| {
            BridgeError::config(format!("Invalid log level '{}': {}", config.log_level, e))
        })?,
    };

    let installed = if config.json_logging {
        tracing::subscriber::set_global_default(
            fmt().json().with_env_filter(filter).with_current_span(true).finish(),
        )
    } else {
        tracing::subscriber::set_global_default(fmt().with_env_filter(filter).finish())
    };

    if installed.is_err() {
        // Subscriber already set elsewhere; keep it.
    }
    Ok(())
}

/// Log configuration at startup
pub fn log_config_info(config: &crate::config::AppConfig) {
    tracing::info!(
        public_base_url = %config.bridge.public_base_url,
        poll_interval_seconds = config.bridge.poll_interval_seconds,
        overlap_seconds = config.bridge.overlap_seconds,
        fleet = %config.fleet.name,
        cluster_id = ?config.fleet.cluster_id,
        storage_backend = %config.storage.backend,
        storage_prefix = %config.storage.prefix,
        upstream_source = ?config.upstream.source,
        cache_backend = ?config.cache.backend,
        leader_election = ?config.leader.mode,
        identity = %config.leader.identity,
        "OIDC bridge configuration"
    );
}
