//! # OIDC Bridge
//!
//! Mirrors a Kubernetes cluster's OIDC discovery document and JWKS into
//! public object storage, so verifiers outside the cluster can validate
//! service-account tokens without reaching the API server.
//!
//! ## Architecture
//!
//! ```text
//! upstream ──poll──▶ Bridge (leader) ──CAS──▶ SharedCache
//!                                               │ watch
//!                                               ▼
//!                          Publisher (every replica) ──conditional write──▶ storage
//!                                                                            │
//!                          FleetAggregator (leader, fleet mode) ◀──records───┘
//! ```
//!
//! Retired keys stay published for a configurable overlap window after the
//! upstream stops advertising them, so tokens signed just before a rotation
//! keep verifying.

pub mod cache;
pub mod config;
pub mod domain;
pub mod errors;
pub mod leader;
pub mod observability;
pub mod secrets;
pub mod services;
pub mod storage;
pub mod upstream;

pub use config::AppConfig;
pub use errors::{BridgeError, Result};
pub use services::Controller;

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name from Cargo.toml
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_available() {
        assert!(!VERSION.is_empty());
        assert_eq!(APP_NAME, "oidc-bridge");
    }
}
