//! # Error Handling
//!
//! Error types for the OIDC bridge. Each layer (storage, cache, upstream) owns a
//! narrow error enum; [`BridgeError`] is the crate-wide type the services and
//! the binary report through.

pub mod types;

pub use types::{BridgeError, Result};
