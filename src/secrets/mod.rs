//! Credential handling for storage providers and the upstream source.

pub mod types;

pub use types::SecretString;
