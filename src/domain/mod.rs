//! Domain layer
//!
//! Pure types and functions for the published key material, with no
//! infrastructure dependencies. Everything here is deterministic so any
//! replica deriving documents from the same cache version gets the same bytes.
//!
//! ## Module Organization
//!
//! - `key`: a single signing key and its JWK wire form
//! - `key_set`: insertion-ordered, `kid`-unique collection of keys
//! - `rotation`: the overlap state machine driven by each upstream poll
//! - `documents`: discovery and JWKS documents served to verifiers
//! - `fleet`: per-cluster records and the fleet-wide aggregate

pub mod documents;
pub mod fleet;
pub mod key;
pub mod key_set;
pub mod rotation;

pub use documents::{jwks_uri_for, DiscoveryDocument, JwksDocument, DISCOVERY_PATH, JWKS_PATH};
pub use fleet::{
    aggregate, AggregationResult, ClusterId, ClusterRecord, ClusterRecordDocument, FleetAggregate,
    FleetLayout, InvalidClusterId,
};
pub use key::{Jwk, KeyEntry, KeyError, PublicKeyMaterial, SigningAlgorithm};
pub use key_set::KeySet;
pub use rotation::{observe, Observation, RetiringKey, RotationState, RotationTransition};
