//! Long-running services
//!
//! The Bridge and FleetAggregator run only on the leader; the Publisher runs
//! on every replica. The controller wires them to configuration and
//! supervises them until shutdown.

pub mod aggregator;
pub mod bridge;
pub mod controller;
pub mod notifications;
pub mod publisher;

pub use aggregator::{AggregateReport, AggregatorSettings, FleetAggregator};
pub use bridge::{Bridge, BridgeSettings, PollOutcome, PollReport};
pub use controller::{validate_issuer, Controller};
pub use notifications::{RotationEvent, RotationNotifier};
pub use publisher::{PublicationTarget, PublishReport, Publisher};
