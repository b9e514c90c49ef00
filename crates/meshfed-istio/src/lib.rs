//! Istio Resource Synthesis
//!
//! This crate turns the controller's current state (configuration, imported
//! service store, local service catalog) into the Istio-shaped objects that
//! make federated traffic routable: DestinationRules, the federation
//! ingress Gateway, EnvoyFilters, ServiceEntries, and WorkloadEntries.
//! Synthesis is pure and idempotent; applying the objects to a cluster is
//! the caller's job.

pub mod factory;
pub mod net;
pub mod types;

pub use factory::{ConfigFactory, DesiredState};
