//! Federation control-plane core
//!
//! This crate holds the moving parts of the controller: the per-remote
//! imported service store, the outbound discovery client with its response
//! handlers, the push-side discovery server, the bridge translating local
//! service watch events into full-state snapshots, and the catalog seam to
//! the cluster-resource collaborator.

pub mod bridge;
pub mod catalog;
pub mod client;
pub mod server;
pub mod snapshot;
pub mod store;

pub use bridge::{ExportWatchBridge, ServiceEvent};
pub use catalog::{InMemoryCatalog, ServiceLister};
pub use client::{ClientState, DiscoveryClient, ImportHandler, ResponseHandler};
pub use server::DiscoveryServer;
pub use snapshot::ResourceSnapshot;
pub use store::ImportedServiceStore;
