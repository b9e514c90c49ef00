//! Export watch bridge
//!
//! Turns local service watch events into full-state export snapshots for
//! the discovery server. The bridge keeps the current exported set (every
//! service matching at least one export selector) and emits the whole set
//! on each change. The snapshot channel is bounded and sends block, so the
//! bridge waits for the server's readiness signal before producing.

use std::collections::BTreeMap;

use meshfed_api::grpc::FEDERATED_SERVICE_TYPE_URL;
use meshfed_api::model::{ExportedServiceSet, FederatedService, LocalService};
use meshfed_common::{FederationError, Result};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info};

use crate::snapshot::ResourceSnapshot;

/// Watch event delivered by the upstream cluster-resource collaborator.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceEvent {
    Upserted(LocalService),
    Deleted { namespace: String, name: String },
}

/// Convert a local service into its federated announcement shape.
pub fn to_federated(service: &LocalService) -> FederatedService {
    FederatedService {
        hostname: service.hostname(),
        labels: service.labels.clone(),
        ports: service.ports.clone(),
    }
}

pub struct ExportWatchBridge {
    exports: ExportedServiceSet,
    exported: BTreeMap<(String, String), LocalService>,
    events: mpsc::Receiver<ServiceEvent>,
    snapshots: mpsc::Sender<ResourceSnapshot>,
}

impl ExportWatchBridge {
    pub fn new(
        exports: ExportedServiceSet,
        events: mpsc::Receiver<ServiceEvent>,
        snapshots: mpsc::Sender<ResourceSnapshot>,
    ) -> Self {
        Self {
            exports,
            exported: BTreeMap::new(),
            events,
            snapshots,
        }
    }

    /// Seed the exported set before the event loop starts, typically from a
    /// startup list of the export selectors.
    pub fn with_initial(mut self, services: Vec<LocalService>) -> Self {
        for service in services {
            if self.exports.matches(&service.labels) {
                self.exported
                    .insert((service.namespace.clone(), service.name.clone()), service);
            }
        }
        self
    }

    /// Consume events until the channel closes or shutdown is signalled.
    /// Waits for server readiness, then emits the initial full state before
    /// processing events.
    pub async fn run(
        mut self,
        mut ready: watch::Receiver<bool>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        if ready.wait_for(|ready| *ready).await.is_err() {
            return Err(FederationError::ChannelClosed);
        }
        info!(exported = self.exported.len(), "discovery server ready, export bridge running");
        self.emit().await?;

        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => {
                        if self.apply(event) {
                            self.emit().await?;
                        }
                    }
                    None => {
                        info!("service event channel closed, export bridge stopping");
                        return Ok(());
                    }
                },
                _ = shutdown.recv() => {
                    info!("shutdown requested, export bridge stopping");
                    return Ok(());
                }
            }
        }
    }

    /// Apply one event to the exported set. Returns whether the set
    /// changed.
    fn apply(&mut self, event: ServiceEvent) -> bool {
        match event {
            ServiceEvent::Upserted(service) => {
                let key = (service.namespace.clone(), service.name.clone());
                if self.exports.matches(&service.labels) {
                    let changed = self.exported.get(&key) != Some(&service);
                    self.exported.insert(key, service);
                    changed
                } else {
                    // A label change can move a service out of the set.
                    self.exported.remove(&key).is_some()
                }
            }
            ServiceEvent::Deleted { namespace, name } => {
                self.exported.remove(&(namespace, name)).is_some()
            }
        }
    }

    async fn emit(&self) -> Result<()> {
        let services: Vec<FederatedService> = self.exported.values().map(to_federated).collect();
        let snapshot = ResourceSnapshot::new(FEDERATED_SERVICE_TYPE_URL, services);
        debug!(
            version = %snapshot.version,
            services = snapshot.services.len(),
            "emitting export snapshot"
        );
        self.snapshots
            .send(snapshot)
            .await
            .map_err(|_| FederationError::ChannelClosed)
    }
}
