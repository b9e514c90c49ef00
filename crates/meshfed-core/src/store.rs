//! Imported service store
//!
//! Keeps the most recent full-state announcement from every remote peer.
//! Announcements are full replacements, never increments, so writes swap
//! the whole entry under its shard lock and reads hand out clones.

use dashmap::DashMap;
use meshfed_api::model::FederatedService;

#[derive(Debug, Default)]
pub struct ImportedServiceStore {
    services: DashMap<String, Vec<FederatedService>>,
}

impl ImportedServiceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored state for a remote with a new full state.
    pub fn replace(&self, remote: &str, services: Vec<FederatedService>) {
        self.services.insert(remote.to_string(), services);
    }

    /// Snapshot of the services imported from a remote. Unknown remotes
    /// yield an empty list.
    pub fn from(&self, remote: &str) -> Vec<FederatedService> {
        self.services
            .get(remote)
            .map(|entry| entry.clone())
            .unwrap_or_default()
    }

    /// Drop the state of a remote entirely.
    pub fn remove(&self, remote: &str) {
        self.services.remove(remote);
    }

    /// Names of remotes with stored state.
    pub fn remotes(&self) -> Vec<String> {
        self.services.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
