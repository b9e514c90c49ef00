//! Cluster catalog seam
//!
//! The controller never talks to the cluster API directly; an injected
//! [`ServiceLister`] supplies the local service inventory. Absence is
//! control flow here (`Ok(None)`), only transport or permission failures
//! surface as errors.

use std::collections::HashMap;

use meshfed_api::model::{LabelSelector, LocalService};
use meshfed_common::Result;
use parking_lot::RwLock;

/// Read access to the local cluster's services.
pub trait ServiceLister: Send + Sync {
    /// All services matching the selector.
    fn list(&self, selector: &LabelSelector) -> Result<Vec<LocalService>>;

    /// Lookup by namespace and name. `Ok(None)` when the service does not
    /// exist.
    fn get(&self, namespace: &str, name: &str) -> Result<Option<LocalService>>;
}

/// Catalog backed by a plain map, for tests and local wiring.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    services: RwLock<HashMap<(String, String), LocalService>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, service: LocalService) {
        self.services
            .write()
            .insert((service.namespace.clone(), service.name.clone()), service);
    }

    pub fn remove(&self, namespace: &str, name: &str) {
        self.services
            .write()
            .remove(&(namespace.to_string(), name.to_string()));
    }
}

impl ServiceLister for InMemoryCatalog {
    fn list(&self, selector: &LabelSelector) -> Result<Vec<LocalService>> {
        let services = self.services.read();
        let mut matched: Vec<LocalService> = services
            .values()
            .filter(|s| selector.matches(&s.labels))
            .cloned()
            .collect();
        // Stable order keeps downstream synthesis idempotent.
        matched.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        Ok(matched)
    }

    fn get(&self, namespace: &str, name: &str) -> Result<Option<LocalService>> {
        Ok(self
            .services
            .read()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(name: &str, namespace: &str, labels: &[(&str, &str)]) -> LocalService {
        LocalService {
            name: name.to_string(),
            namespace: namespace.to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_list_filters_and_sorts() {
        let catalog = InMemoryCatalog::new();
        catalog.upsert(service("b", "ns2", &[("export", "true")]));
        catalog.upsert(service("a", "ns1", &[("export", "true")]));
        catalog.upsert(service("c", "ns1", &[("export", "false")]));

        let selector = LabelSelector {
            match_labels: [("export".to_string(), "true".to_string())].into(),
        };
        let listed = catalog.list(&selector).unwrap();
        let names: Vec<&str> = listed.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_get_absent_is_none() {
        let catalog = InMemoryCatalog::new();
        assert!(catalog.get("ns1", "ghost").unwrap().is_none());

        catalog.upsert(service("svc", "ns1", &[]));
        assert!(catalog.get("ns1", "svc").unwrap().is_some());
        catalog.remove("ns1", "svc");
        assert!(catalog.get("ns1", "svc").unwrap().is_none());
    }
}
