//! Configuration and service data model
//!
//! The controller is configured with three JSON documents: the mesh peers
//! (one local peer, any number of remotes), the exported service set, and
//! the imported service set. All documents use camelCase field names.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Discovery port used when a remote does not specify one.
pub const DEFAULT_DISCOVERY_PORT: u32 = 15080;

/// Name prefix of the per-remote discovery service.
pub const DISCOVERY_SERVICE_PREFIX: &str = "federation-discovery-service-";

/// Complete controller configuration, assembled from the three input
/// documents.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FederationConfig {
    pub mesh_peers: MeshPeers,
    pub exported_service_set: ExportedServiceSet,
    pub imported_service_set: ImportedServiceSet,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MeshPeers {
    pub local: LocalPeer,
    pub remotes: Vec<RemotePeer>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LocalPeer {
    pub name: String,
    /// Namespace hosting the mesh control plane and the federation ingress.
    pub control_plane_namespace: String,
    pub ingress: IngressConfig,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IngressConfig {
    pub kind: IngressKind,
    /// Workload selector of the ingress gateway deployment.
    pub selector: HashMap<String, String>,
    pub port: GatewayPort,
}

/// Flavor of the ingress gateway fronting this mesh.
///
/// Router-style ingresses only accept RFC 952 compliant SNI values, so
/// traffic towards them uses a rewritten SNI form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IngressKind {
    Native,
    Rfc952Restricted,
}

impl Default for IngressKind {
    fn default() -> Self {
        IngressKind::Native
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayPort {
    pub name: String,
    pub number: u32,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemotePeer {
    pub name: String,
    /// Ingress addresses of the remote mesh, IP literals or DNS names.
    pub addresses: Vec<String>,
    /// Network label the remote's endpoints are reachable on.
    pub network: String,
    pub discovery_port: Option<u32>,
    /// Ingress flavor on the remote side; selects the SNI form used when
    /// dialing it.
    pub ingress_kind: IngressKind,
}

impl RemotePeer {
    /// Discovery port, falling back to [`DEFAULT_DISCOVERY_PORT`].
    pub fn port(&self) -> u32 {
        match self.discovery_port {
            Some(p) if p > 0 => p,
            _ => DEFAULT_DISCOVERY_PORT,
        }
    }

    /// Name of the local service fronting this remote's discovery endpoint.
    pub fn service_name(&self) -> String {
        format!("{}{}", DISCOVERY_SERVICE_PREFIX, self.name)
    }

    /// Cluster-local FQDN of the discovery service in the given namespace.
    pub fn service_fqdn(&self, namespace: &str) -> String {
        format!("{}.{}.svc.cluster.local", self.service_name(), namespace)
    }
}

/// Selector over service labels. Matches when every entry is present on the
/// service with an equal value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LabelSelector {
    pub match_labels: HashMap<String, String>,
}

impl LabelSelector {
    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
    }
}

/// Selectors choosing which local services are announced to remote peers.
/// An empty selector list exports nothing.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExportedServiceSet {
    pub selectors: Vec<LabelSelector>,
}

impl ExportedServiceSet {
    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        self.selectors.iter().any(|s| s.matches(labels))
    }
}

/// Selectors choosing which remote announcements are materialized locally.
/// An empty selector list imports everything.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImportedServiceSet {
    pub selectors: Vec<LabelSelector>,
}

impl ImportedServiceSet {
    pub fn permits(&self, labels: &HashMap<String, String>) -> bool {
        self.selectors.is_empty() || self.selectors.iter().any(|s| s.matches(labels))
    }
}

/// A service as announced across the federation stream.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FederatedService {
    /// Cluster-local hostname in the exporting mesh, e.g.
    /// `billing.ns1.svc.cluster.local`.
    pub hostname: String,
    pub labels: HashMap<String, String>,
    pub ports: Vec<ServicePort>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServicePort {
    pub name: String,
    pub number: u32,
    pub protocol: String,
    pub target_port: u32,
}

/// A service as observed in the local cluster catalog.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LocalService {
    pub name: String,
    pub namespace: String,
    pub labels: HashMap<String, String>,
    pub ports: Vec<ServicePort>,
}

impl LocalService {
    pub fn hostname(&self) -> String {
        format!("{}.{}.svc.cluster.local", self.name, self.namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_remote_peer_defaults() {
        let remote: RemotePeer =
            serde_json::from_str(r#"{"name":"east","addresses":["10.0.0.1"]}"#).unwrap();
        assert_eq!(remote.port(), DEFAULT_DISCOVERY_PORT);
        assert_eq!(remote.service_name(), "federation-discovery-service-east");
        assert_eq!(
            remote.service_fqdn("istio-system"),
            "federation-discovery-service-east.istio-system.svc.cluster.local"
        );
        assert_eq!(remote.ingress_kind, IngressKind::Native);
    }

    #[test]
    fn test_remote_peer_explicit_port() {
        let remote: RemotePeer =
            serde_json::from_str(r#"{"name":"east","discoveryPort":15443}"#).unwrap();
        assert_eq!(remote.port(), 15443);
    }

    #[test]
    fn test_ingress_kind_wire_form() {
        let kind: IngressKind = serde_json::from_str(r#""rfc952-restricted""#).unwrap();
        assert_eq!(kind, IngressKind::Rfc952Restricted);
        assert_eq!(
            serde_json::to_string(&IngressKind::Native).unwrap(),
            r#""native""#
        );
    }

    #[test]
    fn test_mesh_peers_parsing() {
        let doc = r#"{
            "local": {
                "name": "west",
                "controlPlaneNamespace": "istio-system",
                "ingress": {
                    "kind": "native",
                    "selector": {"istio": "ingressgateway"},
                    "port": {"name": "tls-federation", "number": 15443}
                }
            },
            "remotes": [
                {"name": "east", "addresses": ["203.0.113.7"], "network": "east-network"}
            ]
        }"#;
        let peers: MeshPeers = serde_json::from_str(doc).unwrap();
        assert_eq!(peers.local.name, "west");
        assert_eq!(peers.local.ingress.port.number, 15443);
        assert_eq!(peers.remotes.len(), 1);
        assert_eq!(peers.remotes[0].network, "east-network");
    }

    #[test]
    fn test_export_selectors_empty_exports_nothing() {
        let set = ExportedServiceSet::default();
        assert!(!set.matches(&labels(&[("export", "true")])));
    }

    #[test]
    fn test_import_selectors_empty_permits_everything() {
        let set = ImportedServiceSet::default();
        assert!(set.permits(&labels(&[("anything", "goes")])));
    }

    #[test]
    fn test_selector_matching_is_subset() {
        let selector = LabelSelector {
            match_labels: labels(&[("app", "billing")]),
        };
        assert!(selector.matches(&labels(&[("app", "billing"), ("tier", "backend")])));
        assert!(!selector.matches(&labels(&[("app", "payments")])));
    }

    #[test]
    fn test_local_service_hostname() {
        let svc = LocalService {
            name: "billing".to_string(),
            namespace: "ns1".to_string(),
            ..Default::default()
        };
        assert_eq!(svc.hostname(), "billing.ns1.svc.cluster.local");
    }
}
