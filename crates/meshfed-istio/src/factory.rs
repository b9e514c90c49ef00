//! Config synthesis
//!
//! Pure transformation from the controller's current state into the
//! desired Istio objects. Calling any method twice against unchanged state
//! yields deeply equal output, so the caller can diff instead of blindly
//! re-applying.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use meshfed_api::model::{
    FederationConfig, IngressKind, LabelSelector, LocalService, RemotePeer, ServicePort,
    DEFAULT_DISCOVERY_PORT, DISCOVERY_SERVICE_PREFIX,
};
use meshfed_common::{FederationError, Result};
use meshfed_core::catalog::ServiceLister;
use meshfed_core::store::ImportedServiceStore;
use tracing::warn;

use crate::net::{is_ip, resolve, router_compatible_sni, separate_with_dash, service_name_and_ns};
use crate::types::{
    ApplyTo, ClientTlsMode, ClientTlsSettings, DestinationRule, DestinationRuleSpec,
    EnvoyConfigObjectMatch, EnvoyConfigObjectPatch, EnvoyFilter, EnvoyFilterSpec, FilterChainMatch,
    Gateway, GatewaySpec, ListenerMatch, Location, ObjectMeta, Patch, PatchOperation, Port,
    PortSelector, PortTrafficPolicy, Resolution, Server, ServerTlsMode, ServerTlsSettings,
    ServiceEntry, ServiceEntrySpec, TrafficPolicy, WorkloadEntry, WorkloadEntrySpec,
    WorkloadSelector, FEDERATION_INGRESS_GATEWAY_NAME, TLS_MODE_ISTIO, TLS_MODE_LABEL,
};

/// All synthesized objects for one pass.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredState {
    pub destination_rules: Vec<DestinationRule>,
    pub ingress_gateway: Gateway,
    pub envoy_filters: Vec<EnvoyFilter>,
    pub service_entries: Vec<ServiceEntry>,
    pub workload_entries: Vec<WorkloadEntry>,
}

impl DesiredState {
    pub fn object_count(&self) -> usize {
        self.destination_rules.len()
            + 1
            + self.envoy_filters.len()
            + self.service_entries.len()
            + self.workload_entries.len()
    }
}

pub struct ConfigFactory {
    cfg: FederationConfig,
    lister: Arc<dyn ServiceLister>,
    store: Arc<ImportedServiceStore>,
}

impl ConfigFactory {
    pub fn new(
        cfg: FederationConfig,
        lister: Arc<dyn ServiceLister>,
        store: Arc<ImportedServiceStore>,
    ) -> Self {
        Self { cfg, lister, store }
    }

    fn control_plane_namespace(&self) -> &str {
        &self.cfg.mesh_peers.local.control_plane_namespace
    }

    fn list_services(&self, selector: &LabelSelector) -> Result<Vec<LocalService>> {
        self.lister.list(selector).map_err(|e| {
            FederationError::ClusterApi(format!(
                "error listing services (selector={:?}): {e}",
                selector.match_labels
            ))
        })
    }

    /// Run every synthesis method against the current state.
    pub fn desired_state(&self) -> Result<DesiredState> {
        Ok(DesiredState {
            destination_rules: self.destination_rules(),
            ingress_gateway: self.ingress_gateway()?,
            envoy_filters: self.envoy_filters()?,
            service_entries: self.service_entries()?,
            workload_entries: self.workload_entries()?,
        })
    }

    /// DestinationRules rewriting the client SNI towards RFC 952 restricted
    /// remote ingresses. Remotes with native ingresses need none.
    pub fn destination_rules(&self) -> Vec<DestinationRule> {
        let namespace = self.control_plane_namespace().to_string();
        let mut rules = Vec::new();
        let mut created: HashSet<String> = HashSet::new();

        for remote in &self.cfg.mesh_peers.remotes {
            if remote.ingress_kind != IngressKind::Rfc952Restricted {
                continue;
            }

            let controller_fqdn = remote.service_fqdn(&namespace);
            rules.push(DestinationRule {
                metadata: ObjectMeta::new(
                    format!("mtls-sni-{}", separate_with_dash(&controller_fqdn)),
                    &namespace,
                    &remote.name,
                ),
                spec: DestinationRuleSpec {
                    host: controller_fqdn,
                    traffic_policy: TrafficPolicy {
                        tls: Some(ClientTlsSettings {
                            mode: ClientTlsMode::IstioMutual,
                            sni: router_compatible_sni(
                                &remote.service_name(),
                                &namespace,
                                remote.port(),
                            ),
                        }),
                        port_level_settings: Vec::new(),
                    },
                },
            });

            for service in self.store.from(&remote.name) {
                let name = format!("mtls-sni-{}", separate_with_dash(&service.hostname));
                if created.contains(&name) {
                    // The same service exported by several remotes is assumed
                    // to be configured identically, so one rule is enough.
                    warn!(rule = %name, peer = %remote.name, "destination rule already created");
                    continue;
                }
                let (svc_name, svc_ns) = service_name_and_ns(&service.hostname);
                let port_level_settings = service
                    .ports
                    .iter()
                    .map(|port| PortTrafficPolicy {
                        port: PortSelector {
                            number: port.number,
                        },
                        tls: ClientTlsSettings {
                            mode: ClientTlsMode::IstioMutual,
                            sni: router_compatible_sni(svc_name, svc_ns, port.number),
                        },
                    })
                    .collect();
                rules.push(DestinationRule {
                    metadata: ObjectMeta::new(&name, &namespace, &remote.name),
                    spec: DestinationRuleSpec {
                        host: service.hostname.clone(),
                        traffic_policy: TrafficPolicy {
                            tls: None,
                            port_level_settings,
                        },
                    },
                });
                created.insert(name);
            }
        }

        rules
    }

    /// The single federation ingress Gateway admitting the local discovery
    /// service and every exported service. Hosts are sorted and deduplicated
    /// so unchanged state yields byte-identical output.
    pub fn ingress_gateway(&self) -> Result<Gateway> {
        let local = &self.cfg.mesh_peers.local;
        let mut hosts = vec![format!(
            "{}{}.{}.svc.cluster.local",
            DISCOVERY_SERVICE_PREFIX, local.name, local.control_plane_namespace
        )];
        for selector in &self.cfg.exported_service_set.selectors {
            for service in self.list_services(selector)? {
                hosts.push(service.hostname());
            }
        }
        hosts.sort();
        hosts.dedup();

        Ok(Gateway {
            metadata: ObjectMeta::new(
                FEDERATION_INGRESS_GATEWAY_NAME,
                &local.control_plane_namespace,
                &local.name,
            ),
            spec: GatewaySpec {
                selector: local.ingress.selector.clone(),
                servers: vec![Server {
                    hosts,
                    port: Port {
                        number: local.ingress.port.number,
                        name: local.ingress.port.name.clone(),
                        protocol: "TLS".to_string(),
                    },
                    tls: ServerTlsSettings {
                        mode: ServerTlsMode::AutoPassthrough,
                    },
                }],
            },
        })
    }

    /// EnvoyFilters adding RFC 952 compatible SNI matches to the federation
    /// ingress filter chains. Empty when the local ingress is native.
    pub fn envoy_filters(&self) -> Result<Vec<EnvoyFilter>> {
        let local = &self.cfg.mesh_peers.local;
        if local.ingress.kind != IngressKind::Rfc952Restricted {
            return Ok(Vec::new());
        }

        let mut filters = vec![self.envoy_filter(
            &format!("{}{}", DISCOVERY_SERVICE_PREFIX, local.name),
            &local.control_plane_namespace,
            DEFAULT_DISCOVERY_PORT,
        )?];
        for selector in &self.cfg.exported_service_set.selectors {
            for service in self.list_services(selector)? {
                for port in &service.ports {
                    filters.push(self.envoy_filter(&service.name, &service.namespace, port.number)?);
                }
            }
        }
        Ok(filters)
    }

    fn envoy_filter(&self, name: &str, namespace: &str, port: u32) -> Result<EnvoyFilter> {
        let local = &self.cfg.mesh_peers.local;
        let patch_value: serde_json::Value = serde_json::from_str(&format!(
            r#"{{"filter_chain_match":{{"server_names":["{}"]}}}}"#,
            router_compatible_sni(name, namespace, port)
        ))?;

        Ok(EnvoyFilter {
            metadata: ObjectMeta::new(
                format!("sni-{name}-{namespace}-{port}"),
                &local.control_plane_namespace,
                &local.name,
            ),
            spec: EnvoyFilterSpec {
                workload_selector: WorkloadSelector {
                    labels: local.ingress.selector.clone(),
                },
                config_patches: vec![EnvoyConfigObjectPatch {
                    apply_to: ApplyTo::FilterChain,
                    match_: EnvoyConfigObjectMatch {
                        listener: ListenerMatch {
                            name: format!("0.0.0.0_{}", local.ingress.port.number),
                            filter_chain: FilterChainMatch {
                                sni: format!(
                                    "outbound_.{port}_._.{name}.{namespace}.svc.cluster.local"
                                ),
                            },
                        },
                    },
                    patch: Patch {
                        operation: PatchOperation::Merge,
                        value: patch_value,
                    },
                }],
            },
        })
    }

    /// ServiceEntries for each remote's discovery endpoint and for imported
    /// services that have no local counterpart. Entries for the same
    /// hostname exported by several remotes are merged: the first exporting
    /// remote fixes the entry shape, later remotes contribute endpoints.
    pub fn service_entries(&self) -> Result<Vec<ServiceEntry>> {
        let namespace = self.control_plane_namespace().to_string();
        let mut entries = Vec::new();
        let mut by_hostname: BTreeMap<String, ServiceEntry> = BTreeMap::new();

        for remote in &self.cfg.mesh_peers.remotes {
            if remote.addresses.is_empty() {
                continue;
            }

            entries.push(self.controller_service_entry(remote));

            let resolution = if is_ip(&remote.addresses[0]) {
                Resolution::Static
            } else {
                Resolution::Dns
            };

            for service in self.store.from(&remote.name) {
                let (svc_name, svc_ns) = service_name_and_ns(&service.hostname);
                if self.lister.get(svc_ns, svc_name)?.is_some() {
                    // The service exists locally; WorkloadEntries extend it
                    // instead.
                    continue;
                }

                let endpoints: Vec<WorkloadEntrySpec> = remote
                    .addresses
                    .iter()
                    .map(|address| WorkloadEntrySpec {
                        address: address.clone(),
                        labels: with_tls_mode(&service.labels),
                        ports: ports_map(&service.ports, remote.port()),
                        network: remote.network.clone(),
                    })
                    .collect();

                match by_hostname.get_mut(&service.hostname) {
                    Some(existing) => {
                        if existing.spec.ports != service.ports {
                            warn!(
                                hostname = %service.hostname,
                                peer = %remote.name,
                                "imported service shape differs between remotes, keeping the first"
                            );
                        }
                        existing.spec.endpoints.extend(endpoints);
                    }
                    None => {
                        by_hostname.insert(
                            service.hostname.clone(),
                            ServiceEntry {
                                metadata: ObjectMeta::new(
                                    format!("import-{}-{}-{}", svc_name, svc_ns, remote.name),
                                    &namespace,
                                    &remote.name,
                                ),
                                spec: ServiceEntrySpec {
                                    hosts: vec![service.hostname.clone()],
                                    ports: service.ports.clone(),
                                    endpoints,
                                    location: Location::MeshInternal,
                                    resolution,
                                },
                            },
                        );
                    }
                }
            }
        }

        entries.extend(by_hostname.into_values());
        Ok(entries)
    }

    fn controller_service_entry(&self, remote: &RemotePeer) -> ServiceEntry {
        let namespace = self.control_plane_namespace();
        let endpoints = remote
            .addresses
            .iter()
            .map(|address| WorkloadEntrySpec {
                address: address.clone(),
                labels: HashMap::from([(TLS_MODE_LABEL.to_string(), TLS_MODE_ISTIO.to_string())]),
                ports: BTreeMap::from([("grpc".to_string(), remote.port())]),
                network: remote.network.clone(),
            })
            .collect();

        ServiceEntry {
            metadata: ObjectMeta::new(remote.service_name(), namespace, &remote.name),
            spec: ServiceEntrySpec {
                hosts: vec![remote.service_fqdn(namespace)],
                ports: vec![ServicePort {
                    name: "grpc".to_string(),
                    number: remote.port(),
                    protocol: "GRPC".to_string(),
                    target_port: 0,
                }],
                endpoints,
                location: Location::MeshInternal,
                resolution: if is_ip(&remote.addresses[0]) {
                    Resolution::Static
                } else {
                    Resolution::Dns
                },
            },
        }
    }

    /// WorkloadEntries extending locally existing services with the remote
    /// ingress endpoints. Remote addresses are expanded to IP literals.
    pub fn workload_entries(&self) -> Result<Vec<WorkloadEntry>> {
        let mut entries = Vec::new();

        for remote in &self.cfg.mesh_peers.remotes {
            for service in self.store.from(&remote.name) {
                let (svc_name, svc_ns) = service_name_and_ns(&service.hostname);
                if self.lister.get(svc_ns, svc_name)?.is_none() {
                    continue;
                }
                for (idx, ip) in resolve(&remote.addresses).iter().enumerate() {
                    entries.push(WorkloadEntry {
                        metadata: ObjectMeta::new(
                            format!("import-{}-{}-{}", remote.name, svc_name, idx),
                            svc_ns,
                            &remote.name,
                        ),
                        spec: WorkloadEntrySpec {
                            address: ip.clone(),
                            labels: with_tls_mode(&service.labels),
                            ports: ports_map(&service.ports, remote.port()),
                            network: remote.network.clone(),
                        },
                    });
                }
            }
        }
        Ok(entries)
    }
}

/// Every named port of the imported service targets the remote's single
/// ingress port.
fn ports_map(ports: &[ServicePort], remote_port: u32) -> BTreeMap<String, u32> {
    ports
        .iter()
        .map(|port| (port.name.clone(), remote_port))
        .collect()
}

fn with_tls_mode(labels: &HashMap<String, String>) -> HashMap<String, String> {
    let mut merged = labels.clone();
    merged.insert(TLS_MODE_LABEL.to_string(), TLS_MODE_ISTIO.to_string());
    merged
}
