//! Hostname and address helpers for synthesis

use std::net::{IpAddr, ToSocketAddrs};

use tracing::warn;

/// Whether the address is an IP literal.
pub fn is_ip(addr: &str) -> bool {
    addr.parse::<IpAddr>().is_ok()
}

/// Rewrite a hostname's dots to dashes, e.g.
/// `billing.ns1.svc.cluster.local` to `billing-ns1-svc-cluster-local`.
pub fn separate_with_dash(hostname: &str) -> String {
    hostname.split('.').collect::<Vec<_>>().join("-")
}

/// Service name and namespace from a cluster-local hostname. The namespace
/// is empty when the hostname has fewer than two labels.
pub fn service_name_and_ns(hostname: &str) -> (&str, &str) {
    let mut labels = hostname.split('.');
    (
        labels.next().unwrap_or_default(),
        labels.next().unwrap_or_default(),
    )
}

/// SNI form accepted by RFC 952 restricted ingresses: the port moves into
/// the first DNS label so every label stays alphanumeric-and-dashes.
pub fn router_compatible_sni(name: &str, namespace: &str, port: u32) -> String {
    format!("{name}-{port}.{namespace}.svc.cluster.local")
}

/// Expand addresses into IP literals. IPs pass through; DNS names are
/// resolved through the system resolver. The result is sorted and
/// deduplicated so repeated expansion of the same input stays stable, and
/// unresolvable names are skipped with a warning.
pub fn resolve(addresses: &[String]) -> Vec<String> {
    let mut ips = Vec::new();
    for addr in addresses {
        if is_ip(addr) {
            ips.push(addr.clone());
            continue;
        }
        match (addr.as_str(), 0u16).to_socket_addrs() {
            Ok(resolved) => ips.extend(resolved.map(|sa| sa.ip().to_string())),
            Err(e) => {
                warn!(address = %addr, error = %e, "failed to resolve address, skipping");
            }
        }
    }
    ips.sort_unstable();
    ips.dedup();
    ips
}
