//! Input validation for the controller configuration documents
//!
//! Violations here are fatal at startup: the binary refuses to run with a
//! configuration it cannot honor.

use validator::ValidationError;

use crate::model::{FederationConfig, MeshPeers, RemotePeer};

/// Maximum length of a peer name (RFC 1123 label).
pub const MAX_PEER_NAME_LENGTH: usize = 63;

/// Validate a peer name
///
/// Peer names become part of generated object names and cluster-local
/// hostnames, so they must be RFC 1123 labels: non-empty, at most 63
/// characters, lowercase alphanumerics and hyphens, starting and ending
/// with an alphanumeric.
pub fn validate_peer_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::new("peer_name_empty"));
    }
    if name.len() > MAX_PEER_NAME_LENGTH {
        return Err(ValidationError::new("peer_name_too_long"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(ValidationError::new("peer_name_invalid_chars"));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(ValidationError::new("peer_name_invalid_edge"));
    }
    Ok(())
}

/// Validate a single remote peer entry
pub fn validate_remote(remote: &RemotePeer) -> Result<(), ValidationError> {
    validate_peer_name(&remote.name)?;
    if remote.addresses.iter().any(|a| a.is_empty()) {
        return Err(ValidationError::new("remote_address_empty"));
    }
    if let Some(port) = remote.discovery_port
        && port > u16::MAX as u32
    {
        return Err(ValidationError::new("remote_discovery_port_out_of_range"));
    }
    Ok(())
}

/// Validate the mesh peers document
pub fn validate_mesh_peers(peers: &MeshPeers) -> Result<(), ValidationError> {
    validate_peer_name(&peers.local.name)?;
    if peers.local.control_plane_namespace.is_empty() {
        return Err(ValidationError::new("control_plane_namespace_empty"));
    }
    if peers.local.ingress.port.number == 0 || peers.local.ingress.port.number > u16::MAX as u32 {
        return Err(ValidationError::new("ingress_port_out_of_range"));
    }
    for remote in &peers.remotes {
        validate_remote(remote)?;
    }
    let mut names: Vec<&str> = peers.remotes.iter().map(|r| r.name.as_str()).collect();
    names.sort_unstable();
    names.dedup();
    if names.len() != peers.remotes.len() {
        return Err(ValidationError::new("remote_name_duplicate"));
    }
    Ok(())
}

/// Validate the assembled configuration
pub fn validate_config(config: &FederationConfig) -> Result<(), ValidationError> {
    validate_mesh_peers(&config.mesh_peers)?;
    for selector in config
        .exported_service_set
        .selectors
        .iter()
        .chain(config.imported_service_set.selectors.iter())
    {
        if selector.match_labels.is_empty() {
            return Err(ValidationError::new("selector_empty"));
        }
        if selector
            .match_labels
            .iter()
            .any(|(k, _)| k.is_empty())
        {
            return Err(ValidationError::new("selector_key_empty"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GatewayPort, LabelSelector, LocalPeer};

    fn valid_peers() -> MeshPeers {
        MeshPeers {
            local: LocalPeer {
                name: "west".to_string(),
                control_plane_namespace: "istio-system".to_string(),
                ingress: crate::model::IngressConfig {
                    port: GatewayPort {
                        name: "tls-federation".to_string(),
                        number: 15443,
                    },
                    ..Default::default()
                },
            },
            remotes: vec![RemotePeer {
                name: "east".to_string(),
                addresses: vec!["203.0.113.7".to_string()],
                network: "east-network".to_string(),
                ..Default::default()
            }],
        }
    }

    #[test]
    fn test_validate_peer_name() {
        assert!(validate_peer_name("east").is_ok());
        assert!(validate_peer_name("east-2").is_ok());
        assert!(validate_peer_name("").is_err());
        assert!(validate_peer_name("East").is_err());
        assert!(validate_peer_name("-east").is_err());
        assert!(validate_peer_name("east-").is_err());
        assert!(validate_peer_name(&"x".repeat(64)).is_err());
    }

    #[test]
    fn test_validate_remote_rejects_bad_port() {
        let mut remote = RemotePeer {
            name: "east".to_string(),
            ..Default::default()
        };
        assert!(validate_remote(&remote).is_ok());

        remote.discovery_port = Some(70000);
        assert!(validate_remote(&remote).is_err());
    }

    #[test]
    fn test_validate_mesh_peers() {
        assert!(validate_mesh_peers(&valid_peers()).is_ok());

        let mut peers = valid_peers();
        peers.local.ingress.port.number = 0;
        assert!(validate_mesh_peers(&peers).is_err());

        let mut peers = valid_peers();
        peers.remotes.push(peers.remotes[0].clone());
        assert!(validate_mesh_peers(&peers).is_err());
    }

    #[test]
    fn test_validate_config_rejects_empty_selector() {
        let mut config = FederationConfig {
            mesh_peers: valid_peers(),
            ..Default::default()
        };
        assert!(validate_config(&config).is_ok());

        config
            .exported_service_set
            .selectors
            .push(LabelSelector::default());
        assert!(validate_config(&config).is_err());
    }
}
