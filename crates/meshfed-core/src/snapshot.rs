//! Full-state resource snapshots
//!
//! A snapshot captures the complete exported (or announced) state for one
//! resource type at a point in time. Versions come from a process-wide
//! monotonic counter so consumers can tell pushes apart.

use std::sync::atomic::{AtomicU64, Ordering};

use meshfed_api::grpc::proto;
use meshfed_api::model::FederatedService;
use meshfed_common::{FederationError, Result};

static VERSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate the next snapshot version.
pub fn next_version() -> String {
    format!("v{}", VERSION_COUNTER.fetch_add(1, Ordering::SeqCst) + 1)
}

/// Point-in-time full state for one resource type.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSnapshot {
    pub type_url: String,
    pub version: String,
    pub services: Vec<FederatedService>,
    /// Creation timestamp, milliseconds since the epoch.
    pub created_at: i64,
}

impl ResourceSnapshot {
    pub fn new(type_url: impl Into<String>, services: Vec<FederatedService>) -> Self {
        Self {
            type_url: type_url.into(),
            version: next_version(),
            services,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Encode this snapshot as a wire response, one resource per service.
    pub fn to_response(&self, nonce: &str) -> Result<proto::DiscoveryResponse> {
        let mut resources = Vec::with_capacity(self.services.len());
        for service in &self.services {
            let value = serde_json::to_vec(service).map_err(|e| {
                FederationError::Protocol(format!("failed to encode federated service: {e}"))
            })?;
            resources.push(proto::Resource {
                type_url: self.type_url.clone(),
                value,
            });
        }
        Ok(proto::DiscoveryResponse {
            type_url: self.type_url.clone(),
            nonce: nonce.to_string(),
            resources,
        })
    }
}

/// Decode the resource payloads of a wire response back into services.
pub fn decode_services(resources: &[proto::Resource]) -> Result<Vec<FederatedService>> {
    resources
        .iter()
        .map(|r| {
            serde_json::from_slice(&r.value).map_err(|e| {
                FederationError::Protocol(format!("malformed federated service payload: {e}"))
            })
        })
        .collect()
}
