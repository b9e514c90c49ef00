//! Outbound discovery client
//!
//! Dials a remote peer's federation discovery endpoint and consumes its
//! full-state announcements over a single bidirectional stream. Responses
//! are dispatched to per-type handlers synchronously in the receive loop,
//! so a slow handler exerts backpressure on the stream instead of racing
//! concurrent store writes. The client never redials on its own; stream
//! loss surfaces as an error to the supervisor.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use meshfed_api::grpc::proto;
use meshfed_api::grpc::FederationDiscoveryClient;
use meshfed_api::model::ImportedServiceSet;
use meshfed_common::{FederationError, Result};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::snapshot;
use crate::store::ImportedServiceStore;

/// Dial timeout towards a remote discovery endpoint.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Initial HTTP/2 stream and connection window size.
pub const INITIAL_WINDOW_SIZE: u32 = 1024 * 1024;

/// Lifecycle of one discovery client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Dialing,
    Streaming,
    Closed,
}

/// Handles the resource payloads of one response type.
pub trait ResponseHandler: Send + Sync {
    fn handle(&self, resources: &[proto::Resource]) -> Result<()>;
}

/// Materializes federated service announcements into the imported service
/// store, filtered through the import selectors.
pub struct ImportHandler {
    remote_name: String,
    imports: ImportedServiceSet,
    store: Arc<ImportedServiceStore>,
}

impl ImportHandler {
    pub fn new(
        remote_name: impl Into<String>,
        imports: ImportedServiceSet,
        store: Arc<ImportedServiceStore>,
    ) -> Self {
        Self {
            remote_name: remote_name.into(),
            imports,
            store,
        }
    }
}

impl ResponseHandler for ImportHandler {
    fn handle(&self, resources: &[proto::Resource]) -> Result<()> {
        let services = snapshot::decode_services(resources)?;
        let announced = services.len();
        let imported: Vec<_> = services
            .into_iter()
            .filter(|s| self.imports.permits(&s.labels))
            .collect();
        debug!(
            remote = %self.remote_name,
            announced,
            imported = imported.len(),
            "materialized federated services"
        );
        self.store.replace(&self.remote_name, imported);
        Ok(())
    }
}

/// Acknowledgment for a received response, echoing its server-assigned
/// nonce.
fn ack_for(response: &proto::DiscoveryResponse) -> proto::DiscoveryRequest {
    proto::DiscoveryRequest {
        type_url: response.type_url.clone(),
        response_nonce: response.nonce.clone(),
        error_detail: String::new(),
    }
}

pub struct DiscoveryClient {
    addr: String,
    handlers: HashMap<String, Arc<dyn ResponseHandler>>,
    state: ClientState,
}

impl DiscoveryClient {
    /// `addr` is a full endpoint URI, e.g. `http://10.0.0.1:15080`.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            handlers: HashMap::new(),
            state: ClientState::Disconnected,
        }
    }

    /// Register a handler and subscribe to its resource type.
    pub fn subscribe(
        mut self,
        type_url: impl Into<String>,
        handler: Arc<dyn ResponseHandler>,
    ) -> Self {
        self.handlers.insert(type_url.into(), handler);
        self
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    async fn dial(&self) -> Result<tonic::transport::Channel> {
        let endpoint = tonic::transport::Endpoint::from_shared(self.addr.clone())?
            .connect_timeout(CONNECT_TIMEOUT)
            .initial_stream_window_size(INITIAL_WINDOW_SIZE)
            .initial_connection_window_size(INITIAL_WINDOW_SIZE);
        Ok(endpoint.connect().await?)
    }

    /// Dial the peer and consume the stream until it closes, fails, or
    /// shutdown is signalled.
    pub async fn run(&mut self, shutdown: broadcast::Receiver<()>) -> Result<()> {
        let result = self.run_stream(shutdown).await;
        self.state = ClientState::Closed;
        result
    }

    async fn run_stream(&mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        self.state = ClientState::Dialing;
        let channel = self.dial().await?;
        let mut client =
            FederationDiscoveryClient::new(channel).max_decoding_message_size(i32::MAX as usize);

        let (tx, rx) = mpsc::channel::<proto::DiscoveryRequest>(64);
        let mut inbound = client
            .stream_federated_resources(ReceiverStream::new(rx))
            .await?
            .into_inner();
        self.state = ClientState::Streaming;
        info!(peer = %self.addr, "discovery stream established");

        let mut type_urls: Vec<&String> = self.handlers.keys().collect();
        type_urls.sort_unstable();
        for type_url in type_urls {
            let request = proto::DiscoveryRequest {
                type_url: type_url.clone(),
                ..Default::default()
            };
            tx.send(request)
                .await
                .map_err(|_| FederationError::ChannelClosed)?;
        }

        loop {
            tokio::select! {
                message = tokio_stream::StreamExt::next(&mut inbound) => match message {
                    Some(Ok(response)) => {
                        self.dispatch(&response);
                        tx.send(ack_for(&response))
                            .await
                            .map_err(|_| FederationError::ChannelClosed)?;
                    }
                    Some(Err(status)) => {
                        warn!(peer = %self.addr, error = %status, "discovery stream failed");
                        return Err(status.into());
                    }
                    None => {
                        info!(peer = %self.addr, "discovery stream closed by server");
                        return Ok(());
                    }
                },
                _ = shutdown.recv() => {
                    info!(peer = %self.addr, "shutdown requested, closing discovery stream");
                    return Ok(());
                }
            }
        }
    }

    fn dispatch(&self, response: &proto::DiscoveryResponse) {
        match self.handlers.get(&response.type_url) {
            Some(handler) => {
                debug!(
                    peer = %self.addr,
                    type_url = %response.type_url,
                    nonce = %response.nonce,
                    resources = response.resources.len(),
                    "received discovery response"
                );
                if let Err(e) = handler.handle(&response.resources) {
                    warn!(
                        peer = %self.addr,
                        type_url = %response.type_url,
                        error = %e,
                        "handler failed, keeping previous state"
                    );
                }
            }
            None => {
                warn!(
                    peer = %self.addr,
                    type_url = %response.type_url,
                    "no handler registered for resource type"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshfed_api::grpc::FEDERATED_SERVICE_TYPE_URL;
    use meshfed_api::model::{FederatedService, LabelSelector};

    fn announcement(services: Vec<FederatedService>) -> proto::DiscoveryResponse {
        let mut resources = Vec::new();
        for service in &services {
            resources.push(proto::Resource {
                type_url: FEDERATED_SERVICE_TYPE_URL.to_string(),
                value: serde_json::to_vec(service).unwrap(),
            });
        }
        proto::DiscoveryResponse {
            type_url: FEDERATED_SERVICE_TYPE_URL.to_string(),
            nonce: "n-1".to_string(),
            resources,
        }
    }

    fn labeled(hostname: &str, labels: &[(&str, &str)]) -> FederatedService {
        FederatedService {
            hostname: hostname.to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_ack_echoes_nonce() {
        let response = announcement(vec![]);
        let ack = ack_for(&response);
        assert_eq!(ack.type_url, FEDERATED_SERVICE_TYPE_URL);
        assert_eq!(ack.response_nonce, "n-1");
        assert!(ack.error_detail.is_empty());
    }

    #[test]
    fn test_import_handler_replaces_store() {
        let store = Arc::new(ImportedServiceStore::new());
        let handler = ImportHandler::new("east", ImportedServiceSet::default(), store.clone());

        let response = announcement(vec![labeled("a.ns.svc.cluster.local", &[])]);
        handler.handle(&response.resources).unwrap();
        assert_eq!(store.from("east").len(), 1);

        let response = announcement(vec![
            labeled("b.ns.svc.cluster.local", &[]),
            labeled("c.ns.svc.cluster.local", &[]),
        ]);
        handler.handle(&response.resources).unwrap();
        let current = store.from("east");
        assert_eq!(current.len(), 2);
        assert!(current.iter().all(|s| s.hostname != "a.ns.svc.cluster.local"));
    }

    #[test]
    fn test_import_handler_applies_selectors() {
        let store = Arc::new(ImportedServiceStore::new());
        let imports = ImportedServiceSet {
            selectors: vec![LabelSelector {
                match_labels: [("tier".to_string(), "backend".to_string())].into(),
            }],
        };
        let handler = ImportHandler::new("east", imports, store.clone());

        let response = announcement(vec![
            labeled("a.ns.svc.cluster.local", &[("tier", "backend")]),
            labeled("b.ns.svc.cluster.local", &[("tier", "frontend")]),
        ]);
        handler.handle(&response.resources).unwrap();

        let current = store.from("east");
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].hostname, "a.ns.svc.cluster.local");
    }

    #[test]
    fn test_malformed_payload_keeps_previous_state() {
        let store = Arc::new(ImportedServiceStore::new());
        store.replace("east", vec![labeled("a.ns.svc.cluster.local", &[])]);
        let handler = ImportHandler::new("east", ImportedServiceSet::default(), store.clone());

        let resources = vec![proto::Resource {
            type_url: FEDERATED_SERVICE_TYPE_URL.to_string(),
            value: b"garbage".to_vec(),
        }];
        assert!(handler.handle(&resources).is_err());
        assert_eq!(store.from("east").len(), 1);
    }

    #[test]
    fn test_unknown_type_is_dropped() {
        let store = Arc::new(ImportedServiceStore::new());
        let client = DiscoveryClient::new("http://127.0.0.1:15080").subscribe(
            FEDERATED_SERVICE_TYPE_URL,
            Arc::new(ImportHandler::new(
                "east",
                ImportedServiceSet::default(),
                store.clone(),
            )),
        );

        let response = proto::DiscoveryResponse {
            type_url: "federation.meshfed.io/v1alpha1/Unknown".to_string(),
            nonce: "n-2".to_string(),
            resources: vec![],
        };
        client.dispatch(&response);
        assert!(store.is_empty());
        assert_eq!(client.state(), ClientState::Disconnected);
    }
}
