//! Push-side discovery server
//!
//! Serves the federation stream to connected peers: registers every
//! connection, replays the latest snapshot on subscription, and fans out
//! new snapshots to all connections as they are published. Each connection
//! holds a latest-wins slot, so a slow peer skips intermediate snapshots
//! but always converges on the newest state. Request handling is
//! accept-only; acknowledgments are logged, never used to gate pushes.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use futures::Stream;
use meshfed_api::grpc::proto;
use meshfed_api::grpc::{FederationDiscovery, FederationDiscoveryServer};
use meshfed_common::{FederationError, Result};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::snapshot::ResourceSnapshot;

type ResponseStream = Pin<Box<dyn Stream<Item = std::result::Result<proto::DiscoveryResponse, Status>> + Send>>;

/// Per-connection channel capacity for outbound responses.
const PUSH_CHANNEL_CAPACITY: usize = 100;

/// Latest-wins push slot of one connection. `publish` replaces the pending
/// value; the connection's forwarder drains it at its own pace.
type PushSlot = watch::Sender<Option<proto::DiscoveryResponse>>;

#[derive(Debug, Default)]
struct ServerState {
    connections: DashMap<String, PushSlot>,
    /// Latest published snapshot per resource type, replayed to late
    /// subscribers.
    latest: DashMap<String, ResourceSnapshot>,
}

/// Discovery server shared between the transport layer and the snapshot
/// drain task. Cloning is cheap.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryServer {
    state: Arc<ServerState>,
}

impl DiscoveryServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, connection: &str, slot: PushSlot) {
        self.state.connections.insert(connection.to_string(), slot);
    }

    fn deregister(&self, connection: &str) {
        if self.state.connections.remove(connection).is_some() {
            info!(connection = %connection, "federation connection deregistered");
        }
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.len()
    }

    /// Push a snapshot to every connected peer and remember it for late
    /// subscribers. Each connection's slot holds only the newest response,
    /// so a peer that cannot keep up never pins stale state.
    pub fn publish(&self, snapshot: ResourceSnapshot) {
        let nonce = Uuid::new_v4().to_string();
        let response = match snapshot.to_response(&nonce) {
            Ok(response) => response,
            Err(e) => {
                error!(error = %e, type_url = %snapshot.type_url, "failed to encode snapshot");
                return;
            }
        };
        debug!(
            type_url = %snapshot.type_url,
            version = %snapshot.version,
            services = snapshot.services.len(),
            connections = self.state.connections.len(),
            "publishing snapshot"
        );
        self.state
            .latest
            .insert(snapshot.type_url.clone(), snapshot);

        let mut stale = Vec::new();
        for entry in self.state.connections.iter() {
            if entry.value().send(Some(response.clone())).is_err() {
                stale.push(entry.key().clone());
            }
        }
        for connection in stale {
            self.deregister(&connection);
        }
    }

    /// Handle one inbound request, returning a response to send when the
    /// request is an initial subscription for a known type.
    fn handle_request(
        &self,
        connection: &str,
        request: proto::DiscoveryRequest,
    ) -> Option<proto::DiscoveryResponse> {
        if !request.error_detail.is_empty() {
            warn!(
                connection = %connection,
                type_url = %request.type_url,
                error = %request.error_detail,
                "peer rejected previous response"
            );
            return None;
        }
        if !request.response_nonce.is_empty() {
            debug!(
                connection = %connection,
                type_url = %request.type_url,
                nonce = %request.response_nonce,
                "received ack"
            );
            return None;
        }

        let snapshot = self.state.latest.get(&request.type_url)?;
        let nonce = Uuid::new_v4().to_string();
        match snapshot.to_response(&nonce) {
            Ok(response) => {
                debug!(
                    connection = %connection,
                    type_url = %request.type_url,
                    version = %snapshot.version,
                    "replaying latest snapshot"
                );
                Some(response)
            }
            Err(e) => {
                error!(error = %e, type_url = %request.type_url, "failed to encode snapshot");
                None
            }
        }
    }
}

#[tonic::async_trait]
impl FederationDiscovery for DiscoveryServer {
    type StreamFederatedResourcesStream = ResponseStream;

    async fn stream_federated_resources(
        &self,
        request: Request<Streaming<proto::DiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::StreamFederatedResourcesStream>, Status> {
        let mut stream = request.into_inner();
        let server = self.clone();
        let connection = Uuid::new_v4().to_string();

        let (push_tx, mut push_rx) = watch::channel(None);
        server.register(&connection, push_tx);
        info!(connection = %connection, "federation stream established");

        let (tx, rx) = mpsc::channel(PUSH_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = tokio_stream::StreamExt::next(&mut stream) => match message {
                        Some(Ok(request)) => {
                            if let Some(response) = server.handle_request(&connection, request)
                                && tx.send(Ok(response)).await.is_err()
                            {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            error!(connection = %connection, error = %e, "error receiving discovery request");
                            break;
                        }
                        None => {
                            info!(connection = %connection, "federation stream closed");
                            break;
                        }
                    },
                    changed = push_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let pushed = push_rx.borrow_and_update().clone();
                        if let Some(response) = pushed
                            && tx.send(Ok(response)).await.is_err()
                        {
                            break;
                        }
                    }
                }
            }
            server.deregister(&connection);
        });

        let output_stream = ReceiverStream::new(rx);
        Ok(Response::new(Box::pin(output_stream) as ResponseStream))
    }
}

/// Run the discovery server: serve the gRPC transport and drain the bridge
/// channel into [`DiscoveryServer::publish`]. Readiness is signalled once
/// the drain loop is consuming, so producers can hold their first snapshot
/// until it will be accepted.
pub async fn serve_discovery(
    server: DiscoveryServer,
    addr: SocketAddr,
    mut snapshots: mpsc::Receiver<ResourceSnapshot>,
    ready: watch::Sender<bool>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let service = FederationDiscoveryServer::new(server.clone());
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let transport = tokio::spawn(
        tonic::transport::Server::builder()
            .add_service(service)
            .serve_with_shutdown(addr, async {
                let _ = stop_rx.await;
            }),
    );
    info!(addr = %addr, "federation discovery server listening");
    let _ = ready.send(true);

    loop {
        tokio::select! {
            snapshot = snapshots.recv() => match snapshot {
                Some(snapshot) => server.publish(snapshot),
                None => {
                    info!("snapshot channel closed, stopping discovery server");
                    break;
                }
            },
            _ = shutdown.recv() => {
                info!("shutdown requested, stopping discovery server");
                break;
            }
        }
    }

    let _ = stop_tx.send(());
    transport
        .await
        .map_err(|e| FederationError::Protocol(format!("transport task failed: {e}")))??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshfed_api::grpc::FEDERATED_SERVICE_TYPE_URL;
    use meshfed_api::model::FederatedService;

    fn snapshot(hostnames: &[&str]) -> ResourceSnapshot {
        ResourceSnapshot::new(
            FEDERATED_SERVICE_TYPE_URL,
            hostnames
                .iter()
                .map(|h| FederatedService {
                    hostname: h.to_string(),
                    ..Default::default()
                })
                .collect(),
        )
    }

    fn connect(
        server: &DiscoveryServer,
        id: &str,
    ) -> watch::Receiver<Option<proto::DiscoveryResponse>> {
        let (tx, rx) = watch::channel(None);
        server.register(id, tx);
        rx
    }

    fn pushed_hostname(response: &proto::DiscoveryResponse) -> String {
        let service: FederatedService =
            serde_json::from_slice(&response.resources[0].value).unwrap();
        service.hostname
    }

    #[tokio::test]
    async fn test_publish_fans_out() {
        let server = DiscoveryServer::new();
        let mut rx_a = connect(&server, "conn-a");
        let mut rx_b = connect(&server, "conn-b");

        server.publish(snapshot(&["a.ns.svc.cluster.local"]));

        rx_a.changed().await.unwrap();
        rx_b.changed().await.unwrap();
        let pushed_a = rx_a.borrow().clone().unwrap();
        let pushed_b = rx_b.borrow().clone().unwrap();
        assert_eq!(pushed_a.resources.len(), 1);
        assert_eq!(pushed_a.nonce, pushed_b.nonce);
        assert!(!pushed_a.nonce.is_empty());
    }

    #[tokio::test]
    async fn test_publish_deregisters_closed_connections() {
        let server = DiscoveryServer::new();
        let (tx, rx) = watch::channel(None);
        drop(rx);
        server.register("conn-a", tx);
        assert_eq!(server.connection_count(), 1);

        server.publish(snapshot(&[]));
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_slow_peer_converges_on_latest_snapshot() {
        let server = DiscoveryServer::new();
        let mut rx = connect(&server, "conn-a");

        // Two publishes before the peer drains anything.
        server.publish(snapshot(&["old.ns.svc.cluster.local"]));
        server.publish(snapshot(&["new.ns.svc.cluster.local"]));

        // The peer stays registered and observes the newest state, not the
        // state that was current when it fell behind.
        assert_eq!(server.connection_count(), 1);
        rx.changed().await.unwrap();
        let pushed = rx.borrow_and_update().clone().unwrap();
        assert_eq!(pushed_hostname(&pushed), "new.ns.svc.cluster.local");
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_subscription_replays_latest() {
        let server = DiscoveryServer::new();
        server.publish(snapshot(&["a.ns.svc.cluster.local", "b.ns.svc.cluster.local"]));

        let request = proto::DiscoveryRequest {
            type_url: FEDERATED_SERVICE_TYPE_URL.to_string(),
            ..Default::default()
        };
        let response = server.handle_request("conn-a", request).unwrap();
        assert_eq!(response.resources.len(), 2);
    }

    #[tokio::test]
    async fn test_ack_and_nack_produce_no_response() {
        let server = DiscoveryServer::new();
        server.publish(snapshot(&["a.ns.svc.cluster.local"]));

        let ack = proto::DiscoveryRequest {
            type_url: FEDERATED_SERVICE_TYPE_URL.to_string(),
            response_nonce: "n-1".to_string(),
            ..Default::default()
        };
        assert!(server.handle_request("conn-a", ack).is_none());

        let nack = proto::DiscoveryRequest {
            type_url: FEDERATED_SERVICE_TYPE_URL.to_string(),
            response_nonce: "n-1".to_string(),
            error_detail: "could not apply".to_string(),
        };
        assert!(server.handle_request("conn-a", nack).is_none());
    }

    #[tokio::test]
    async fn test_subscription_for_unknown_type_is_silent() {
        let server = DiscoveryServer::new();
        let request = proto::DiscoveryRequest {
            type_url: "federation.meshfed.io/v1alpha1/Unknown".to_string(),
            ..Default::default()
        };
        assert!(server.handle_request("conn-a", request).is_none());
    }

    #[tokio::test]
    async fn test_serve_discovery_signals_ready_and_publishes() {
        let server = DiscoveryServer::new();
        let (snap_tx, snap_rx) = mpsc::channel(8);
        let (ready_tx, mut ready_rx) = watch::channel(false);
        let (shutdown_tx, _) = broadcast::channel(1);

        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let task = tokio::spawn(serve_discovery(
            server.clone(),
            addr,
            snap_rx,
            ready_tx,
            shutdown_tx.subscribe(),
        ));

        ready_rx.wait_for(|ready| *ready).await.unwrap();

        let mut rx = connect(&server, "conn-a");
        snap_tx
            .send(snapshot(&["a.ns.svc.cluster.local"]))
            .await
            .unwrap();
        rx.changed().await.unwrap();
        let pushed = rx.borrow().clone().unwrap();
        assert_eq!(pushed.resources.len(), 1);

        let _ = shutdown_tx.send(());
        task.await.unwrap().unwrap();
    }
}
