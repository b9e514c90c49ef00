//! Main entry point for the meshfed federation controller.
//!
//! Parses the three JSON configuration documents, wires the discovery
//! server, export bridge, and per-remote discovery clients together, and
//! runs the periodic config synthesis pass until shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use meshfed_api::grpc::FEDERATED_SERVICE_TYPE_URL;
use meshfed_api::model::{
    ExportedServiceSet, FederationConfig, ImportedServiceSet, MeshPeers,
};
use meshfed_api::validation;
use meshfed_core::bridge::ExportWatchBridge;
use meshfed_core::catalog::{InMemoryCatalog, ServiceLister};
use meshfed_core::client::{DiscoveryClient, ImportHandler};
use meshfed_core::server::{serve_discovery, DiscoveryServer};
use meshfed_core::store::ImportedServiceStore;
use meshfed_istio::ConfigFactory;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

mod startup;

#[derive(Debug, Parser)]
#[command(name = "meshfed-server", about = "Service-mesh federation controller")]
struct Cli {
    /// Mesh peers document (JSON)
    #[arg(long = "mesh-peers", env = "MESHFED_MESH_PEERS")]
    mesh_peers: String,

    /// Exported service set document (JSON)
    #[arg(
        long = "exported-service-set",
        env = "MESHFED_EXPORTED_SERVICE_SET",
        default_value = "{}"
    )]
    exported_service_set: String,

    /// Imported service set document (JSON)
    #[arg(
        long = "imported-service-set",
        env = "MESHFED_IMPORTED_SERVICE_SET",
        default_value = "{}"
    )]
    imported_service_set: String,

    /// Discovery server bind address
    #[arg(
        long = "listen-addr",
        env = "MESHFED_LISTEN_ADDR",
        default_value = "0.0.0.0:15080"
    )]
    listen_addr: SocketAddr,

    /// Default log level when RUST_LOG is unset
    #[arg(long = "log-level", env = "MESHFED_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Seconds between config synthesis passes
    #[arg(
        long = "reconcile-interval",
        env = "MESHFED_RECONCILE_INTERVAL",
        default_value_t = 60
    )]
    reconcile_interval: u64,
}

/// Parse and validate the configuration documents. Any violation is fatal.
fn parse_config(cli: &Cli) -> anyhow::Result<FederationConfig> {
    let mesh_peers: MeshPeers =
        serde_json::from_str(&cli.mesh_peers).context("failed to parse mesh peers document")?;
    let exported_service_set: ExportedServiceSet =
        serde_json::from_str(&cli.exported_service_set)
            .context("failed to parse exported service set document")?;
    let imported_service_set: ImportedServiceSet =
        serde_json::from_str(&cli.imported_service_set)
            .context("failed to parse imported service set document")?;

    let config = FederationConfig {
        mesh_peers,
        exported_service_set,
        imported_service_set,
    };
    validation::validate_config(&config)
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = parse_config(&cli)?;
    startup::init_logging(&cli.log_level)?;
    info!(
        local = %config.mesh_peers.local.name,
        remotes = config.mesh_peers.remotes.len(),
        listen_addr = %cli.listen_addr,
        "starting federation controller"
    );

    // The cluster catalog is an injected collaborator; the in-memory
    // implementation is wired here and fed by the external watch source.
    let catalog = Arc::new(InMemoryCatalog::new());

    // Bootstrap probe: an unreachable catalog is fatal before any task
    // starts.
    let mut initial_services = Vec::new();
    for selector in &config.exported_service_set.selectors {
        initial_services.extend(
            catalog
                .list(selector)
                .context("catalog bootstrap probe failed")?,
        );
    }

    let store = Arc::new(ImportedServiceStore::new());
    let shutdown = startup::wait_for_shutdown_signal().await;

    let (snapshot_tx, snapshot_rx) = mpsc::channel(16);
    let (event_tx, event_rx) = mpsc::channel(64);
    let (ready_tx, ready_rx) = watch::channel(false);

    // Discovery server first; the bridge waits for its readiness signal.
    let discovery_server = DiscoveryServer::new();
    let server_task = tokio::spawn(serve_discovery(
        discovery_server.clone(),
        cli.listen_addr,
        snapshot_rx,
        ready_tx,
        shutdown.subscribe(),
    ));

    let bridge = ExportWatchBridge::new(
        config.exported_service_set.clone(),
        event_rx,
        snapshot_tx,
    )
    .with_initial(initial_services);
    let bridge_task = tokio::spawn(bridge.run(ready_rx, shutdown.subscribe()));

    // One discovery client per configured remote.
    for remote in &config.mesh_peers.remotes {
        if remote.addresses.is_empty() {
            warn!(remote = %remote.name, "remote has no addresses, skipping discovery client");
            continue;
        }
        let addr = format!("http://{}:{}", remote.addresses[0], remote.port());
        let handler = Arc::new(ImportHandler::new(
            &remote.name,
            config.imported_service_set.clone(),
            store.clone(),
        ));
        let mut client =
            DiscoveryClient::new(addr).subscribe(FEDERATED_SERVICE_TYPE_URL, handler);
        let client_shutdown = shutdown.subscribe();
        let remote_name = remote.name.clone();
        tokio::spawn(async move {
            if let Err(e) = client.run(client_shutdown).await {
                error!(remote = %remote_name, error = %e, "discovery client terminated");
            }
        });
    }

    // Periodic synthesis pass against the catalog and the imported store.
    let factory = ConfigFactory::new(config.clone(), catalog.clone(), store.clone());
    let mut reconcile_shutdown = shutdown.subscribe();
    let interval = Duration::from_secs(cli.reconcile_interval.max(1));
    let reconcile_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => match factory.desired_state() {
                    Ok(state) => info!(
                        destination_rules = state.destination_rules.len(),
                        envoy_filters = state.envoy_filters.len(),
                        service_entries = state.service_entries.len(),
                        workload_entries = state.workload_entries.len(),
                        objects = state.object_count(),
                        "synthesized desired state"
                    ),
                    Err(e) => error!(error = %e, "synthesis pass failed"),
                },
                _ = reconcile_shutdown.recv() => break,
            }
        }
    });

    // Supervise until shutdown, then drain the tasks. The discovery server
    // is awaited last so in-flight pushes can finish.
    let mut main_shutdown = shutdown.subscribe();
    let _ = main_shutdown.recv().await;
    info!("shutting down federation controller");
    drop(event_tx);

    reconcile_task.await.context("reconcile task panicked")?;
    if let Err(e) = bridge_task.await.context("bridge task panicked")? {
        warn!(error = %e, "export bridge exited with error");
    }
    server_task.await.context("server task panicked")??;

    info!("federation controller stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(mesh_peers: &str) -> Cli {
        Cli::parse_from(["meshfed-server", "--mesh-peers", mesh_peers])
    }

    const VALID_PEERS: &str = r#"{
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

    #[test]
    fn test_parse_config_accepts_valid_documents() {
        let config = parse_config(&cli(VALID_PEERS)).unwrap();
        assert_eq!(config.mesh_peers.local.name, "west");
        assert_eq!(config.mesh_peers.remotes.len(), 1);
        assert!(config.exported_service_set.selectors.is_empty());
    }

    #[test]
    fn test_parse_config_rejects_malformed_json() {
        assert!(parse_config(&cli("{not json")).is_err());
    }

    #[test]
    fn test_parse_config_rejects_invalid_peers() {
        let peers = r#"{"local": {"name": "West!", "controlPlaneNamespace": "istio-system"}}"#;
        assert!(parse_config(&cli(peers)).is_err());
    }

    #[test]
    fn test_cli_defaults() {
        let cli = cli(VALID_PEERS);
        assert_eq!(cli.listen_addr.port(), 15080);
        assert_eq!(cli.reconcile_interval, 60);
        assert_eq!(cli.log_level, "info");
    }
}
