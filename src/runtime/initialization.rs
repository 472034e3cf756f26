//! # Initialization
//!
//! Controller initialization logic including rustls setup, tracing, metrics,
//! server startup, and Kubernetes client setup.

use crate::config::{ControllerConfig, ServerConfig};
use crate::controller::events::EventDispatcher;
use crate::controller::reconciler::Reconciler;
use crate::controller::server::{start_server, ServerState};
use crate::controller::store::KubeStore;
use crate::controller::tracker::OwnershipTracker;
use crate::crd::Tenant;
use crate::observability;
use anyhow::{Context, Result};
use futures::channel::mpsc::{self, UnboundedReceiver};
use kube::api::{Api, ListParams};
use kube::Client;
use kube_runtime::reflector::ObjectRef;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Initialization result containing all necessary components for the controller
pub struct InitializationResult {
    /// Kubernetes client
    pub client: Client,
    /// Reconciler context
    pub reconciler: Arc<Reconciler<KubeStore>>,
    /// Predicates and mapper on the namespace and tenant watch paths
    pub dispatcher: Arc<EventDispatcher<KubeStore>>,
    /// Tenant requests emitted by the namespace mapper
    pub requests: UnboundedReceiver<ObjectRef<Tenant>>,
    /// Server state for health checks
    pub server_state: Arc<ServerState>,
    pub controller_config: ControllerConfig,
    pub server_config: ServerConfig,
}

impl std::fmt::Debug for InitializationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitializationResult")
            .field("server_ready", &self.server_state.ready())
            .field("controller_config", &self.controller_config)
            .finish_non_exhaustive()
    }
}

/// Initialize the controller runtime
///
/// This function handles:
/// - rustls crypto provider setup
/// - Tracing subscriber setup
/// - Metrics registration
/// - HTTP server startup
/// - Kubernetes client creation
/// - Reconciler and event dispatcher setup
pub async fn initialize() -> Result<InitializationResult> {
    // Must happen before anything opens a TLS connection
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("rustls crypto provider was already installed");
    }

    let controller_config = ControllerConfig::from_env();
    let server_config = ServerConfig::from_env();

    observability::logging::init_logging(&controller_config.log_format);

    info!("Starting Tenant Controller");
    info!(
        "Build info: timestamp={}, datetime={}, git_hash={}",
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_DATETIME"),
        env!("BUILD_GIT_HASH")
    );

    observability::metrics::register_metrics()?;

    let server_state = Arc::new(ServerState::new());

    let server_state_clone = Arc::clone(&server_state);
    let server_port = server_config.metrics_port;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(server_port, server_state_clone).await {
            error!("HTTP server error: {}", e);
        }
    });

    wait_for_server_ready(&server_state, &server_handle, &server_config).await?;

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    let store = Arc::new(KubeStore::new(client.clone()));

    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&store),
        controller_config.clone(),
    ));

    let tracker = Arc::new(OwnershipTracker::new());
    let (sender, requests) = mpsc::unbounded();
    let dispatcher = Arc::new(EventDispatcher::with_default_hooks(
        store,
        tracker,
        controller_config.conflict_retry(),
        sender,
    ));

    check_tenant_crd(&Api::all(client.clone())).await;

    info!("Controller initialized, starting watch loop...");

    Ok(InitializationResult {
        client,
        reconciler,
        dispatcher,
        requests,
        server_state,
        controller_config,
        server_config,
    })
}

/// Wait for the HTTP server to become ready
async fn wait_for_server_ready(
    server_state: &Arc<ServerState>,
    server_handle: &tokio::task::JoinHandle<()>,
    server_config: &ServerConfig,
) -> Result<()> {
    let startup_timeout = std::time::Duration::from_secs(server_config.startup_timeout_secs);
    let poll_interval = std::time::Duration::from_millis(server_config.poll_interval_ms);
    let start_time = std::time::Instant::now();

    loop {
        if server_handle.is_finished() {
            return Err(anyhow::anyhow!("HTTP server failed to start"));
        }

        if server_state.ready() {
            info!("HTTP server is ready and accepting connections");
            break;
        }

        if start_time.elapsed() > startup_timeout {
            return Err(anyhow::anyhow!(
                "HTTP server failed to become ready within {} seconds",
                startup_timeout.as_secs()
            ));
        }

        tokio::time::sleep(poll_interval).await;
    }

    Ok(())
}

/// Log the tenants that exist at startup, per namespace. The controller's
/// initial listing reconciles every one of them.
async fn check_tenant_crd(tenants: &Api<Tenant>) {
    let span = tracing::span!(
        tracing::Level::INFO,
        "controller.startup.check_crd",
        operation = "check_tenant_crd"
    );
    let _guard = span.enter();

    match tenants.list(&ListParams::default()).await {
        Ok(list) => {
            let mut by_namespace: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for tenant in &list.items {
                by_namespace
                    .entry(tenant.namespace_name().to_string())
                    .or_default()
                    .push(tenant.name().to_string());
            }
            info!(
                tenants = list.items.len(),
                namespaces = by_namespace.len(),
                "Tenant CRD is queryable"
            );
            for (namespace, names) in &by_namespace {
                info!(namespace = %namespace, tenants = %names.join(", "), "Existing tenants");
            }
        }
        Err(e) => {
            error!("Tenant CRD is not queryable; {:?}. Is the CRD installed?", e);
            error!("Installation: cargo run --bin crdgen | kubectl apply -f -");
            warn!(error = %e, "Continuing despite CRD check failure, the watch will retry");
        }
    }
}
