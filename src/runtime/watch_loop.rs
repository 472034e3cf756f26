//! # Watch Loop
//!
//! Controller watch loop that monitors Tenant resources and triggers
//! reconciliation when they, the secrets and roles they own, or the
//! namespace-management requests naming them change.
//!
//! Namespaces are watched by a separate task that feeds the event
//! dispatcher; the dispatcher's tenant requests reach the controller through
//! `reconcile_on`. Another task periodically retries ownership transitions
//! whose mapping failed.

use crate::config::ControllerConfig;
use crate::constants::{LABEL_TENANT_NAME, LABEL_TENANT_NAMESPACE};
use crate::controller::events::EventDispatcher;
use crate::controller::reconciler::{reconcile, Reconciler};
use crate::controller::server::ServerState;
use crate::controller::store::KubeStore;
use crate::crd::{NamespaceManagement, Tenant};
use crate::runtime::error_policy::{handle_reconciliation_error, handle_watch_stream_error};
use futures::channel::mpsc::UnboundedReceiver;
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::{Namespace, Secret};
use k8s_openapi::api::rbac::v1::Role;
use kube::api::Api;
use kube::Client;
use kube_runtime::reflector::{self, ObjectRef};
use kube_runtime::{controller, watcher, Controller, WatchStreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn, Instrument};

type SharedRequests = Arc<AsyncMutex<UnboundedReceiver<ObjectRef<Tenant>>>>;

/// The dispatcher's request channel as a stream that can be handed to a new
/// controller after a restart
fn request_stream(requests: SharedRequests) -> impl Stream<Item = ObjectRef<Tenant>> + Send {
    futures::stream::unfold(requests, |requests| async move {
        let next = requests.lock().await.next().await;
        next.map(|request| (request, requests))
    })
}

/// Tenant referenced by the labels of a generated role
fn tenant_of_role(role: &Role) -> Option<ObjectRef<Tenant>> {
    let labels = role.metadata.labels.as_ref()?;
    let name = labels.get(LABEL_TENANT_NAME)?;
    let namespace = labels.get(LABEL_TENANT_NAMESPACE)?;
    Some(ObjectRef::new(name).within(namespace))
}

/// Feed namespace watch events to the dispatcher until shutdown
pub async fn run_namespace_watch(
    client: Client,
    dispatcher: Arc<EventDispatcher<KubeStore>>,
    server_state: Arc<ServerState>,
    config: ControllerConfig,
) {
    let namespaces: Api<Namespace> = Api::all(client);
    let backoff = Arc::new(AtomicU64::new(config.backoff_start_ms));

    let mut events = watcher(namespaces, watcher::Config::default())
        .default_backoff()
        .boxed();

    info!("Starting namespace watch...");
    while let Some(event) = events.next().await {
        if !server_state.ready() {
            break;
        }
        match event {
            Ok(event) => {
                let sent = dispatcher.handle_namespace_event(event).await;
                if sent > 0 {
                    debug!(requests = sent, "Namespace event mapped to tenants");
                }
                backoff.store(config.backoff_start_ms, Ordering::Relaxed);
            }
            Err(e) => {
                let error_string = format!("{e:?}");
                handle_watch_stream_error(
                    &error_string,
                    &backoff,
                    config.backoff_max_ms,
                    config.watch_restart_delay_secs,
                )
                .await;
            }
        }
    }
    info!("Namespace watch stopped");
}

/// Retry parked ownership transitions until shutdown
pub async fn run_pending_retries(
    dispatcher: Arc<EventDispatcher<KubeStore>>,
    server_state: Arc<ServerState>,
    interval: Duration,
) {
    // tokio panics on a zero period
    let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    while server_state.ready() {
        ticker.tick().await;
        let sent = dispatcher.retry_pending().await;
        if sent > 0 {
            info!(requests = sent, "Retried pending ownership transitions");
        }
    }
}

/// Run the controller watch loop
///
/// Sets up the Kubernetes controller for Tenant resources and restarts it
/// whenever its stream ends, until a shutdown signal marks the server as not
/// ready.
pub async fn run_watch_loop(
    client: Client,
    reconciler: Arc<Reconciler<KubeStore>>,
    dispatcher: Arc<EventDispatcher<KubeStore>>,
    requests: UnboundedReceiver<ObjectRef<Tenant>>,
    server_state: Arc<ServerState>,
    config: ControllerConfig,
) -> Result<(), anyhow::Error> {
    info!("Starting controller watch loop...");

    let backoff_duration_ms = Arc::new(AtomicU64::new(config.backoff_start_ms));
    let requests: SharedRequests = Arc::new(AsyncMutex::new(requests));

    let shutdown_server_state = Arc::clone(&server_state);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received shutdown signal (SIGINT/SIGTERM), initiating graceful shutdown...");
        shutdown_server_state.set_ready(false);
        info!("Marked server as not ready, waiting for in-flight reconciliations to complete...");
    });

    tokio::spawn(run_namespace_watch(
        client.clone(),
        Arc::clone(&dispatcher),
        Arc::clone(&server_state),
        config.clone(),
    ));

    tokio::spawn(run_pending_retries(
        Arc::clone(&dispatcher),
        Arc::clone(&server_state),
        config.mapper_retry_interval(),
    ));

    loop {
        if !server_state.ready() {
            info!("Shutdown requested, exiting watch loop");
            break;
        }

        let watch_span = tracing::span!(
            tracing::Level::INFO,
            "controller.watch",
            operation = "watch_loop"
        );

        let tenants: Api<Tenant> = Api::all(client.clone());
        let (reader, writer) = reflector::store();
        let tenant_dispatcher = Arc::clone(&dispatcher);
        let tenant_events = watcher(tenants, watcher::Config::default().any_semantic())
            .default_backoff()
            .reflect(writer)
            .filter_map(move |event| {
                let dispatcher = Arc::clone(&tenant_dispatcher);
                async move {
                    match event {
                        Ok(event) => dispatcher.filter_tenant_event(event).await.map(Ok),
                        Err(e) => Some(Err(e)),
                    }
                }
            });

        let tenant_store = reader.clone();
        let backoff = Arc::clone(&backoff_duration_ms);
        let filter_config = config.clone();

        Controller::for_stream(tenant_events, reader)
            .owns(Api::<Secret>::all(client.clone()), watcher::Config::default())
            .watches(
                Api::<Role>::all(client.clone()),
                watcher::Config::default().labels(LABEL_TENANT_NAME),
                |role| tenant_of_role(&role),
            )
            .watches(
                Api::<NamespaceManagement>::all(client.clone()),
                watcher::Config::default(),
                move |request| {
                    tenant_store
                        .state()
                        .into_iter()
                        .filter(|t| t.namespace_name() == request.spec.managed_by)
                        .map(|t| ObjectRef::from_obj(&*t))
                        .collect::<Vec<_>>()
                },
            )
            .reconcile_on(request_stream(Arc::clone(&requests)))
            .with_config(
                controller::Config::default().concurrency(config.max_concurrent_reconciliations),
            )
            .shutdown_on_signal()
            .run(
                reconcile::<KubeStore>,
                handle_reconciliation_error::<KubeStore>,
                Arc::clone(&reconciler),
            )
            .filter_map(move |result| {
                let backoff = Arc::clone(&backoff);
                let config = filter_config.clone();
                async move {
                    match result {
                        Ok(_) => {
                            backoff.store(config.backoff_start_ms, Ordering::Relaxed);
                            debug!("watch.event.success");
                            Some(())
                        }
                        Err(e) => {
                            let error_string = format!("{e:?}");
                            handle_watch_stream_error(
                                &error_string,
                                &backoff,
                                config.backoff_max_ms,
                                config.watch_restart_delay_secs,
                            )
                            .await
                        }
                    }
                }
            })
            .for_each(|()| futures::future::ready(()))
            .instrument(watch_span)
            .await;

        if !server_state.ready() {
            info!("Shutdown requested, exiting watch loop");
            break;
        }

        let delay_secs = config.watch_restart_delay_after_end_secs;
        warn!(
            "Controller watch stream ended, restarting in {} seconds...",
            delay_secs
        );
        tokio::time::sleep(Duration::from_secs(delay_secs)).await;
    }

    info!("Controller stopped gracefully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc;

    #[test]
    fn test_role_maps_to_tenant_by_labels() {
        let mut role = Role::default();
        assert!(tenant_of_role(&role).is_none());
        role.metadata.labels = Some(
            [
                (LABEL_TENANT_NAME.to_string(), "t1".to_string()),
                (LABEL_TENANT_NAMESPACE.to_string(), "ns1".to_string()),
            ]
            .into(),
        );
        assert_eq!(tenant_of_role(&role), Some(ObjectRef::new("t1").within("ns1")));
    }

    #[tokio::test]
    async fn test_request_stream_survives_restart() {
        let (tx, rx) = mpsc::unbounded();
        let shared: SharedRequests = Arc::new(AsyncMutex::new(rx));
        tx.unbounded_send(ObjectRef::new("t1").within("ns1")).unwrap();
        tx.unbounded_send(ObjectRef::new("t2").within("ns2")).unwrap();

        {
            let mut first = Box::pin(request_stream(Arc::clone(&shared)));
            assert_eq!(first.next().await, Some(ObjectRef::new("t1").within("ns1")));
        }
        let mut second = Box::pin(request_stream(shared));
        assert_eq!(second.next().await, Some(ObjectRef::new("t2").within("ns2")));
    }
}
