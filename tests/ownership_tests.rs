//! # Ownership Tests
//!
//! Namespace watch events run through the event dispatcher and the tenant
//! reconciler together, the way the watch loop drives them.

mod common;

use common::*;
use futures::channel::mpsc::{self, UnboundedReceiver};
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::rbac::v1::Role;
use kube_runtime::reflector::ObjectRef;
use kube_runtime::watcher;
use std::collections::BTreeSet;
use std::sync::Arc;
use tenant_controller::constants::{
    COMPONENT_SERVER, LABEL_APPS_MANAGED_BY, LABEL_MANAGED_BY, LABEL_TENANT_NAME,
};
use tenant_controller::controller::events::EventDispatcher;
use tenant_controller::controller::rbac::{rbac_object_name, RbacType};
use tenant_controller::controller::reconciler::reconcile;
use tenant_controller::controller::retry::RetryConfig;
use tenant_controller::controller::selector::{Requirement, Selector};
use tenant_controller::controller::store::memory::MemoryStore;
use tenant_controller::controller::store::ResourceStore;
use tenant_controller::controller::tracker::OwnershipTracker;
use tenant_controller::crd::Tenant;

fn dispatcher(
    store: &Arc<MemoryStore>,
) -> (EventDispatcher<MemoryStore>, UnboundedReceiver<ObjectRef<Tenant>>) {
    let (tx, rx) = mpsc::unbounded();
    let dispatcher = EventDispatcher::with_default_hooks(
        Arc::clone(store),
        Arc::new(OwnershipTracker::new()),
        RetryConfig::immediate(3),
        tx,
    );
    (dispatcher, rx)
}

/// Deliver the initial listing of every stored namespace
async fn prime(store: &MemoryStore, dispatcher: &EventDispatcher<MemoryStore>) {
    dispatcher.handle_namespace_event(watcher::Event::Init).await;
    for ns in store.list_namespaces(&Selector::new()).await.unwrap() {
        dispatcher
            .handle_namespace_event(watcher::Event::InitApply(ns))
            .await;
    }
    dispatcher.handle_namespace_event(watcher::Event::InitDone).await;
}

/// Requests sent so far, as (namespace, name)
fn drain(rx: &mut UnboundedReceiver<ObjectRef<Tenant>>) -> BTreeSet<(String, String)> {
    let mut requests = BTreeSet::new();
    while let Ok(Some(request)) = rx.try_next() {
        requests.insert((request.namespace.unwrap_or_default(), request.name));
    }
    requests
}

fn refs(items: &[(&str, &str)]) -> BTreeSet<(String, String)> {
    items
        .iter()
        .map(|(ns, name)| (ns.to_string(), name.to_string()))
        .collect()
}

async fn relabel(store: &MemoryStore, name: &str, owner: &str) -> Namespace {
    let mut ns = store.get_namespace(name).await.unwrap().unwrap();
    ns.metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(LABEL_MANAGED_BY.to_string(), owner.to_string());
    store.update_namespace(&ns).await.unwrap()
}

async fn roles_of(store: &MemoryStore, namespace: &str, tenant: &str) -> usize {
    let selector = Selector::new().and(Requirement::equals(LABEL_TENANT_NAME, tenant));
    store
        .list::<Role>(namespace, &selector)
        .await
        .unwrap()
        .len()
}

#[tokio::test]
async fn test_initial_listing_requests_nothing() {
    let store = Arc::new(MemoryStore::new());
    store.create_namespace(&namespace("ns1", &[])).unwrap();
    store
        .create_namespace(&namespace("ns2", &[(LABEL_MANAGED_BY, "ns1")]))
        .unwrap();
    seed_tenant(&store, "t1", "ns1").await;
    let (dispatcher, mut rx) = dispatcher(&store);

    prime(&store, &dispatcher).await;

    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn test_new_delegation_requests_the_owner() {
    let store = Arc::new(MemoryStore::new());
    store.create_namespace(&namespace("ns1", &[])).unwrap();
    store.create_namespace(&namespace("ns2", &[])).unwrap();
    let t1 = seed_tenant(&store, "t1", "ns1").await;
    let ctx = reconciler(&store, config());
    reconcile(t1, Arc::clone(&ctx)).await.unwrap();
    assert_eq!(cluster_namespaces(&store, "ns1").await, Some(set(&["ns1"])));

    let (dispatcher, mut rx) = dispatcher(&store);
    prime(&store, &dispatcher).await;

    let ns2 = relabel(&store, "ns2", "ns1").await;
    let sent = dispatcher
        .handle_namespace_event(watcher::Event::Apply(ns2))
        .await;

    assert_eq!(sent, 1);
    assert_eq!(drain(&mut rx), refs(&[("ns1", "t1")]));

    let t1 = fetch_tenant(&store, "t1", "ns1").await.unwrap();
    reconcile(t1, ctx).await.unwrap();
    assert_eq!(cluster_namespaces(&store, "ns1").await, Some(set(&["ns1", "ns2"])));
}

#[tokio::test]
async fn test_ownership_move_hands_namespace_over() {
    let store = Arc::new(MemoryStore::new());
    store.create_namespace(&namespace("ns1", &[])).unwrap();
    store.create_namespace(&namespace("ns3", &[])).unwrap();
    store
        .create_namespace(&namespace(
            "ns2",
            &[(LABEL_MANAGED_BY, "ns1"), (LABEL_APPS_MANAGED_BY, "ns1")],
        ))
        .unwrap();
    let t1 = seed_tenant(&store, "t1", "ns1").await;
    seed_tenant(&store, "t3", "ns3").await;

    reconcile(t1, reconciler(&store, config())).await.unwrap();
    assert_eq!(roles_of(&store, "ns2", "t1").await, 3);
    assert_eq!(cluster_namespaces(&store, "ns1").await, Some(set(&["ns1", "ns2"])));

    let (dispatcher, mut rx) = dispatcher(&store);
    prime(&store, &dispatcher).await;

    let ns2 = relabel(&store, "ns2", "ns3").await;
    let sent = dispatcher
        .handle_namespace_event(watcher::Event::Apply(ns2))
        .await;

    assert_eq!(sent, 2);
    assert_eq!(
        drain(&mut rx),
        refs(&[("ns1", "t1"), ("ns3", "t3")])
    );
    // Only the app-management role of t1 is left in ns2
    assert_eq!(roles_of(&store, "ns2", "t1").await, 1);
    let app_role = rbac_object_name("t1", COMPONENT_SERVER, RbacType::AppManagement);
    assert!(store.get::<Role>("ns2", &app_role).await.unwrap().is_some());
    assert_eq!(cluster_namespaces(&store, "ns1").await, Some(set(&["ns1"])));

    // The requested reconciles converge both tenants
    let ctx = reconciler(&store, config());
    let t1 = fetch_tenant(&store, "t1", "ns1").await.unwrap();
    let t3 = fetch_tenant(&store, "t3", "ns3").await.unwrap();
    reconcile(t1, Arc::clone(&ctx)).await.unwrap();
    reconcile(t3, ctx).await.unwrap();

    let name = rbac_object_name("t3", COMPONENT_SERVER, RbacType::ResourceManagement);
    assert!(store.get::<Role>("ns2", &name).await.unwrap().is_some());
    assert_eq!(cluster_namespaces(&store, "ns1").await, Some(set(&["ns1"])));
    assert_eq!(cluster_namespaces(&store, "ns3").await, Some(set(&["ns2", "ns3"])));
    let t1 = fetch_tenant(&store, "t1", "ns1").await.unwrap();
    assert_eq!(
        t1.status.as_ref().unwrap().managed_namespaces,
        vec!["ns2".to_string()]
    );
}

#[tokio::test]
async fn test_terminating_tenant_namespace_deletes_the_tenant() {
    let store = Arc::new(MemoryStore::new());
    store.create_namespace(&namespace("ns4", &[])).unwrap();
    seed_tenant(&store, "t4", "ns4").await;
    let (dispatcher, mut rx) = dispatcher(&store);
    prime(&store, &dispatcher).await;
    store.reset_calls();

    let ns4 = terminating(&store.get_namespace("ns4").await.unwrap().unwrap());
    let sent = dispatcher
        .handle_namespace_event(watcher::Event::Apply(ns4))
        .await;

    assert_eq!(sent, 1);
    assert_eq!(drain(&mut rx), refs(&[("ns4", "t4")]));
    assert_eq!(store.calls::<Tenant>("delete"), 1);
    assert_eq!(store.namespace_calls("update"), 0);
}

#[tokio::test]
async fn test_terminating_namespace_without_tenant_is_unlabelled() {
    let store = Arc::new(MemoryStore::new());
    store.create_namespace(&namespace("ns1", &[])).unwrap();
    store
        .create_namespace(&namespace("ns2", &[(LABEL_MANAGED_BY, "ns1")]))
        .unwrap();
    let t1 = seed_tenant(&store, "t1", "ns1").await;
    reconcile(t1, reconciler(&store, config())).await.unwrap();
    let (dispatcher, mut rx) = dispatcher(&store);
    prime(&store, &dispatcher).await;

    let ns2 = terminating(&store.get_namespace("ns2").await.unwrap().unwrap());
    let sent = dispatcher
        .handle_namespace_event(watcher::Event::Apply(ns2))
        .await;

    assert_eq!(sent, 0);
    assert!(drain(&mut rx).is_empty());
    assert_eq!(cluster_namespaces(&store, "ns1").await, Some(set(&["ns1"])));
    let ns2 = store.get_namespace("ns2").await.unwrap().unwrap();
    assert!(ns2
        .metadata
        .labels
        .as_ref()
        .is_none_or(|l| !l.contains_key(LABEL_MANAGED_BY)));
}

#[tokio::test]
async fn test_namespace_missing_from_relist_is_released() {
    let store = Arc::new(MemoryStore::new());
    store.create_namespace(&namespace("ns1", &[])).unwrap();
    store
        .create_namespace(&namespace("ns2", &[(LABEL_MANAGED_BY, "ns1")]))
        .unwrap();
    let t1 = seed_tenant(&store, "t1", "ns1").await;
    reconcile(t1, reconciler(&store, config())).await.unwrap();
    assert_eq!(cluster_namespaces(&store, "ns1").await, Some(set(&["ns1", "ns2"])));
    let (dispatcher, mut rx) = dispatcher(&store);
    prime(&store, &dispatcher).await;

    // ns2 is deleted while the watch is down; the relist no longer has it
    assert!(store.remove_namespace("ns2"));
    prime(&store, &dispatcher).await;

    assert_eq!(drain(&mut rx), refs(&[("ns1", "t1")]));
    assert_eq!(cluster_namespaces(&store, "ns1").await, Some(set(&["ns1"])));
    assert_eq!(roles_of(&store, "ns2", "t1").await, 0);
}

#[tokio::test]
async fn test_ownership_move_keeps_other_tenants_rbac() {
    let store = Arc::new(MemoryStore::new());
    for name in ["ns1", "ns3", "ns4"] {
        store.create_namespace(&namespace(name, &[])).unwrap();
    }
    store
        .create_namespace(&namespace(
            "ns2",
            &[(LABEL_MANAGED_BY, "ns1"), (LABEL_APPS_MANAGED_BY, "ns4")],
        ))
        .unwrap();
    store
        .create_namespace(&namespace("ns5", &[(LABEL_MANAGED_BY, "ns1")]))
        .unwrap();
    let t1 = seed_tenant(&store, "t1", "ns1").await;
    seed_tenant(&store, "t3", "ns3").await;
    let t4 = seed_tenant(&store, "t4", "ns4").await;
    let ctx = reconciler(&store, config());
    reconcile(t1, Arc::clone(&ctx)).await.unwrap();
    reconcile(t4, ctx).await.unwrap();

    let t1_in_ns5 = roles_of(&store, "ns5", "t1").await;
    assert!(t1_in_ns5 > 0);
    assert!(roles_of(&store, "ns2", "t1").await > 0);
    assert_eq!(roles_of(&store, "ns2", "t4").await, 1);

    let (dispatcher, mut rx) = dispatcher(&store);
    prime(&store, &dispatcher).await;
    let ns2 = relabel(&store, "ns2", "ns3").await;
    let sent = dispatcher
        .handle_namespace_event(watcher::Event::Apply(ns2))
        .await;

    assert_eq!(sent, 2);
    assert_eq!(drain(&mut rx), refs(&[("ns1", "t1"), ("ns3", "t3")]));
    assert_eq!(roles_of(&store, "ns2", "t1").await, 0);
    let t4_role = rbac_object_name("t4", COMPONENT_SERVER, RbacType::AppManagement);
    assert!(store.get::<Role>("ns2", &t4_role).await.unwrap().is_some());
    assert_eq!(roles_of(&store, "ns5", "t1").await, t1_in_ns5);
    assert_eq!(cluster_namespaces(&store, "ns1").await, Some(set(&["ns1", "ns5"])));
}

#[tokio::test]
async fn test_failed_cleanup_is_picked_up_by_the_retry_pass() {
    let store = Arc::new(MemoryStore::new());
    store.create_namespace(&namespace("ns1", &[])).unwrap();
    store.create_namespace(&namespace("ns3", &[])).unwrap();
    store
        .create_namespace(&namespace("ns2", &[(LABEL_MANAGED_BY, "ns1")]))
        .unwrap();
    let t1 = seed_tenant(&store, "t1", "ns1").await;
    reconcile(t1, reconciler(&store, config())).await.unwrap();
    let stuck = rbac_object_name("t1", COMPONENT_SERVER, RbacType::ResourceManagement);
    store.fail_deletes_of::<Role>("ns2", &stuck);
    let (dispatcher, mut rx) = dispatcher(&store);
    prime(&store, &dispatcher).await;

    let ns2 = relabel(&store, "ns2", "ns3").await;
    dispatcher
        .handle_namespace_event(watcher::Event::Apply(ns2))
        .await;
    assert_eq!(drain(&mut rx), refs(&[("ns1", "t1")]));
    assert!(store.get::<Role>("ns2", &stuck).await.unwrap().is_some());

    store.heal();
    assert_eq!(dispatcher.retry_pending().await, 1);
    assert_eq!(drain(&mut rx), refs(&[("ns1", "t1")]));
    assert!(store.get::<Role>("ns2", &stuck).await.unwrap().is_none());
    assert_eq!(dispatcher.retry_pending().await, 0);
}
