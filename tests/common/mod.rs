//! Common test utilities for the integration tests
//!
//! Builders for tenants and namespaces, and a reconciler wired to an
//! in-memory store with retries that never sleep.

#![allow(dead_code)]

use k8s_openapi::api::core::v1::{Namespace, Secret};
use kube::api::ObjectMeta;
use std::collections::BTreeSet;
use std::sync::Arc;
use tenant_controller::config::{ControllerConfig, FeatureFlags};
use tenant_controller::constants::KEY_CLUSTER_NAMESPACES;
use tenant_controller::controller::reconciler::Reconciler;
use tenant_controller::controller::secrets::{find_cluster_secret, parse_namespaces, secret_value};
use tenant_controller::controller::store::memory::MemoryStore;
use tenant_controller::controller::store::ResourceStore;
use tenant_controller::crd::{Tenant, TenantSpec};

pub fn tenant(name: &str, namespace: &str) -> Tenant {
    let mut tenant = Tenant::new(name, TenantSpec::default());
    tenant.metadata.namespace = Some(namespace.to_string());
    tenant.metadata.uid = Some(format!("uid-{name}"));
    tenant
}

pub fn namespace(name: &str, labels: &[(&str, &str)]) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: (!labels.is_empty()).then(|| {
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect()
            }),
            ..ObjectMeta::default()
        },
        ..Namespace::default()
    }
}

/// Same namespace, marked as terminating
pub fn terminating(namespace: &Namespace) -> Namespace {
    let mut value = serde_json::to_value(namespace).expect("namespace serializes");
    value["metadata"]["deletionTimestamp"] = serde_json::json!("2026-01-01T00:00:00Z");
    serde_json::from_value(value).expect("namespace deserializes")
}

pub fn config() -> ControllerConfig {
    ControllerConfig {
        conflict_retry_initial_ms: 0,
        conflict_retry_max_ms: 0,
        ..ControllerConfig::default()
    }
}

pub fn reconciler(store: &Arc<MemoryStore>, config: ControllerConfig) -> Arc<Reconciler<MemoryStore>> {
    Arc::new(Reconciler::new(Arc::clone(store), config).with_feature_flags(FeatureFlags::default()))
}

pub fn reconciler_with_flags(
    store: &Arc<MemoryStore>,
    flags: FeatureFlags,
) -> Arc<Reconciler<MemoryStore>> {
    Arc::new(Reconciler::new(Arc::clone(store), config()).with_feature_flags(flags))
}

/// Store a tenant and return it as the controller would see it
pub async fn seed_tenant(store: &MemoryStore, name: &str, namespace: &str) -> Arc<Tenant> {
    Arc::new(
        store
            .create(&tenant(name, namespace))
            .await
            .expect("tenant is created"),
    )
}

/// Current stored version of a tenant
pub async fn fetch_tenant(store: &MemoryStore, name: &str, namespace: &str) -> Option<Arc<Tenant>> {
    store
        .get::<Tenant>(namespace, name)
        .await
        .expect("tenant lookup succeeds")
        .map(Arc::new)
}

/// Namespaces listed in the cluster secret of the tenant namespace, `None`
/// when the secret carries no list
pub async fn cluster_namespaces(store: &MemoryStore, tenant_namespace: &str) -> Option<BTreeSet<String>> {
    let name = find_cluster_secret(store, tenant_namespace)
        .await
        .expect("cluster secret lookup succeeds")?;
    let secret = store
        .get::<Secret>(tenant_namespace, &name)
        .await
        .expect("secret lookup succeeds")?;
    secret_value(&secret, KEY_CLUSTER_NAMESPACES).map(|raw| parse_namespaces(&raw))
}

pub fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}
