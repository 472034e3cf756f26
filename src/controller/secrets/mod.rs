//! # Secret Lifecycle
//!
//! The generated secrets of a tenant and the one write path they share.
//!
//! Each secret type implements [`ManagedSecret`]: it knows its name, how to
//! build the desired object from scratch, and how to detect and repair drift
//! on an existing one. [`reconcile_or_create`] applies the common rules:
//!
//! - absent: build, link to the tenant through an owner reference, create
//! - present with `ignore-drift: "true"`: leave it alone
//! - present otherwise: run the drift check, update only if it changed something
//!
//! Dependencies (the CA for the TLS leaf, the admin and TLS secrets for the
//! hashed admin secret) are loaded when a secret type is constructed. A
//! missing dependency is [`SecretError::DependencyNotReady`], which the
//! reconciler turns into a short requeue.

mod admin;
mod ca;
mod cluster;
mod server;
mod tls;

pub use admin::{admin_secret_name, AdminCredentialsSecret};
pub use ca::{ca_secret_name, CaSecret};
pub use cluster::{
    cluster_secret_name, desired_namespaces, find_cluster_secret, merge_namespaces,
    parse_namespaces, remove_namespace_from_cluster_secret, ClusterPermissionsSecret,
};
pub use server::{server_secret_name, ServerSecret};
pub use tls::{tls_sans, tls_secret_name, TlsSecret};

use crate::constants::{
    ANNOTATION_IGNORE_DRIFT, CONTROLLER_NAME, LABEL_INSTANCE, LABEL_PART_OF,
};
use crate::controller::pki::PkiError;
use crate::controller::retry::{retry_on_conflict, ConflictError, RetryConfig};
use crate::controller::store::{ResourceStore, StoreError};
use crate::crd::Tenant;
use crate::observability::metrics;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::Resource;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum SecretError {
    /// A secret this one is derived from does not exist (yet)
    #[error("dependency of secret {secret} not ready: {reason}")]
    DependencyNotReady { secret: String, reason: String },

    /// A secret this one is derived from exists but is unusable
    #[error("secret {secret} is invalid: {reason}")]
    Invalid { secret: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Pki(#[from] PkiError),
}

impl SecretError {
    pub fn is_dependency_not_ready(&self) -> bool {
        matches!(self, SecretError::DependencyNotReady { .. })
    }
}

impl ConflictError for SecretError {
    fn is_conflict(&self) -> bool {
        matches!(self, SecretError::Store(e) if e.is_conflict())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretOutcome {
    Created,
    Unchanged,
    Updated,
    DriftIgnored,
}

impl SecretOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecretOutcome::Created => "created",
            SecretOutcome::Unchanged => "unchanged",
            SecretOutcome::Updated => "updated",
            SecretOutcome::DriftIgnored => "drift_ignored",
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self, SecretOutcome::Created | SecretOutcome::Updated)
    }
}

/// One generated secret type
pub trait ManagedSecret: Send + Sync {
    /// Short name for logs and metrics
    fn kind(&self) -> &'static str;

    fn name(&self) -> String;

    /// Desired secret, built only when none exists
    fn build(&self) -> Result<Secret, SecretError>;

    /// Repair drift on `existing` in place, setting `changed` when it did
    fn reconcile_drift(&self, existing: &mut Secret, changed: &mut bool)
        -> Result<(), SecretError>;
}

/// UTF-8 value of `key` in the secret's data
pub fn secret_value(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .and_then(|value| String::from_utf8(value.0.clone()).ok())
}

/// Set `key` to `value`; true if the stored value was different
pub fn set_secret_value(secret: &mut Secret, key: &str, value: &str) -> bool {
    let data = secret.data.get_or_insert_with(BTreeMap::new);
    if data.get(key).map(|v| v.0.as_slice()) == Some(value.as_bytes()) {
        return false;
    }
    data.insert(key.to_string(), ByteString(value.as_bytes().to_vec()));
    true
}

/// Remove `key`; true if it was present
pub fn remove_secret_value(secret: &mut Secret, key: &str) -> bool {
    secret
        .data
        .as_mut()
        .is_some_and(|data| data.remove(key).is_some())
}

pub fn ignores_drift(secret: &Secret) -> bool {
    secret
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_IGNORE_DRIFT))
        .is_some_and(|v| v == "true")
}

/// Skeleton secret in the tenant namespace with the common labels
pub fn base_secret(tenant: &Tenant, name: String, type_: Option<&str>) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(tenant.namespace_name().to_string()),
            labels: Some(BTreeMap::from([
                (LABEL_PART_OF.to_string(), CONTROLLER_NAME.to_string()),
                (LABEL_INSTANCE.to_string(), tenant.name().to_string()),
            ])),
            ..ObjectMeta::default()
        },
        type_: type_.map(str::to_string),
        data: Some(BTreeMap::new()),
        ..Secret::default()
    }
}

/// Create the secret if absent, otherwise repair drift unless it is ignored
pub async fn reconcile_or_create<S, M>(
    store: &S,
    tenant: &Tenant,
    secret: &M,
) -> Result<SecretOutcome, SecretError>
where
    S: ResourceStore,
    M: ManagedSecret,
{
    let namespace = tenant.namespace_name();
    let name = secret.name();

    let outcome = match store.get::<Secret>(namespace, &name).await? {
        None => {
            let mut desired = secret.build()?;
            if let Some(owner) = tenant.controller_owner_ref(&()) {
                desired.metadata.owner_references = Some(vec![owner]);
            }
            store.create(&desired).await?;
            info!(
                tenant = tenant.name(),
                namespace = namespace,
                secret = %name,
                kind = secret.kind(),
                "Created secret"
            );
            SecretOutcome::Created
        }
        Some(existing) if ignores_drift(&existing) => {
            debug!(secret = %name, kind = secret.kind(), "Secret ignores drift, leaving it alone");
            SecretOutcome::DriftIgnored
        }
        Some(existing) => {
            let mut updated = existing.clone();
            let mut changed = false;
            secret.reconcile_drift(&mut updated, &mut changed)?;
            if changed {
                store.update(&updated).await?;
                info!(
                    tenant = tenant.name(),
                    namespace = namespace,
                    secret = %name,
                    kind = secret.kind(),
                    "Updated drifted secret"
                );
                SecretOutcome::Updated
            } else {
                SecretOutcome::Unchanged
            }
        }
    };

    metrics::increment_secret_operations(secret.kind(), outcome.as_str());
    Ok(outcome)
}

/// [`reconcile_or_create`] re-run from a fresh read when the write conflicts
pub async fn reconcile_or_create_with_retry<S, M>(
    store: &S,
    tenant: &Tenant,
    secret: &M,
    retry: &RetryConfig,
) -> Result<SecretOutcome, SecretError>
where
    S: ResourceStore,
    M: ManagedSecret,
{
    retry_on_conflict(retry, secret.kind(), || reconcile_or_create(store, tenant, secret)).await
}

/// Inputs of one secret lifecycle pass that come from outside the tenant
#[derive(Debug, Clone)]
pub struct SecretContext {
    pub cluster_scoped: bool,
    /// Tenant namespace plus every namespace it manages resources in
    pub namespaces: BTreeSet<String>,
    pub retry: RetryConfig,
}

/// Outcome per secret type, in reconcile order
pub type SecretReport = Vec<(&'static str, SecretOutcome)>;

/// Reconcile all generated secrets of `tenant` in dependency order.
/// Stops at the first failure; a missing dependency is reported as
/// [`SecretError::DependencyNotReady`].
pub async fn reconcile_tenant_secrets<S>(
    store: &S,
    tenant: &Tenant,
    ctx: &SecretContext,
) -> Result<SecretReport, SecretError>
where
    S: ResourceStore,
{
    let mut report = SecretReport::new();

    let ca = CaSecret::new(tenant);
    report.push((ca.kind(), reconcile_or_create(store, tenant, &ca).await?));

    let tls = TlsSecret::load(store, tenant).await?;
    report.push((tls.kind(), reconcile_or_create(store, tenant, &tls).await?));

    let admin = AdminCredentialsSecret::new(tenant);
    report.push((admin.kind(), reconcile_or_create(store, tenant, &admin).await?));

    let server = ServerSecret::load(store, tenant).await?;
    report.push((
        server.kind(),
        reconcile_or_create_with_retry(store, tenant, &server, &ctx.retry).await?,
    ));

    let cluster =
        ClusterPermissionsSecret::load(store, tenant, ctx.namespaces.clone(), ctx.cluster_scoped)
            .await?;
    report.push((
        cluster.kind(),
        reconcile_or_create_with_retry(store, tenant, &cluster, &ctx.retry).await?,
    ));

    Ok(report)
}

/// Load a secret another one depends on
pub(crate) async fn require_secret<S: ResourceStore>(
    store: &S,
    namespace: &str,
    name: &str,
    dependent: &str,
) -> Result<Secret, SecretError> {
    store
        .get::<Secret>(namespace, name)
        .await?
        .ok_or_else(|| SecretError::DependencyNotReady {
            secret: dependent.to_string(),
            reason: format!("secret {namespace}/{name} does not exist"),
        })
}

/// Value of `key` in a dependency secret
pub(crate) fn require_value(
    secret: &Secret,
    key: &str,
    dependent: &str,
) -> Result<String, SecretError> {
    secret_value(secret, key).ok_or_else(|| SecretError::Invalid {
        secret: dependent.to_string(),
        reason: format!(
            "secret {} has no {key}",
            secret.metadata.name.as_deref().unwrap_or_default()
        ),
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::crd::{Tenant, TenantSpec};

    pub fn tenant(name: &str, namespace: &str) -> Tenant {
        let mut tenant = Tenant::new(name, TenantSpec::default());
        tenant.metadata.namespace = Some(namespace.to_string());
        tenant.metadata.uid = Some(format!("uid-{name}"));
        tenant
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::tenant;
    use super::*;
    use crate::constants::{KEY_ADMIN_PASSWORD, KEY_CLUSTER_NAMESPACES, KEY_TLS_CERT};
    use crate::controller::store::memory::MemoryStore;

    fn ctx(namespaces: &[&str]) -> SecretContext {
        SecretContext {
            cluster_scoped: false,
            namespaces: namespaces.iter().map(|s| (*s).to_string()).collect(),
            retry: RetryConfig::immediate(3),
        }
    }

    #[tokio::test]
    async fn test_first_pass_creates_every_secret_with_owner() {
        let store = MemoryStore::new();
        let t1 = tenant("t1", "ns1");

        let report = reconcile_tenant_secrets(&store, &t1, &ctx(&["ns1"]))
            .await
            .unwrap();
        assert_eq!(report.len(), 5);
        assert!(report.iter().all(|(_, o)| *o == SecretOutcome::Created));

        let ca: Secret = store.get("ns1", "t1-ca").await.unwrap().unwrap();
        let owner = &ca.metadata.owner_references.unwrap()[0];
        assert_eq!(owner.kind, "Tenant");
        assert_eq!(owner.name, "t1");
    }

    #[tokio::test]
    async fn test_second_pass_writes_nothing() {
        let store = MemoryStore::new();
        let t1 = tenant("t1", "ns1");
        reconcile_tenant_secrets(&store, &t1, &ctx(&["ns1", "ns2"]))
            .await
            .unwrap();
        store.reset_calls();

        let report = reconcile_tenant_secrets(&store, &t1, &ctx(&["ns1", "ns2"]))
            .await
            .unwrap();
        assert!(report.iter().all(|(_, o)| !o.is_write()), "{report:?}");
        assert_eq!(store.write_calls(), 0);
    }

    #[tokio::test]
    async fn test_ignored_secret_is_never_overwritten() {
        let store = MemoryStore::new();
        let t1 = tenant("t1", "ns1");
        let admin = AdminCredentialsSecret::new(&t1);
        reconcile_or_create(&store, &t1, &admin).await.unwrap();
        let before: Secret = store.get("ns1", "t1-cluster").await.unwrap().unwrap();

        for _ in 0..3 {
            let outcome = reconcile_or_create(&store, &t1, &admin).await.unwrap();
            assert_eq!(outcome, SecretOutcome::DriftIgnored);
        }
        let after: Secret = store.get("ns1", "t1-cluster").await.unwrap().unwrap();
        assert_eq!(
            secret_value(&before, KEY_ADMIN_PASSWORD),
            secret_value(&after, KEY_ADMIN_PASSWORD)
        );
    }

    #[tokio::test]
    async fn test_missing_ca_is_dependency_not_ready() {
        let store = MemoryStore::new();
        let t1 = tenant("t1", "ns1");
        let err = TlsSecret::load(&store, &t1).await.err().unwrap();
        assert!(err.is_dependency_not_ready());
    }

    #[tokio::test]
    async fn test_conflicting_update_is_retried() {
        let store = MemoryStore::new();
        let t1 = tenant("t1", "ns1");
        reconcile_tenant_secrets(&store, &t1, &ctx(&["ns1"]))
            .await
            .unwrap();

        store.inject_conflicts::<Secret>(2);
        let report = reconcile_tenant_secrets(&store, &t1, &ctx(&["ns1", "ns2"]))
            .await
            .unwrap();
        assert_eq!(
            report.last(),
            Some(&("cluster-permissions", SecretOutcome::Updated))
        );
        let cluster: Secret = store
            .get("ns1", "t1-default-cluster-config")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            secret_value(&cluster, KEY_CLUSTER_NAMESPACES).as_deref(),
            Some("ns1,ns2")
        );
    }

    #[test]
    fn test_set_secret_value_reports_change() {
        let t1 = tenant("t1", "ns1");
        let mut secret = base_secret(&t1, "x".to_string(), None);
        assert!(set_secret_value(&mut secret, KEY_TLS_CERT, "a"));
        assert!(!set_secret_value(&mut secret, KEY_TLS_CERT, "a"));
        assert!(remove_secret_value(&mut secret, KEY_TLS_CERT));
        assert!(!remove_secret_value(&mut secret, KEY_TLS_CERT));
    }
}
