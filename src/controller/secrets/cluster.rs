//! Cluster permissions secret: the namespaces a tenant may deploy to.
//!
//! The namespace list is only ever extended by the tenant's own reconcile;
//! a concurrent writer that added a namespace is never clobbered by a slower
//! reconcile that has not seen it yet. Namespaces leave the list through
//! [`remove_namespace_from_cluster_secret`], driven by ownership changes.
//! A cluster-scoped tenant has no list at all.

use super::{
    base_secret, remove_secret_value, secret_value, set_secret_value, ManagedSecret, SecretError,
};
use crate::constants::{
    DEFAULT_CLUSTER_NAME, DEFAULT_SERVER_URL, KEY_CLUSTER_CONFIG, KEY_CLUSTER_NAME,
    KEY_CLUSTER_NAMESPACES, KEY_CLUSTER_SERVER, LABEL_MANAGED_BY, LABEL_SECRET_TYPE,
    SECRET_TYPE_CLUSTER,
};
use crate::controller::retry::{retry_on_conflict, RetryConfig};
use crate::controller::selector::{Requirement, Selector};
use crate::controller::store::{ResourceStore, StoreError};
use crate::crd::Tenant;
use k8s_openapi::api::core::v1::Secret;
use std::collections::BTreeSet;
use tracing::{debug, info};

const DEFAULT_CLUSTER_CONFIG: &str = r#"{"tlsClientConfig":{"insecure":false}}"#;

pub fn cluster_secret_name(tenant_name: &str) -> String {
    format!("{tenant_name}-default-cluster-config")
}

/// Comma separated list to a set, blanks dropped
pub fn parse_namespaces(raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|ns| !ns.is_empty())
        .map(str::to_string)
        .collect()
}

fn join_namespaces(namespaces: &BTreeSet<String>) -> String {
    namespaces.iter().cloned().collect::<Vec<_>>().join(",")
}

/// New value of the namespaces field: `None` for a cluster-scoped tenant,
/// otherwise the sorted, deduplicated union of what is stored and what is
/// desired
pub fn merge_namespaces(
    existing: Option<&str>,
    desired: &BTreeSet<String>,
    cluster_scoped: bool,
) -> Option<String> {
    if cluster_scoped {
        return None;
    }
    let mut merged = existing.map(parse_namespaces).unwrap_or_default();
    merged.extend(desired.iter().cloned());
    Some(join_namespaces(&merged))
}

/// Tenant namespace plus every namespace whose resource-management label
/// points at it. Terminating namespaces are left out.
pub async fn desired_namespaces<S: ResourceStore>(
    store: &S,
    tenant: &Tenant,
) -> Result<BTreeSet<String>, StoreError> {
    let selector =
        Selector::new().and(Requirement::equals(LABEL_MANAGED_BY, tenant.namespace_name()));
    let mut namespaces: BTreeSet<String> = store
        .list_namespaces(&selector)
        .await?
        .into_iter()
        .filter(|ns| ns.metadata.deletion_timestamp.is_none())
        .filter_map(|ns| ns.metadata.name)
        .collect();
    namespaces.insert(tenant.namespace_name().to_string());
    Ok(namespaces)
}

fn is_default_cluster_secret(secret: &Secret) -> bool {
    secret_value(secret, KEY_CLUSTER_SERVER).as_deref() == Some(DEFAULT_SERVER_URL)
}

/// Name of the cluster secret for the default server in `namespace`, if any.
/// When several exist the first by name wins.
pub async fn find_cluster_secret<S: ResourceStore>(
    store: &S,
    namespace: &str,
) -> Result<Option<String>, StoreError> {
    let selector = Selector::new().and(Requirement::equals(LABEL_SECRET_TYPE, SECRET_TYPE_CLUSTER));
    let mut names: Vec<String> = store
        .list::<Secret>(namespace, &selector)
        .await?
        .into_iter()
        .filter(is_default_cluster_secret)
        .filter_map(|s| s.metadata.name)
        .collect();
    names.sort();
    Ok(names.into_iter().next())
}

pub struct ClusterPermissionsSecret<'a> {
    tenant: &'a Tenant,
    name: String,
    namespaces: BTreeSet<String>,
    cluster_scoped: bool,
}

impl<'a> ClusterPermissionsSecret<'a> {
    /// Targets the existing default-server cluster secret when there is one
    pub async fn load<S: ResourceStore>(
        store: &S,
        tenant: &'a Tenant,
        namespaces: BTreeSet<String>,
        cluster_scoped: bool,
    ) -> Result<Self, SecretError> {
        let name = find_cluster_secret(store, tenant.namespace_name())
            .await?
            .unwrap_or_else(|| cluster_secret_name(tenant.name()));
        Ok(Self {
            tenant,
            name,
            namespaces,
            cluster_scoped,
        })
    }
}

impl ManagedSecret for ClusterPermissionsSecret<'_> {
    fn kind(&self) -> &'static str {
        "cluster-permissions"
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn build(&self) -> Result<Secret, SecretError> {
        let mut secret = base_secret(self.tenant, self.name(), Some("Opaque"));
        secret
            .metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(LABEL_SECRET_TYPE.to_string(), SECRET_TYPE_CLUSTER.to_string());
        set_secret_value(&mut secret, KEY_CLUSTER_NAME, DEFAULT_CLUSTER_NAME);
        set_secret_value(&mut secret, KEY_CLUSTER_SERVER, DEFAULT_SERVER_URL);
        set_secret_value(&mut secret, KEY_CLUSTER_CONFIG, DEFAULT_CLUSTER_CONFIG);
        if let Some(list) = merge_namespaces(None, &self.namespaces, self.cluster_scoped) {
            set_secret_value(&mut secret, KEY_CLUSTER_NAMESPACES, &list);
        }
        Ok(secret)
    }

    fn reconcile_drift(&self, existing: &mut Secret, changed: &mut bool) -> Result<(), SecretError> {
        let current = secret_value(existing, KEY_CLUSTER_NAMESPACES);
        match merge_namespaces(current.as_deref(), &self.namespaces, self.cluster_scoped) {
            Some(list) => *changed |= set_secret_value(existing, KEY_CLUSTER_NAMESPACES, &list),
            None => *changed |= remove_secret_value(existing, KEY_CLUSTER_NAMESPACES),
        }
        if secret_value(existing, KEY_CLUSTER_NAME).is_none() {
            *changed |= set_secret_value(existing, KEY_CLUSTER_NAME, DEFAULT_CLUSTER_NAME);
        }
        if secret_value(existing, KEY_CLUSTER_CONFIG).is_none() {
            *changed |= set_secret_value(existing, KEY_CLUSTER_CONFIG, DEFAULT_CLUSTER_CONFIG);
        }
        Ok(())
    }
}

/// Drop `namespace` from the cluster secret in `tenant_namespace`.
/// Returns whether the secret changed; a missing secret is not an error.
pub async fn remove_namespace_from_cluster_secret<S: ResourceStore>(
    store: &S,
    tenant_namespace: &str,
    namespace: &str,
    retry: &RetryConfig,
) -> Result<bool, SecretError> {
    let operation = format!("remove {namespace} from cluster secret in {tenant_namespace}");
    retry_on_conflict(retry, &operation, || async move {
        let Some(name) = find_cluster_secret(store, tenant_namespace).await? else {
            debug!(tenant_namespace = tenant_namespace, "No cluster secret to prune");
            return Ok(false);
        };
        let Some(mut secret) = store.get::<Secret>(tenant_namespace, &name).await? else {
            return Ok(false);
        };
        let Some(current) = secret_value(&secret, KEY_CLUSTER_NAMESPACES) else {
            return Ok(false);
        };

        let mut namespaces = parse_namespaces(&current);
        if !namespaces.remove(namespace) {
            return Ok(false);
        }
        set_secret_value(&mut secret, KEY_CLUSTER_NAMESPACES, &join_namespaces(&namespaces));
        store.update(&secret).await?;
        info!(
            tenant_namespace = tenant_namespace,
            secret = %name,
            namespace = namespace,
            "Removed released namespace from cluster secret"
        );
        Ok(true)
    })
    .await
}
