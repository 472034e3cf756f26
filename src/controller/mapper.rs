//! # Namespace Mapper
//!
//! Turns a namespace event that passed the predicates into tenant reconcile
//! requests, consuming the transitions the predicates parked in the
//! [`OwnershipTracker`].
//!
//! - A terminating namespace is never mapped to a survivor. A tenant living
//!   in it is deleted and requested once; otherwise the namespace's
//!   management labels are stripped. Either way it is dropped from the
//!   cluster-permissions secret of its previous resource-management owner.
//! - Otherwise the pending transitions are consolidated: stale RBAC is
//!   deleted once per RBAC type, previous resource-management owners lose
//!   the namespace from their cluster-permissions secret, and both previous
//!   and new owners are requested so their full reconcile converges.
//!
//! Failures of independent steps are logged and the remaining steps still
//! run. Transitions whose cleanup did not complete go back into the tracker,
//! and [`NamespaceMapper::retry`] maps them again later.

use crate::constants::MANAGEMENT_LABELS;
use crate::controller::rbac::{delete_non_control_plane_resources, RbacType};
use crate::controller::retry::RetryConfig;
use crate::controller::secrets::remove_namespace_from_cluster_secret;
use crate::controller::selector::Selector;
use crate::controller::store::{ResourceStore, StoreError};
use crate::controller::tracker::{ManagedNsOpts, OwnershipTracker};
use crate::crd::Tenant;
use crate::observability::metrics;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::ObjectMeta;
use kube_runtime::reflector::ObjectRef;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum MapperError {
    #[error("tenant lookup failed: {0}")]
    Lookup(#[from] StoreError),
}

fn tenant_ref(tenant: &Tenant) -> ObjectRef<Tenant> {
    ObjectRef::new(tenant.name()).within(tenant.namespace_name())
}

fn push_unique(requests: &mut Vec<ObjectRef<Tenant>>, request: ObjectRef<Tenant>) {
    if !requests.contains(&request) {
        requests.push(request);
    }
}

#[derive(Debug)]
pub struct NamespaceMapper<S> {
    store: Arc<S>,
    tracker: Arc<OwnershipTracker>,
    retry: RetryConfig,
}

impl<S: ResourceStore> NamespaceMapper<S> {
    pub fn new(store: Arc<S>, tracker: Arc<OwnershipTracker>, retry: RetryConfig) -> Self {
        Self {
            store,
            tracker,
            retry,
        }
    }

    /// The tenant living in `namespace`, when there is exactly one
    pub async fn tenant_in(&self, namespace: &str) -> Result<Option<Tenant>, MapperError> {
        let mut tenants = self
            .store
            .list::<Tenant>(namespace, &Selector::new())
            .await?;
        match tenants.len() {
            0 => Ok(None),
            1 => Ok(tenants.pop()),
            count => {
                warn!(
                    namespace = namespace,
                    count = count,
                    "Several tenants found in one namespace, skipping"
                );
                Ok(None)
            }
        }
    }

    /// Reconcile requests for one namespace event
    pub async fn map(&self, namespace: &Namespace) -> Vec<ObjectRef<Tenant>> {
        let Some(name) = namespace.metadata.name.as_deref() else {
            return Vec::new();
        };

        if namespace.metadata.deletion_timestamp.is_some() {
            return self.map_terminating(namespace, name).await;
        }

        let pending = self.tracker.drain(name);
        if pending.is_empty() {
            debug!(namespace = name, "No pending ownership transitions");
            return Vec::new();
        }

        let (requests, complete) = self.map_transitions(name, &pending).await;
        if !complete {
            warn!(
                namespace = name,
                transitions = pending.len(),
                "Ownership cleanup incomplete, keeping transitions for retry"
            );
            self.tracker.restore(name, pending);
        }
        requests
    }

    /// Map the pending transitions of `name` again, against the namespace as
    /// it is now. A namespace that no longer exists is mapped as a bare name.
    pub async fn retry(&self, name: &str) -> Vec<ObjectRef<Tenant>> {
        let namespace = match self.store.get_namespace(name).await {
            Ok(Some(ns)) => ns,
            Ok(None) => bare_namespace(name),
            Err(e) => {
                warn!(namespace = name, error = %e, "Failed to read namespace for retry");
                return Vec::new();
            }
        };
        self.map(&namespace).await
    }

    async fn map_terminating(&self, namespace: &Namespace, name: &str) -> Vec<ObjectRef<Tenant>> {
        let drained = self.tracker.drain(name);

        let mut previous_owners: BTreeSet<String> = previous_resource_owners(&drained);
        if let Some(owner) = namespace
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(RbacType::ResourceManagement.label_key()))
        {
            previous_owners.insert(owner.clone());
        }
        for owner in &previous_owners {
            if !self.release_from_owner(owner, name).await {
                self.tracker.record(
                    name,
                    ManagedNsOpts::new(RbacType::ResourceManagement, owner.as_str(), ""),
                );
            }
        }

        let mut requests = Vec::new();
        match self.store.list::<Tenant>(name, &Selector::new()).await {
            Ok(tenants) if !tenants.is_empty() => {
                for tenant in tenants {
                    match self
                        .store
                        .delete::<Tenant>(name, tenant.name())
                        .await
                    {
                        Ok(()) => {
                            info!(
                                namespace = name,
                                tenant = tenant.name(),
                                "Deleting tenant of terminating namespace"
                            );
                            push_unique(&mut requests, tenant_ref(&tenant));
                        }
                        Err(e) => error!(
                            namespace = name,
                            tenant = tenant.name(),
                            error = %e,
                            "Failed to delete tenant of terminating namespace"
                        ),
                    }
                }
            }
            Ok(_) => self.strip_management_labels(name).await,
            Err(e) => error!(
                namespace = name,
                error = %e,
                "Failed to look up tenants of terminating namespace"
            ),
        }

        metrics::increment_mapper_requests("terminating", requests.len());
        requests
    }

    async fn strip_management_labels(&self, name: &str) {
        let mut namespace = match self.store.get_namespace(name).await {
            Ok(Some(ns)) => ns,
            Ok(None) => return,
            Err(e) => {
                error!(namespace = name, error = %e, "Failed to read terminating namespace");
                return;
            }
        };
        let Some(labels) = namespace.metadata.labels.as_mut() else {
            return;
        };
        let before = labels.len();
        labels.retain(|k, _| !MANAGEMENT_LABELS.contains(&k.as_str()));
        if labels.len() == before {
            return;
        }
        match self.store.update_namespace(&namespace).await {
            Ok(_) => info!(namespace = name, "Stripped management labels from terminating namespace"),
            Err(e) if e.is_not_found() => {
                debug!(namespace = name, "Terminating namespace already gone");
            }
            Err(e) => error!(
                namespace = name,
                error = %e,
                "Failed to strip management labels from terminating namespace"
            ),
        }
    }

    /// Whether the namespace is gone from the owner's cluster secret
    async fn release_from_owner(&self, owner: &str, namespace: &str) -> bool {
        match remove_namespace_from_cluster_secret(&*self.store, owner, namespace, &self.retry)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                error!(
                    namespace = namespace,
                    previous_owner = owner,
                    error = %e,
                    "Failed to remove namespace from previous owner's cluster secret"
                );
                false
            }
        }
    }

    /// `Err` when the owner's tenant could not be looked up
    async fn request_owner(
        &self,
        owner: &str,
        requests: &mut Vec<ObjectRef<Tenant>>,
    ) -> Result<bool, MapperError> {
        match self.tenant_in(owner).await {
            Ok(Some(tenant)) => {
                push_unique(requests, tenant_ref(&tenant));
                Ok(true)
            }
            Ok(None) => {
                debug!(owner = owner, "No tenant for management label value");
                Ok(false)
            }
            Err(e) => {
                error!(owner = owner, error = %e, "Failed to look up tenant");
                Err(e)
            }
        }
    }

    /// Requests for the transitions, and whether every cleanup step succeeded
    async fn map_transitions(
        &self,
        name: &str,
        pending: &[ManagedNsOpts],
    ) -> (Vec<ObjectRef<Tenant>>, bool) {
        let mut complete = true;

        let deletion_types: BTreeSet<RbacType> = pending
            .iter()
            .map(|o| o.resource_deletion_label_value)
            .collect();
        for rbac_type in &deletion_types {
            match delete_non_control_plane_resources(&*self.store, name, &[*rbac_type]).await {
                Ok(deleted) => metrics::increment_rbac_deletions(deleted),
                Err(e) => {
                    complete = false;
                    metrics::increment_rbac_deletion_errors(e.errors.len());
                    error!(
                        namespace = name,
                        rbac_type = rbac_type.as_str(),
                        error = %e,
                        "RBAC cleanup incomplete"
                    );
                }
            }
        }

        let mut requests = Vec::new();

        let previous_owners = previous_resource_owners(pending);
        let mut previous_requested = 0;
        for owner in &previous_owners {
            complete &= self.release_from_owner(owner, name).await;
            match self.request_owner(owner, &mut requests).await {
                Ok(true) => previous_requested += 1,
                Ok(false) => {}
                Err(_) => complete = false,
            }
        }
        metrics::increment_mapper_requests("previous-owner", previous_requested);

        let new_owners: BTreeSet<&str> = pending
            .iter()
            .map(|o| o.new_managing_ns.as_str())
            .filter(|ns| !ns.is_empty())
            .collect();
        let mut new_requested = 0;
        for owner in new_owners {
            match self.request_owner(owner, &mut requests).await {
                Ok(true) => new_requested += 1,
                Ok(false) => {}
                Err(_) => complete = false,
            }
        }
        metrics::increment_mapper_requests("new-owner", new_requested);

        info!(
            namespace = name,
            transitions = pending.len(),
            requests = requests.len(),
            complete = complete,
            "Mapped ownership transitions"
        );
        (requests, complete)
    }
}

/// A namespace known only by name
pub(crate) fn bare_namespace(name: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..ObjectMeta::default()
        },
        ..Namespace::default()
    }
}

fn previous_resource_owners(pending: &[ManagedNsOpts]) -> BTreeSet<String> {
    pending
        .iter()
        .filter(|o| o.resource_deletion_label_value == RbacType::ResourceManagement)
        .map(|o| o.prev_managing_ns.clone())
        .filter(|ns| !ns.is_empty())
        .collect()
}
