//! # Predicates
//!
//! Decide whether a watch event is worth mapping, and park the management
//! label transitions it carries in the [`OwnershipTracker`].
//!
//! Predicates only compare label values and write to the tracker. They never
//! call the API server; the one side effect that does (SSO cleanup) is a
//! pre-reconcile hook run by the dispatcher, selected by [`tenant_transition`].

use crate::controller::rbac::RbacType;
use crate::controller::tracker::{ManagedNsOpts, OwnershipTracker};
use crate::crd::Tenant;
use k8s_openapi::api::core::v1::Namespace;
use std::collections::BTreeMap;

/// Values of the three management labels of one namespace
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagementLabels {
    values: BTreeMap<RbacType, String>,
}

impl ManagementLabels {
    pub fn from_labels(labels: Option<&BTreeMap<String, String>>) -> Self {
        let values = RbacType::ALL
            .into_iter()
            .filter_map(|t| {
                labels
                    .and_then(|l| l.get(t.label_key()))
                    .map(|v| (t, v.clone()))
            })
            .collect();
        Self { values }
    }

    pub fn of(namespace: &Namespace) -> Self {
        Self::from_labels(namespace.metadata.labels.as_ref())
    }

    pub fn get(&self, rbac_type: RbacType) -> Option<&str> {
        self.values.get(&rbac_type).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn with(mut self, rbac_type: RbacType, value: &str) -> Self {
        self.values.insert(rbac_type, value.to_string());
        self
    }
}

/// Label transitions between two snapshots, one per RBAC type that was
/// added, removed or pointed at a different tenant
pub fn management_transitions(
    old: &ManagementLabels,
    new: &ManagementLabels,
) -> Vec<ManagedNsOpts> {
    RbacType::ALL
        .into_iter()
        .filter_map(|t| {
            let before = old.get(t).unwrap_or_default();
            let after = new.get(t).unwrap_or_default();
            (before != after).then(|| ManagedNsOpts::new(t, before, after))
        })
        .collect()
}

fn name_of(namespace: &Namespace) -> &str {
    namespace.metadata.name.as_deref().unwrap_or_default()
}

/// A namespace created already carrying the resource-management label
pub fn namespace_create(tracker: &OwnershipTracker, namespace: &Namespace) -> bool {
    let labels = ManagementLabels::of(namespace);
    let Some(owner) = labels.get(RbacType::ResourceManagement) else {
        return false;
    };
    tracker.record(
        name_of(namespace),
        ManagedNsOpts::new(RbacType::ResourceManagement, "", owner),
    );
    true
}

/// Records every management label transition; true if there was one
pub fn namespace_update(
    tracker: &OwnershipTracker,
    old: &ManagementLabels,
    new: &Namespace,
) -> bool {
    let transitions = management_transitions(old, &ManagementLabels::of(new));
    let interesting = !transitions.is_empty();
    for opts in transitions {
        tracker.record(name_of(new), opts);
    }
    interesting
}

/// Every management label the namespace still carried counts as removed
pub fn namespace_delete(
    tracker: &OwnershipTracker,
    old: &ManagementLabels,
    namespace: &Namespace,
) -> bool {
    let transitions = management_transitions(old, &ManagementLabels::default());
    for opts in transitions {
        tracker.record(name_of(namespace), opts);
    }
    true
}

/// Tenant state changes that need a one-shot action before reconciling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TenantTransition {
    /// SSO configuration removed entirely
    SsoRemoved,
}

impl TenantTransition {
    pub fn as_str(&self) -> &'static str {
        match self {
            TenantTransition::SsoRemoved => "sso-removed",
        }
    }
}

/// `had_sso` is what the previous observation of the tenant said, `None`
/// for the first one
pub fn tenant_transition(had_sso: Option<bool>, tenant: &Tenant) -> Option<TenantTransition> {
    (had_sso == Some(true) && !tenant.has_sso()).then_some(TenantTransition::SsoRemoved)
}
