//! # RBAC Reconciler
//!
//! Roles and role bindings the tenant control plane needs in the namespaces
//! it manages.
//!
//! Every generated object carries two labels: the component it grants
//! access to and the RBAC type (management relationship) it belongs to. When
//! one relationship ends, [`delete_non_control_plane_resources`] removes only
//! the objects of that type; RBAC for the other relationships in the same
//! namespace stays in place.
//!
//! - `delete.rs` - Selective deletion with aggregated errors
//! - `ensure.rs` - Create or drift-update per-namespace roles and bindings
//! - `rules.rs` - Policy rules per RBAC type and component

mod delete;
mod ensure;
mod rules;

pub use delete::{delete_non_control_plane_resources, delete_tenant_rbac, AggregateError};
pub(crate) use delete::delete_matching;
pub use ensure::{ensure_namespace_rbac, RbacOutcome};
pub use rules::policy_rules;

use crate::constants::{
    COMPONENT_APPLICATIONSET_CONTROLLER, COMPONENT_APPLICATION_CONTROLLER, COMPONENT_SERVER,
    LABEL_APPSETS_MANAGED_BY, LABEL_APPS_MANAGED_BY, LABEL_MANAGED_BY,
    RBAC_TYPE_APPSET_MANAGEMENT, RBAC_TYPE_APP_MANAGEMENT, RBAC_TYPE_RESOURCE_MANAGEMENT,
};
use crate::controller::store::StoreError;
use thiserror::Error;

/// Independent management relationships a tenant can hold over a namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RbacType {
    ResourceManagement,
    AppManagement,
    AppsetManagement,
}

impl RbacType {
    pub const ALL: [RbacType; 3] = [
        RbacType::ResourceManagement,
        RbacType::AppManagement,
        RbacType::AppsetManagement,
    ];

    /// Value of the rbac-type label
    pub fn as_str(&self) -> &'static str {
        match self {
            RbacType::ResourceManagement => RBAC_TYPE_RESOURCE_MANAGEMENT,
            RbacType::AppManagement => RBAC_TYPE_APP_MANAGEMENT,
            RbacType::AppsetManagement => RBAC_TYPE_APPSET_MANAGEMENT,
        }
    }

    /// Namespace label that delegates this relationship
    pub fn label_key(&self) -> &'static str {
        match self {
            RbacType::ResourceManagement => LABEL_MANAGED_BY,
            RbacType::AppManagement => LABEL_APPS_MANAGED_BY,
            RbacType::AppsetManagement => LABEL_APPSETS_MANAGED_BY,
        }
    }

    pub fn for_label(key: &str) -> Option<RbacType> {
        Self::ALL.into_iter().find(|t| t.label_key() == key)
    }

    pub fn parse(value: &str) -> Option<RbacType> {
        Self::ALL.into_iter().find(|t| t.as_str() == value)
    }

    /// Control-plane components granted access under this relationship
    pub fn components(&self) -> &'static [&'static str] {
        match self {
            RbacType::ResourceManagement => {
                &[COMPONENT_APPLICATION_CONTROLLER, COMPONENT_SERVER]
            }
            RbacType::AppManagement => &[COMPONENT_SERVER],
            RbacType::AppsetManagement => &[COMPONENT_APPLICATIONSET_CONTROLLER],
        }
    }
}

impl std::fmt::Display for RbacType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum RbacError {
    #[error("failed to list {kind} in {namespace} matching '{selector}': {source}")]
    List {
        kind: String,
        namespace: String,
        selector: String,
        source: StoreError,
    },

    #[error("failed to delete {kind} {namespace}/{name}: {source}")]
    Delete {
        kind: String,
        namespace: String,
        name: String,
        source: StoreError,
    },

    #[error("failed to write {kind} {namespace}/{name}: {source}")]
    Write {
        kind: String,
        namespace: String,
        name: String,
        source: StoreError,
    },
}

/// Name shared by the role and role binding of one component and type
pub fn rbac_object_name(tenant_name: &str, component: &str, rbac_type: RbacType) -> String {
    format!("{tenant_name}-{component}-{rbac_type}")
}

/// Service account the component runs as in the tenant namespace
pub fn service_account_name(tenant_name: &str, component: &str) -> String {
    format!("{tenant_name}-{component}")
}
