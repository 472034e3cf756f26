//! # NamespaceManagement
//!
//! Created inside a namespace to ask a tenant to manage it. The tenant's
//! `namespaceManagement` rules decide whether the request is honoured.

use super::status::NamespaceManagementStatus;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "NamespaceManagement",
    group = "tenancy.octopilot.io",
    version = "v1alpha1",
    namespaced,
    status = "NamespaceManagementStatus",
    shortname = "nsm"
)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceManagementSpec {
    /// Namespace of the tenant that should manage this namespace
    pub managed_by: String,
}
