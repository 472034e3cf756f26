//! # Custom Resource Definitions
//!
//! CRD types for the Tenant Controller.
//!
//! ## Module Structure
//!
//! - `spec.rs` - The `Tenant` resource and its spec types
//! - `namespace_management.rs` - The `NamespaceManagement` request resource
//! - `status.rs` - Status and condition types

mod namespace_management;
mod spec;
mod status;

pub use namespace_management::{NamespaceManagement, NamespaceManagementSpec};
pub use spec::{
    AddonsSpec, DexSpec, KeycloakSpec, NamespaceManagementRule, SsoProvider, SsoSpec, Tenant,
    TenantSpec,
};
pub use status::*;
