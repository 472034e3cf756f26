//! # Reconciler
//!
//! Core reconciliation logic for `Tenant` resources.
//!
//! The reconciler is level-triggered: every pass recomputes the desired
//! secrets, RBAC and status from the tenant and the namespace labels, so it
//! does not matter which event caused it. Ownership changes between tenants
//! are handled before the pass by the namespace mapper, which requests both
//! the previous and the new owner.

pub mod reconcile;
pub mod status;
pub mod types;

pub use reconcile::{reconcile, tenant_key};
pub use status::{apply_status, next_status};
pub use types::{BackoffState, Reconciler, ReconcilerError};
