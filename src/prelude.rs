//! # Prelude
//!
//! Re-exports commonly used types and traits for convenience.
//!
//! ```rust
//! use tenant_controller::prelude::*;
//! ```
//!
//! This brings into scope:
//! - All CRD types (Tenant, NamespaceManagement, conditions)
//! - Reconciler types (Reconciler, ReconcilerError, etc.)
//! - Config types (ControllerConfig, ServerConfig, FeatureFlags)
//! - The store trait and its implementations

pub use crate::crd::*;

pub use crate::controller::reconciler::{reconcile, BackoffState, Reconciler, ReconcilerError};

pub use crate::config::{ControllerConfig, FeatureFlags, ServerConfig};

pub use crate::controller::events::{EventDispatcher, PreReconcileHook, PreReconcileHooks};
pub use crate::controller::rbac::{AggregateError, RbacError, RbacType};
pub use crate::controller::secrets::SecretError;
pub use crate::controller::store::memory::MemoryStore;
pub use crate::controller::store::{KubeStore, ResourceStore, StoreError};
pub use crate::controller::tracker::{ManagedNsOpts, OwnershipTracker};
