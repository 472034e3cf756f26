//! # Tenant Controller
//!
//! A Kubernetes controller that keeps multi-tenant application-delivery
//! instances consistent with namespace ownership.
//!
//! ## Overview
//!
//! Namespaces delegate management to a tenant through labels whose value is
//! the tenant's namespace. The controller:
//!
//! 1. **Tracks ownership changes** - Label transitions on namespaces are
//!    recorded and consolidated before any tenant is reconciled
//! 2. **Maintains RBAC** - Roles and role bindings for the tenant's
//!    control-plane components in every delegated namespace, removed when a
//!    delegation ends
//! 3. **Generates secrets** - CA, TLS, admin credentials and the
//!    cluster-permissions secret listing the namespaces a tenant may manage
//! 4. **Labels namespaces on request** - `NamespaceManagement` objects,
//!    behind the `namespace_management` feature flag
//!
//! ## Usage
//!
//! Configuration comes from environment variables, see `config`.

use anyhow::Result;
use tenant_controller::runtime::{initialization::initialize, watch_loop::run_watch_loop};

#[tokio::main]
async fn main() -> Result<()> {
    let init = initialize().await?;

    run_watch_loop(
        init.client,
        init.reconciler,
        init.dispatcher,
        init.requests,
        init.server_state,
        init.controller_config,
    )
    .await
}
