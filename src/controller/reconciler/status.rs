//! # Status
//!
//! Tenant status updates. The status subresource is written only when a
//! condition, the managed namespace list or the observed generation changed,
//! so a converged tenant produces no writes.

use super::types::ReconcilerError;
use crate::controller::store::ResourceStore;
use crate::crd::{upsert_condition, Condition, Tenant, TenantStatus};
use tracing::debug;

/// The status `tenant` should have after applying `conditions` and
/// `managed_namespaces`, or `None` when nothing would change
pub fn next_status(
    tenant: &Tenant,
    conditions: impl IntoIterator<Item = Condition>,
    managed_namespaces: Option<Vec<String>>,
) -> Option<TenantStatus> {
    let mut next = tenant.status.clone().unwrap_or_default();
    let mut changed = false;

    for condition in conditions {
        changed |= upsert_condition(&mut next.conditions, condition);
    }
    if let Some(managed) = managed_namespaces {
        if next.managed_namespaces != managed {
            next.managed_namespaces = managed;
            changed = true;
        }
    }
    if tenant.metadata.generation.is_some()
        && next.observed_generation != tenant.metadata.generation
    {
        next.observed_generation = tenant.metadata.generation;
        changed = true;
    }

    if !changed {
        return None;
    }
    next.last_reconcile_time = Some(chrono::Utc::now().to_rfc3339());
    Some(next)
}

/// Write the tenant status if it changed. Returns whether a write happened.
pub async fn apply_status<S: ResourceStore>(
    store: &S,
    tenant: &Tenant,
    conditions: impl IntoIterator<Item = Condition>,
    managed_namespaces: Option<Vec<String>>,
) -> Result<bool, ReconcilerError> {
    let Some(status) = next_status(tenant, conditions, managed_namespaces) else {
        debug!(
            tenant = tenant.name(),
            namespace = tenant.namespace_name(),
            "Status unchanged, skipping update"
        );
        return Ok(false);
    };

    store
        .update_status::<Tenant>(
            tenant.namespace_name(),
            tenant.name(),
            serde_json::to_value(&status)?,
        )
        .await?;
    debug!(
        tenant = tenant.name(),
        namespace = tenant.namespace_name(),
        "Updated tenant status"
    );
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{TenantSpec, CONDITION_RECONCILED, REASON_SUCCESS};

    fn reconciled() -> Condition {
        Condition::new(CONDITION_RECONCILED, true, REASON_SUCCESS, "tenant reconciled")
    }

    #[test]
    fn test_first_status_is_a_change() {
        let tenant = Tenant::new("t1", TenantSpec::default());
        let status = next_status(&tenant, [reconciled()], Some(vec!["ns1".to_string()]));
        let status = status.expect("status should change");
        assert_eq!(status.managed_namespaces, vec!["ns1".to_string()]);
        assert!(status.last_reconcile_time.is_some());
    }

    #[test]
    fn test_same_observation_is_not_a_change() {
        let mut tenant = Tenant::new("t1", TenantSpec::default());
        tenant.status = next_status(&tenant, [reconciled()], Some(vec!["ns1".to_string()]));
        assert!(next_status(&tenant, [reconciled()], Some(vec!["ns1".to_string()])).is_none());
        assert!(next_status(&tenant, [reconciled()], None).is_none());
    }

    #[test]
    fn test_new_generation_is_observed() {
        let mut tenant = Tenant::new("t1", TenantSpec::default());
        tenant.metadata.generation = Some(1);
        tenant.status = next_status(&tenant, [reconciled()], None);
        tenant.metadata.generation = Some(2);
        let status = next_status(&tenant, [reconciled()], None).expect("generation moved");
        assert_eq!(status.observed_generation, Some(2));
    }
}
