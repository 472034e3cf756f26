//! # Reconcile
//!
//! One pass over a tenant, in order:
//!
//! 1. Deletion: release every namespace delegated to the tenant, delete its
//!    RBAC there and drop the finalizer
//! 2. Ensure the cleanup finalizer
//! 3. Validate the SSO configuration
//! 4. Namespace management (feature flag `namespace_management`)
//! 5. Generated secrets: CA, TLS, admin credentials, hashed admin, cluster
//!    permissions
//! 6. RBAC in every namespace whose management labels point at the tenant
//! 7. Status, written only when it changed
//!
//! A secret waiting for its dependency ends the pass early with a short
//! requeue. Everything else that fails is returned to the error policy.

use super::status::apply_status;
use super::types::{Reconciler, ReconcilerError};
use crate::config::FLAG_NAMESPACE_MANAGEMENT;
use crate::constants::{
    ANNOTATION_MANAGED_VIA_NAMESPACE_MANAGEMENT, LABEL_MANAGED_BY, MANAGEMENT_LABELS,
    TENANT_FINALIZER,
};
use crate::controller::namespace_management::reconcile_namespace_management;
use crate::controller::rbac::{delete_tenant_rbac, ensure_namespace_rbac, AggregateError, RbacType};
use crate::controller::retry::{retry_on_conflict, RetryConfig};
use crate::controller::secrets::{desired_namespaces, reconcile_tenant_secrets, SecretContext};
use crate::controller::selector::{Requirement, Selector};
use crate::controller::store::{ResourceStore, StoreError};
use crate::crd::{
    Condition, Tenant, CONDITION_NAMESPACE_MANAGEMENT, CONDITION_RECONCILED,
    REASON_DEPENDENCY_NOT_READY, REASON_NAMESPACE_MANAGEMENT_DISABLED, REASON_RECONCILE_FAILED,
    REASON_SUCCESS, REASON_VALIDATION_FAILED,
};
use crate::observability::metrics;
use kube_runtime::controller::Action;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn, Instrument};

/// `namespace/name`, the key of per-tenant controller state
pub fn tenant_key(tenant: &Tenant) -> String {
    format!("{}/{}", tenant.namespace_name(), tenant.name())
}

pub async fn reconcile<S: ResourceStore>(
    tenant: Arc<Tenant>,
    ctx: Arc<Reconciler<S>>,
) -> Result<Action, ReconcilerError> {
    let span = tracing::info_span!(
        "tenant.reconcile",
        tenant.name = tenant.name(),
        tenant.namespace = tenant.namespace_name(),
        tenant.generation = tenant.metadata.generation.unwrap_or(0),
    );

    async move {
        let start = Instant::now();
        metrics::increment_reconciliations();

        let result = reconcile_tenant(&tenant, &ctx).await;
        metrics::observe_reconciliation_duration(start.elapsed().as_secs_f64());

        match &result {
            Ok(action) => {
                ctx.reset_backoff(&tenant_key(&tenant));
                debug!(action = ?action, "Reconciled tenant");
            }
            Err(ReconcilerError::Validation(_)) => {}
            Err(e) => record_failure(&*ctx.store, &tenant, e).await,
        }
        result
    }
    .instrument(span)
    .await
}

async fn record_failure<S: ResourceStore>(store: &S, tenant: &Tenant, error: &ReconcilerError) {
    if tenant.is_being_deleted() {
        return;
    }
    let condition = Condition::new(
        CONDITION_RECONCILED,
        false,
        REASON_RECONCILE_FAILED,
        error.to_string(),
    );
    if let Err(e) = apply_status(store, tenant, [condition], None).await {
        warn!(error = %e, "Failed to record reconcile failure in status");
    }
}

async fn reconcile_tenant<S: ResourceStore>(
    tenant: &Tenant,
    ctx: &Reconciler<S>,
) -> Result<Action, ReconcilerError> {
    let store = &*ctx.store;
    let retry = ctx.config.conflict_retry();

    if tenant.is_being_deleted() {
        return cleanup(store, tenant, &retry).await;
    }

    ensure_finalizer(store, tenant, &retry).await?;

    if let Some(sso) = &tenant.spec.sso {
        if let Err(message) = sso.validate() {
            warn!(error = %message, "Tenant SSO configuration is invalid");
            let condition = Condition::new(
                CONDITION_RECONCILED,
                false,
                REASON_VALIDATION_FAILED,
                message.clone(),
            );
            apply_status(store, tenant, [condition], None).await?;
            return Err(ReconcilerError::Validation(message));
        }
    }

    let flags = ctx.feature_flags();
    let mut conditions = Vec::new();

    if flags.flag(FLAG_NAMESPACE_MANAGEMENT) {
        let report = reconcile_namespace_management(store, tenant, &retry).await?;
        conditions.push(report.condition());
    } else if !tenant.spec.namespace_management.is_empty() {
        conditions.push(Condition::new(
            CONDITION_NAMESPACE_MANAGEMENT,
            false,
            REASON_NAMESPACE_MANAGEMENT_DISABLED,
            "namespace management is disabled on this controller",
        ));
    }

    let secret_ctx = SecretContext {
        cluster_scoped: ctx.config.is_cluster_scoped(tenant.namespace_name()),
        namespaces: desired_namespaces(store, tenant).await?,
        retry,
    };
    match reconcile_tenant_secrets(store, tenant, &secret_ctx).await {
        Ok(report) => {
            let written = report.iter().filter(|(_, o)| o.is_write()).count();
            debug!(secrets = report.len(), written = written, "Secrets reconciled");
        }
        Err(e) if e.is_dependency_not_ready() => {
            info!(reason = %e, "Secret dependency not ready, requeueing");
            conditions.push(Condition::new(
                CONDITION_RECONCILED,
                false,
                REASON_DEPENDENCY_NOT_READY,
                e.to_string(),
            ));
            apply_status(store, tenant, conditions, None).await?;
            metrics::increment_requeues_total("dependency-not-ready");
            return Ok(Action::requeue(ctx.config.dependency_requeue_duration()));
        }
        Err(e) => return Err(e.into()),
    }

    let managed = ensure_managed_rbac(store, tenant).await?;
    metrics::set_managed_namespaces(tenant.namespace_name(), managed.len());

    conditions.push(Condition::new(
        CONDITION_RECONCILED,
        true,
        REASON_SUCCESS,
        "tenant reconciled",
    ));
    apply_status(store, tenant, conditions, Some(managed)).await?;

    metrics::increment_requeues_total("resync");
    Ok(Action::requeue(ctx.config.resync_duration()))
}

fn delegated_to(tenant_namespace: &str, rbac_type: RbacType) -> Selector {
    Selector::new().and(Requirement::equals(rbac_type.label_key(), tenant_namespace))
}

/// Ensure RBAC for every delegation; returns the delegated namespaces, sorted
async fn ensure_managed_rbac<S: ResourceStore>(
    store: &S,
    tenant: &Tenant,
) -> Result<Vec<String>, ReconcilerError> {
    let mut managed = BTreeSet::new();

    for rbac_type in RbacType::ALL {
        let namespaces = store
            .list_namespaces(&delegated_to(tenant.namespace_name(), rbac_type))
            .await?;
        for namespace in namespaces {
            if namespace.metadata.deletion_timestamp.is_some() {
                continue;
            }
            let Some(name) = namespace.metadata.name else {
                continue;
            };
            let outcome = ensure_namespace_rbac(store, tenant, &name, rbac_type).await?;
            if !outcome.is_unchanged() {
                info!(
                    namespace = %name,
                    rbac_type = rbac_type.as_str(),
                    created = outcome.created,
                    updated = outcome.updated,
                    "Ensured namespace RBAC"
                );
            }
            managed.insert(name);
        }
    }

    Ok(managed.into_iter().collect())
}

async fn ensure_finalizer<S: ResourceStore>(
    store: &S,
    tenant: &Tenant,
    retry: &RetryConfig,
) -> Result<(), StoreError> {
    if tenant.has_finalizer(TENANT_FINALIZER) {
        return Ok(());
    }
    retry_on_conflict(retry, "add tenant finalizer", || async move {
        let Some(mut current) = store
            .get::<Tenant>(tenant.namespace_name(), tenant.name())
            .await?
        else {
            return Ok(());
        };
        if current.has_finalizer(TENANT_FINALIZER) {
            return Ok(());
        }
        current
            .metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(TENANT_FINALIZER.to_string());
        store.update(&current).await?;
        debug!("Added tenant finalizer");
        Ok(())
    })
    .await
}

async fn remove_finalizer<S: ResourceStore>(
    store: &S,
    tenant: &Tenant,
    retry: &RetryConfig,
) -> Result<(), StoreError> {
    retry_on_conflict(retry, "remove tenant finalizer", || async move {
        let Some(mut current) = store
            .get::<Tenant>(tenant.namespace_name(), tenant.name())
            .await?
        else {
            return Ok(());
        };
        let Some(finalizers) = current.metadata.finalizers.as_mut() else {
            return Ok(());
        };
        let before = finalizers.len();
        finalizers.retain(|f| f != TENANT_FINALIZER);
        if finalizers.len() == before {
            return Ok(());
        }
        match store.update(&current).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    })
    .await
}

/// Strip the management labels pointing at `tenant_namespace`, and the
/// namespace-management marker along with `managed-by`
async fn release_namespace<S: ResourceStore>(
    store: &S,
    tenant_namespace: &str,
    namespace: &str,
    retry: &RetryConfig,
) -> Result<bool, StoreError> {
    let operation = format!("release namespace {namespace}");
    retry_on_conflict(retry, &operation, || async move {
        let Some(mut ns) = store.get_namespace(namespace).await? else {
            return Ok(false);
        };
        let Some(labels) = ns.metadata.labels.as_mut() else {
            return Ok(false);
        };
        let resource_managed =
            labels.get(LABEL_MANAGED_BY).map(String::as_str) == Some(tenant_namespace);
        let before = labels.len();
        labels.retain(|k, v| {
            !(MANAGEMENT_LABELS.contains(&k.as_str()) && v.as_str() == tenant_namespace)
        });
        if labels.len() == before {
            return Ok(false);
        }
        if resource_managed {
            if let Some(annotations) = ns.metadata.annotations.as_mut() {
                annotations.remove(ANNOTATION_MANAGED_VIA_NAMESPACE_MANAGEMENT);
            }
        }
        match store.update_namespace(&ns).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    })
    .await
}

async fn cleanup<S: ResourceStore>(
    store: &S,
    tenant: &Tenant,
    retry: &RetryConfig,
) -> Result<Action, ReconcilerError> {
    if !tenant.has_finalizer(TENANT_FINALIZER) {
        return Ok(Action::await_change());
    }
    let tenant_ns = tenant.namespace_name();

    let mut delegated = BTreeSet::new();
    for rbac_type in RbacType::ALL {
        for namespace in store
            .list_namespaces(&delegated_to(tenant_ns, rbac_type))
            .await?
        {
            if let Some(name) = namespace.metadata.name {
                delegated.insert(name);
            }
        }
    }

    let mut errors = Vec::new();
    for namespace in &delegated {
        release_namespace(store, tenant_ns, namespace, retry).await?;
        match delete_tenant_rbac(store, tenant, namespace).await {
            Ok(deleted) => metrics::increment_rbac_deletions(deleted),
            Err(e) => {
                metrics::increment_rbac_deletion_errors(e.errors.len());
                errors.extend(e.errors);
            }
        }
    }
    if !errors.is_empty() {
        return Err(AggregateError { errors }.into());
    }

    remove_finalizer(store, tenant, retry).await?;
    metrics::clear_managed_namespaces(tenant_ns);
    info!(released = delegated.len(), "Tenant cleanup complete");
    Ok(Action::await_change())
}
