//! Selective RBAC deletion.
//!
//! Deletion never stops at the first failure: every component is attempted
//! and the failures are returned together.

use super::{RbacError, RbacType};
use crate::constants::{
    LABEL_COMPONENT, LABEL_RBAC_TYPE, LABEL_TENANT_NAME, LABEL_TENANT_NAMESPACE, RBAC_COMPONENTS,
};
use crate::controller::selector::{Requirement, Selector};
use crate::controller::store::{kind_of, NamespacedObject, ResourceStore};
use crate::crd::Tenant;
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::Resource;
use thiserror::Error;
use tracing::{debug, error, info};

/// Every failure collected during one batched RBAC operation
#[derive(Debug, Error)]
#[error("{} RBAC operation(s) failed: {}", .errors.len(), join_errors(.errors))]
pub struct AggregateError {
    pub errors: Vec<RbacError>,
}

fn join_errors(errors: &[RbacError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl AggregateError {
    pub(crate) fn into_result(
        errors: Vec<RbacError>,
        deleted: usize,
    ) -> Result<usize, AggregateError> {
        if errors.is_empty() {
            Ok(deleted)
        } else {
            Err(AggregateError { errors })
        }
    }
}

/// Delete every object of kind `K` in `namespace` matching `selector`.
/// Returns the number of deletions; failures are appended to `errors`.
pub(crate) async fn delete_matching<K, S>(
    store: &S,
    namespace: &str,
    selector: &Selector,
    errors: &mut Vec<RbacError>,
) -> usize
where
    K: NamespacedObject,
    S: ResourceStore,
{
    let kind = kind_of::<K>();
    let objects = match store.list::<K>(namespace, selector).await {
        Ok(objects) => objects,
        Err(source) => {
            error!(
                namespace = namespace,
                kind = %kind,
                selector = %selector,
                error = %source,
                "Failed to list objects for deletion"
            );
            errors.push(RbacError::List {
                kind,
                namespace: namespace.to_string(),
                selector: selector.to_string(),
                source,
            });
            return 0;
        }
    };

    let mut deleted = 0;
    for obj in objects {
        let Some(name) = obj.meta().name.clone() else {
            continue;
        };
        match store.delete::<K>(namespace, &name).await {
            Ok(()) => {
                debug!(namespace = namespace, kind = %kind, name = %name, "Deleted object");
                deleted += 1;
            }
            Err(source) => {
                error!(
                    namespace = namespace,
                    kind = %kind,
                    name = %name,
                    error = %source,
                    "Failed to delete object"
                );
                errors.push(RbacError::Delete {
                    kind: kind.clone(),
                    namespace: namespace.to_string(),
                    name,
                    source,
                });
            }
        }
    }
    deleted
}

/// Delete the roles and role bindings of the given RBAC types in `namespace`.
///
/// For each control-plane component the selector is
/// `component == <component>, rbac-type in (<types>)`; RBAC belonging to any
/// other type stays untouched. Returns the number of deleted objects.
pub async fn delete_non_control_plane_resources<S>(
    store: &S,
    namespace: &str,
    deletion_label_values: &[RbacType],
) -> Result<usize, AggregateError>
where
    S: ResourceStore,
{
    if deletion_label_values.is_empty() {
        return Ok(0);
    }

    let rbac_type = Requirement::is_in(
        LABEL_RBAC_TYPE,
        deletion_label_values.iter().map(RbacType::as_str),
    );

    let mut errors = Vec::new();
    let mut deleted = 0;
    for component in RBAC_COMPONENTS {
        let selector = Selector::new()
            .and(Requirement::equals(LABEL_COMPONENT, component))
            .and(rbac_type.clone());
        deleted += delete_matching::<Role, S>(store, namespace, &selector, &mut errors).await;
        deleted +=
            delete_matching::<RoleBinding, S>(store, namespace, &selector, &mut errors).await;
    }

    info!(
        namespace = namespace,
        rbac_types = %rbac_type,
        deleted = deleted,
        failures = errors.len(),
        "Deleted RBAC for ended management relationships"
    );
    AggregateError::into_result(errors, deleted)
}

/// Delete the roles and role bindings generated for `tenant` in `namespace`
pub async fn delete_tenant_rbac<S>(
    store: &S,
    tenant: &Tenant,
    namespace: &str,
) -> Result<usize, AggregateError>
where
    S: ResourceStore,
{
    let selector = Selector::new()
        .and(Requirement::equals(
            LABEL_TENANT_NAMESPACE,
            tenant.namespace_name(),
        ))
        .and(Requirement::equals(LABEL_TENANT_NAME, tenant.name()));

    let mut errors = Vec::new();
    let mut deleted = delete_matching::<Role, S>(store, namespace, &selector, &mut errors).await;
    deleted += delete_matching::<RoleBinding, S>(store, namespace, &selector, &mut errors).await;
    AggregateError::into_result(errors, deleted)
}
