//! Create or drift-update the roles and role bindings of one management
//! relationship in one namespace.

use super::{policy_rules, rbac_object_name, service_account_name, RbacError, RbacType};
use crate::constants::{
    CONTROLLER_NAME, LABEL_COMPONENT, LABEL_PART_OF, LABEL_RBAC_TYPE, LABEL_TENANT_NAME,
    LABEL_TENANT_NAMESPACE,
};
use crate::controller::store::{kind_of, NamespacedObject, ResourceStore};
use crate::crd::Tenant;
use k8s_openapi::api::rbac::v1::{Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Writes performed by one [`ensure_namespace_rbac`] call
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RbacOutcome {
    pub created: usize,
    pub updated: usize,
}

impl RbacOutcome {
    pub fn is_unchanged(&self) -> bool {
        self.created == 0 && self.updated == 0
    }

    fn absorb(&mut self, other: RbacOutcome) {
        self.created += other.created;
        self.updated += other.updated;
    }
}

fn rbac_labels(tenant: &Tenant, component: &str, rbac_type: RbacType) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_COMPONENT.to_string(), component.to_string()),
        (LABEL_RBAC_TYPE.to_string(), rbac_type.as_str().to_string()),
        (
            LABEL_TENANT_NAMESPACE.to_string(),
            tenant.namespace_name().to_string(),
        ),
        (LABEL_TENANT_NAME.to_string(), tenant.name().to_string()),
        (LABEL_PART_OF.to_string(), CONTROLLER_NAME.to_string()),
    ])
}

/// Copy missing or different `desired` labels onto `labels`; true if any changed.
/// Labels added by others are left alone.
fn merge_labels(
    labels: &mut Option<BTreeMap<String, String>>,
    desired: &BTreeMap<String, String>,
) -> bool {
    let labels = labels.get_or_insert_with(BTreeMap::new);
    let mut changed = false;
    for (key, value) in desired {
        if labels.get(key) != Some(value) {
            labels.insert(key.clone(), value.clone());
            changed = true;
        }
    }
    changed
}

fn write_error<K: NamespacedObject>(
    namespace: &str,
    name: &str,
    source: crate::controller::store::StoreError,
) -> RbacError {
    RbacError::Write {
        kind: kind_of::<K>(),
        namespace: namespace.to_string(),
        name: name.to_string(),
        source,
    }
}

/// Create `desired` if absent; otherwise let `drift` patch the existing object
/// and update it when something changed.
async fn apply<K, S, F>(
    store: &S,
    namespace: &str,
    name: &str,
    desired: K,
    drift: F,
) -> Result<RbacOutcome, RbacError>
where
    K: NamespacedObject,
    S: ResourceStore,
    F: FnOnce(&mut K, &K) -> bool + Send,
{
    let existing = store
        .get::<K>(namespace, name)
        .await
        .map_err(|e| write_error::<K>(namespace, name, e))?;

    match existing {
        None => {
            store
                .create(&desired)
                .await
                .map_err(|e| write_error::<K>(namespace, name, e))?;
            debug!(namespace = namespace, name = name, kind = %kind_of::<K>(), "Created RBAC object");
            Ok(RbacOutcome {
                created: 1,
                updated: 0,
            })
        }
        Some(mut existing) => {
            if !drift(&mut existing, &desired) {
                return Ok(RbacOutcome::default());
            }
            store
                .update(&existing)
                .await
                .map_err(|e| write_error::<K>(namespace, name, e))?;
            debug!(namespace = namespace, name = name, kind = %kind_of::<K>(), "Updated drifted RBAC object");
            Ok(RbacOutcome {
                created: 0,
                updated: 1,
            })
        }
    }
}

fn desired_role(
    tenant: &Tenant,
    namespace: &str,
    component: &str,
    rbac_type: RbacType,
) -> Role {
    Role {
        metadata: ObjectMeta {
            name: Some(rbac_object_name(tenant.name(), component, rbac_type)),
            namespace: Some(namespace.to_string()),
            labels: Some(rbac_labels(tenant, component, rbac_type)),
            ..ObjectMeta::default()
        },
        rules: Some(policy_rules(rbac_type, component)),
    }
}

fn desired_role_binding(
    tenant: &Tenant,
    namespace: &str,
    component: &str,
    rbac_type: RbacType,
) -> RoleBinding {
    let name = rbac_object_name(tenant.name(), component, rbac_type);
    RoleBinding {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(rbac_labels(tenant, component, rbac_type)),
            ..ObjectMeta::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name,
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: service_account_name(tenant.name(), component),
            namespace: Some(tenant.namespace_name().to_string()),
            api_group: None,
        }]),
    }
}

/// Ensure the roles and role bindings `tenant` needs in `namespace` for one
/// management relationship exist and match their desired form.
pub async fn ensure_namespace_rbac<S>(
    store: &S,
    tenant: &Tenant,
    namespace: &str,
    rbac_type: RbacType,
) -> Result<RbacOutcome, RbacError>
where
    S: ResourceStore,
{
    let mut outcome = RbacOutcome::default();

    for component in rbac_type.components() {
        let name = rbac_object_name(tenant.name(), component, rbac_type);

        let role = desired_role(tenant, namespace, component, rbac_type);
        outcome.absorb(
            apply(store, namespace, &name, role, |existing: &mut Role, desired| {
                let mut changed = merge_labels(&mut existing.metadata.labels, desired_labels(desired));
                if existing.rules != desired.rules {
                    existing.rules.clone_from(&desired.rules);
                    changed = true;
                }
                changed
            })
            .await?,
        );

        let binding = desired_role_binding(tenant, namespace, component, rbac_type);
        if let Some(existing) = store
            .get::<RoleBinding>(namespace, &name)
            .await
            .map_err(|e| write_error::<RoleBinding>(namespace, &name, e))?
        {
            // roleRef is immutable; a binding pointing elsewhere is replaced.
            if existing.role_ref != binding.role_ref {
                store
                    .delete::<RoleBinding>(namespace, &name)
                    .await
                    .map_err(|e| write_error::<RoleBinding>(namespace, &name, e))?;
            }
        }
        outcome.absorb(
            apply(
                store,
                namespace,
                &name,
                binding,
                |existing: &mut RoleBinding, desired| {
                    let mut changed =
                        merge_labels(&mut existing.metadata.labels, desired_labels(desired));
                    if existing.subjects != desired.subjects {
                        existing.subjects.clone_from(&desired.subjects);
                        changed = true;
                    }
                    changed
                },
            )
            .await?,
        );
    }

    if !outcome.is_unchanged() {
        info!(
            tenant = tenant.name(),
            tenant_namespace = tenant.namespace_name(),
            namespace = namespace,
            rbac_type = rbac_type.as_str(),
            created = outcome.created,
            updated = outcome.updated,
            "Reconciled namespace RBAC"
        );
    }
    Ok(outcome)
}

fn desired_labels<K: kube::Resource>(obj: &K) -> &BTreeMap<String, String> {
    static EMPTY: BTreeMap<String, String> = BTreeMap::new();
    obj.meta().labels.as_ref().unwrap_or(&EMPTY)
}
