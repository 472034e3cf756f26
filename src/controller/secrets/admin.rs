//! Admin credentials secret: the clear-text admin password.
//!
//! Created with the ignore-drift annotation, so once it exists reconciliation
//! never rewrites it. Deleting the secret is the way to get a new password.

use super::{base_secret, secret_value, set_secret_value, ManagedSecret, SecretError};
use crate::constants::{ANNOTATION_IGNORE_DRIFT, KEY_ADMIN_PASSWORD};
use crate::controller::pki::generate_password;
use crate::crd::Tenant;
use k8s_openapi::api::core::v1::Secret;
use std::collections::BTreeMap;

pub fn admin_secret_name(tenant_name: &str) -> String {
    format!("{tenant_name}-cluster")
}

pub struct AdminCredentialsSecret<'a> {
    tenant: &'a Tenant,
}

impl<'a> AdminCredentialsSecret<'a> {
    pub fn new(tenant: &'a Tenant) -> Self {
        Self { tenant }
    }
}

impl ManagedSecret for AdminCredentialsSecret<'_> {
    fn kind(&self) -> &'static str {
        "admin-credentials"
    }

    fn name(&self) -> String {
        admin_secret_name(self.tenant.name())
    }

    fn build(&self) -> Result<Secret, SecretError> {
        let password = generate_password()?;
        let mut secret = base_secret(self.tenant, self.name(), Some("Opaque"));
        secret.metadata.annotations = Some(BTreeMap::from([(
            ANNOTATION_IGNORE_DRIFT.to_string(),
            "true".to_string(),
        )]));
        set_secret_value(&mut secret, KEY_ADMIN_PASSWORD, &password);
        Ok(secret)
    }

    /// Reached only when someone removed the annotation; an existing password
    /// is still kept, a missing one is generated
    fn reconcile_drift(&self, existing: &mut Secret, changed: &mut bool) -> Result<(), SecretError> {
        if secret_value(existing, KEY_ADMIN_PASSWORD).is_none() {
            let password = generate_password()?;
            *changed |= set_secret_value(existing, KEY_ADMIN_PASSWORD, &password);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::tenant;
    use super::super::{ignores_drift, remove_secret_value};
    use super::*;

    #[test]
    fn test_built_secret_ignores_drift() {
        let t1 = tenant("t1", "ns1");
        let secret = AdminCredentialsSecret::new(&t1).build().unwrap();
        assert!(ignores_drift(&secret));
        assert_eq!(secret_value(&secret, KEY_ADMIN_PASSWORD).unwrap().len(), 24);
    }

    #[test]
    fn test_existing_password_survives_drift_check() {
        let t1 = tenant("t1", "ns1");
        let admin = AdminCredentialsSecret::new(&t1);
        let mut secret = admin.build().unwrap();
        let password = secret_value(&secret, KEY_ADMIN_PASSWORD);

        let mut changed = false;
        admin.reconcile_drift(&mut secret, &mut changed).unwrap();
        assert!(!changed);
        assert_eq!(secret_value(&secret, KEY_ADMIN_PASSWORD), password);

        remove_secret_value(&mut secret, KEY_ADMIN_PASSWORD);
        admin.reconcile_drift(&mut secret, &mut changed).unwrap();
        assert!(changed);
    }
}
