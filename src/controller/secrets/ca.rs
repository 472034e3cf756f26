//! CA secret: the tenant's self-signed certificate authority.

use super::{base_secret, secret_value, set_secret_value, ManagedSecret, SecretError};
use crate::constants::{KEY_CA_CERT, KEY_TLS_CERT, KEY_TLS_KEY};
use crate::controller::pki::CertificateAuthority;
use crate::crd::Tenant;
use k8s_openapi::api::core::v1::Secret;

pub fn ca_secret_name(tenant_name: &str) -> String {
    format!("{tenant_name}-ca")
}

/// Generated once, never rotated here
pub struct CaSecret<'a> {
    tenant: &'a Tenant,
}

impl<'a> CaSecret<'a> {
    pub fn new(tenant: &'a Tenant) -> Self {
        Self { tenant }
    }
}

impl ManagedSecret for CaSecret<'_> {
    fn kind(&self) -> &'static str {
        "ca"
    }

    fn name(&self) -> String {
        ca_secret_name(self.tenant.name())
    }

    fn build(&self) -> Result<Secret, SecretError> {
        let ca = CertificateAuthority::generate(&format!("{}-ca", self.tenant.name()))?;
        let mut secret = base_secret(self.tenant, self.name(), Some("kubernetes.io/tls"));
        set_secret_value(&mut secret, KEY_TLS_CERT, ca.cert_pem());
        set_secret_value(&mut secret, KEY_CA_CERT, ca.cert_pem());
        set_secret_value(&mut secret, KEY_TLS_KEY, ca.key_pem());
        Ok(secret)
    }

    /// Only a lost `ca.crt` is restored, from `tls.crt`
    fn reconcile_drift(&self, existing: &mut Secret, changed: &mut bool) -> Result<(), SecretError> {
        if secret_value(existing, KEY_CA_CERT).is_none() {
            if let Some(cert) = secret_value(existing, KEY_TLS_CERT) {
                *changed |= set_secret_value(existing, KEY_CA_CERT, &cert);
            }
        }
        Ok(())
    }
}

/// CA stored in the tenant's CA secret
pub(crate) fn load_authority(secret: &Secret, dependent: &str) -> Result<CertificateAuthority, SecretError> {
    let cert = super::require_value(secret, KEY_TLS_CERT, dependent)?;
    let key = super::require_value(secret, KEY_TLS_KEY, dependent)?;
    CertificateAuthority::from_pem(&cert, &key).map_err(|e| SecretError::Invalid {
        secret: dependent.to_string(),
        reason: format!("CA secret is unusable: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::super::test_support::tenant;
    use super::*;
    use crate::controller::secrets::remove_secret_value;

    #[test]
    fn test_build_stores_certificate_twice() {
        let t1 = tenant("t1", "ns1");
        let secret = CaSecret::new(&t1).build().unwrap();
        assert_eq!(secret.type_.as_deref(), Some("kubernetes.io/tls"));
        assert_eq!(
            secret_value(&secret, KEY_CA_CERT),
            secret_value(&secret, KEY_TLS_CERT)
        );
        assert!(load_authority(&secret, "t1-tls").is_ok());
    }

    #[test]
    fn test_drift_restores_ca_crt_only() {
        let t1 = tenant("t1", "ns1");
        let ca = CaSecret::new(&t1);
        let mut secret = ca.build().unwrap();

        let mut changed = false;
        ca.reconcile_drift(&mut secret, &mut changed).unwrap();
        assert!(!changed);

        remove_secret_value(&mut secret, KEY_CA_CERT);
        ca.reconcile_drift(&mut secret, &mut changed).unwrap();
        assert!(changed);
        assert!(secret_value(&secret, KEY_CA_CERT).is_some());
    }
}
