//! TLS secret: leaf certificate for the tenant's services, signed by its CA.

use super::ca::{ca_secret_name, load_authority};
use super::{base_secret, require_secret, secret_value, set_secret_value, ManagedSecret, SecretError};
use crate::constants::{KEY_TLS_CERT, KEY_TLS_KEY};
use crate::controller::pki::{CertificateAuthority, LeafCheck};
use crate::controller::store::ResourceStore;
use crate::crd::Tenant;
use k8s_openapi::api::core::v1::Secret;
use tracing::info;

pub fn tls_secret_name(tenant_name: &str) -> String {
    format!("{tenant_name}-tls")
}

/// DNS names the leaf must cover, including enabled add-ons
pub fn tls_sans(tenant: &Tenant) -> Vec<String> {
    let name = tenant.name();
    let ns = tenant.namespace_name();
    let mut sans = vec![
        name.to_string(),
        format!("{name}-server"),
        format!("{name}-grpc"),
        format!("{name}.{ns}.svc"),
        format!("{name}.{ns}.svc.cluster.local"),
        format!("{name}-server.{ns}.svc.cluster.local"),
    ];

    let addons = &tenant.spec.addons;
    for (enabled, suffix) in [
        (addons.redis, "redis"),
        (addons.repo_server, "repo-server"),
        (addons.application_set, "applicationset-controller"),
    ] {
        if enabled {
            sans.push(format!("{name}-{suffix}"));
            sans.push(format!("{name}-{suffix}.{ns}.svc.cluster.local"));
        }
    }
    sans
}

pub struct TlsSecret<'a> {
    tenant: &'a Tenant,
    authority: CertificateAuthority,
    sans: Vec<String>,
}

impl<'a> TlsSecret<'a> {
    /// Requires the CA secret
    pub async fn load<S: ResourceStore>(store: &S, tenant: &'a Tenant) -> Result<Self, SecretError> {
        let name = tls_secret_name(tenant.name());
        let ca = require_secret(
            store,
            tenant.namespace_name(),
            &ca_secret_name(tenant.name()),
            &name,
        )
        .await?;
        Ok(Self {
            tenant,
            authority: load_authority(&ca, &name)?,
            sans: tls_sans(tenant),
        })
    }

    fn issue(&self) -> Result<(String, String), SecretError> {
        Ok(self.authority.issue_leaf(self.tenant.name(), &self.sans)?)
    }
}

impl ManagedSecret for TlsSecret<'_> {
    fn kind(&self) -> &'static str {
        "tls"
    }

    fn name(&self) -> String {
        tls_secret_name(self.tenant.name())
    }

    fn build(&self) -> Result<Secret, SecretError> {
        let (cert, key) = self.issue()?;
        let mut secret = base_secret(self.tenant, self.name(), Some("kubernetes.io/tls"));
        set_secret_value(&mut secret, KEY_TLS_CERT, &cert);
        set_secret_value(&mut secret, KEY_TLS_KEY, &key);
        Ok(secret)
    }

    /// Replace the pair when it no longer verifies against the CA, the key
    /// does not match, or SANs are missing
    fn reconcile_drift(&self, existing: &mut Secret, changed: &mut bool) -> Result<(), SecretError> {
        let cert = secret_value(existing, KEY_TLS_CERT).unwrap_or_default();
        let key = secret_value(existing, KEY_TLS_KEY).unwrap_or_default();
        let check = self.authority.verify_leaf(&cert, &key, &self.sans);
        if check == LeafCheck::Valid {
            return Ok(());
        }

        info!(
            tenant = self.tenant.name(),
            secret = %self.name(),
            reason = ?check,
            "TLS pair no longer valid, issuing a new leaf"
        );
        let (cert, key) = self.issue()?;
        set_secret_value(existing, KEY_TLS_CERT, &cert);
        set_secret_value(existing, KEY_TLS_KEY, &key);
        *changed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::tenant;
    use super::super::{reconcile_or_create, CaSecret, SecretOutcome};
    use super::*;
    use crate::controller::store::memory::MemoryStore;

    #[test]
    fn test_sans_follow_addons() {
        let mut t1 = tenant("t1", "ns1");
        assert_eq!(tls_sans(&t1).len(), 6);
        assert!(tls_sans(&t1).contains(&"t1.ns1.svc.cluster.local".to_string()));

        t1.spec.addons.redis = true;
        let sans = tls_sans(&t1);
        assert!(sans.contains(&"t1-redis".to_string()));
        assert!(sans.contains(&"t1-redis.ns1.svc.cluster.local".to_string()));
        assert_eq!(sans.len(), 8);
    }

    #[tokio::test]
    async fn test_leaf_verifies_against_stored_ca() {
        let store = MemoryStore::new();
        let t1 = tenant("t1", "ns1");
        reconcile_or_create(&store, &t1, &CaSecret::new(&t1)).await.unwrap();
        let tls = TlsSecret::load(&store, &t1).await.unwrap();
        reconcile_or_create(&store, &t1, &tls).await.unwrap();

        let ca: Secret = store.get("ns1", "t1-ca").await.unwrap().unwrap();
        let leaf: Secret = store.get("ns1", "t1-tls").await.unwrap().unwrap();
        let authority = load_authority(&ca, "test").unwrap();
        assert!(authority
            .verify_leaf(
                &secret_value(&leaf, KEY_TLS_CERT).unwrap(),
                &secret_value(&leaf, KEY_TLS_KEY).unwrap(),
                &tls_sans(&t1),
            )
            .is_valid());
    }

    #[tokio::test]
    async fn test_enabling_addon_reissues_leaf() {
        let store = MemoryStore::new();
        let mut t1 = tenant("t1", "ns1");
        reconcile_or_create(&store, &t1, &CaSecret::new(&t1)).await.unwrap();
        let tls = TlsSecret::load(&store, &t1).await.unwrap();
        reconcile_or_create(&store, &t1, &tls).await.unwrap();
        let before: Secret = store.get("ns1", "t1-tls").await.unwrap().unwrap();

        t1.spec.addons.repo_server = true;
        let tls = TlsSecret::load(&store, &t1).await.unwrap();
        assert_eq!(
            reconcile_or_create(&store, &t1, &tls).await.unwrap(),
            SecretOutcome::Updated
        );
        let after: Secret = store.get("ns1", "t1-tls").await.unwrap().unwrap();
        assert_ne!(
            secret_value(&before, KEY_TLS_CERT),
            secret_value(&after, KEY_TLS_CERT)
        );
    }
}
