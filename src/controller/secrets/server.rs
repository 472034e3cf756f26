//! Server secret: what the tenant's API server reads at startup.
//!
//! Holds the Argon2id hash of the admin password, the time the password last
//! changed, a session signing key and a copy of the TLS pair. Derived from
//! the admin credentials and TLS secrets, so both must exist first.

use super::admin::admin_secret_name;
use super::tls::tls_secret_name;
use super::{
    base_secret, require_secret, require_value, secret_value, set_secret_value, ManagedSecret,
    SecretError,
};
use crate::constants::{
    KEY_ADMIN_PASSWORD, KEY_ADMIN_PASSWORD_MTIME, KEY_SERVER_SECRET_KEY, KEY_TLS_CERT, KEY_TLS_KEY,
};
use crate::controller::pki::{generate_secret_key, hash_password, verify_password_hash};
use crate::controller::store::ResourceStore;
use crate::crd::Tenant;
use k8s_openapi::api::core::v1::Secret;
use zeroize::Zeroizing;

pub fn server_secret_name(tenant_name: &str) -> String {
    format!("{tenant_name}-secret")
}

pub struct ServerSecret<'a> {
    tenant: &'a Tenant,
    password: Zeroizing<String>,
    tls_cert: String,
    tls_key: Zeroizing<String>,
}

impl<'a> ServerSecret<'a> {
    /// Requires the admin credentials and TLS secrets
    pub async fn load<S: ResourceStore>(store: &S, tenant: &'a Tenant) -> Result<Self, SecretError> {
        let name = server_secret_name(tenant.name());
        let ns = tenant.namespace_name();

        let admin = require_secret(store, ns, &admin_secret_name(tenant.name()), &name).await?;
        let tls = require_secret(store, ns, &tls_secret_name(tenant.name()), &name).await?;

        Ok(Self {
            tenant,
            password: Zeroizing::new(require_value(&admin, KEY_ADMIN_PASSWORD, &name)?),
            tls_cert: require_value(&tls, KEY_TLS_CERT, &name)?,
            tls_key: Zeroizing::new(require_value(&tls, KEY_TLS_KEY, &name)?),
        })
    }

    fn now() -> String {
        chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    }
}

impl ManagedSecret for ServerSecret<'_> {
    fn kind(&self) -> &'static str {
        "server"
    }

    fn name(&self) -> String {
        server_secret_name(self.tenant.name())
    }

    fn build(&self) -> Result<Secret, SecretError> {
        let mut secret = base_secret(self.tenant, self.name(), Some("Opaque"));
        set_secret_value(
            &mut secret,
            KEY_ADMIN_PASSWORD,
            &hash_password(&self.password)?,
        );
        set_secret_value(&mut secret, KEY_ADMIN_PASSWORD_MTIME, &Self::now());
        set_secret_value(&mut secret, KEY_SERVER_SECRET_KEY, &generate_secret_key());
        set_secret_value(&mut secret, KEY_TLS_CERT, &self.tls_cert);
        set_secret_value(&mut secret, KEY_TLS_KEY, &self.tls_key);
        Ok(secret)
    }

    fn reconcile_drift(&self, existing: &mut Secret, changed: &mut bool) -> Result<(), SecretError> {
        let hash_ok = secret_value(existing, KEY_ADMIN_PASSWORD)
            .is_some_and(|hash| verify_password_hash(&self.password, &hash));
        if !hash_ok {
            set_secret_value(
                existing,
                KEY_ADMIN_PASSWORD,
                &hash_password(&self.password)?,
            );
            set_secret_value(existing, KEY_ADMIN_PASSWORD_MTIME, &Self::now());
            *changed = true;
        }

        if secret_value(existing, KEY_SERVER_SECRET_KEY).is_none() {
            *changed |= set_secret_value(existing, KEY_SERVER_SECRET_KEY, &generate_secret_key());
        }

        *changed |= set_secret_value(existing, KEY_TLS_CERT, &self.tls_cert);
        *changed |= set_secret_value(existing, KEY_TLS_KEY, &self.tls_key);
        Ok(())
    }
}
