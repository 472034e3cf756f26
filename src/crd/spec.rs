//! # Tenant Spec
//!
//! The `Tenant` custom resource: one application-delivery instance rooted in
//! its own namespace and optionally extended to manage others.

use super::status::TenantStatus;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Tenant Custom Resource Definition
///
/// # Example
///
/// ```yaml
/// apiVersion: tenancy.octopilot.io/v1alpha1
/// kind: Tenant
/// metadata:
///   name: team-a
///   namespace: team-a
/// spec:
///   namespaceManagement:
///     - name: "team-a-*"
///       allowManagedBy: true
///   addons:
///     redis: true
/// ```
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "Tenant",
    group = "tenancy.octopilot.io",
    version = "v1alpha1",
    namespaced,
    status = "TenantStatus",
    shortname = "tnt",
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Reconciled\")].status"}, {"name":"Reason", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Reconciled\")].reason"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TenantSpec {
    /// Ordered namespace management rules; the first matching pattern wins
    #[serde(default)]
    pub namespace_management: Vec<NamespaceManagementRule>,
    /// Single sign-on configuration
    #[serde(default)]
    pub sso: Option<SsoSpec>,
    /// Optional components; enabled ones extend the TLS certificate names
    #[serde(default)]
    pub addons: AddonsSpec,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceManagementRule {
    /// Namespace name pattern, `*` and `?` wildcards
    pub name: String,
    /// Whether matching namespaces may be managed by this tenant
    #[serde(default)]
    pub allow_managed_by: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SsoSpec {
    pub provider: SsoProvider,
    #[serde(default)]
    pub dex: Option<DexSpec>,
    #[serde(default)]
    pub keycloak: Option<KeycloakSpec>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SsoProvider {
    Dex,
    Keycloak,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DexSpec {
    #[serde(default)]
    pub config: Option<String>,
    #[serde(default)]
    pub open_shift_oauth: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KeycloakSpec {
    #[serde(default)]
    pub root_ca: Option<String>,
    #[serde(default)]
    pub verify_tls: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AddonsSpec {
    #[serde(default)]
    pub redis: bool,
    #[serde(default)]
    pub repo_server: bool,
    #[serde(default)]
    pub application_set: bool,
}

impl SsoSpec {
    /// Reject provider settings that contradict the selected provider
    pub fn validate(&self) -> Result<(), String> {
        match self.provider {
            SsoProvider::Dex if self.keycloak.is_some() => Err(
                "sso.keycloak must not be set when sso.provider is dex".to_string(),
            ),
            SsoProvider::Keycloak if self.dex.is_some() => Err(
                "sso.dex must not be set when sso.provider is keycloak".to_string(),
            ),
            _ => Ok(()),
        }
    }
}

impl Tenant {
    /// Tenant name, empty when the object has not been persisted yet
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    /// Namespace the tenant lives in (the value management labels refer to)
    pub fn namespace_name(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or_default()
    }

    pub fn has_sso(&self) -> bool {
        self.spec.sso.is_some()
    }

    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|x| x == finalizer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sso_validation_rejects_conflicting_provider() {
        let sso = SsoSpec {
            provider: SsoProvider::Dex,
            dex: None,
            keycloak: Some(KeycloakSpec::default()),
        };
        assert!(sso.validate().is_err());

        let sso = SsoSpec {
            provider: SsoProvider::Keycloak,
            dex: Some(DexSpec::default()),
            keycloak: None,
        };
        assert!(sso.validate().is_err());
    }

    #[test]
    fn test_sso_validation_accepts_matching_provider() {
        let sso = SsoSpec {
            provider: SsoProvider::Dex,
            dex: Some(DexSpec::default()),
            keycloak: None,
        };
        assert_eq!(sso.validate(), Ok(()));
    }

    #[test]
    fn test_spec_deserializes_camel_case() {
        let spec: TenantSpec = serde_json::from_value(serde_json::json!({
            "namespaceManagement": [{"name": "dev-*", "allowManagedBy": true}],
            "addons": {"repoServer": true}
        }))
        .unwrap();
        assert_eq!(spec.namespace_management.len(), 1);
        assert!(spec.namespace_management[0].allow_managed_by);
        assert!(spec.addons.repo_server);
        assert!(spec.sso.is_none());
    }
}
