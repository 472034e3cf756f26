//! # Status
//!
//! Status types shared by the tenant and namespace-management resources.

use serde::{Deserialize, Serialize};

/// Condition types
pub const CONDITION_RECONCILED: &str = "Reconciled";
pub const CONDITION_NAMESPACE_MANAGEMENT: &str = "NamespaceManagement";

/// Condition reasons
pub const REASON_SUCCESS: &str = "Success";
pub const REASON_DEPENDENCY_NOT_READY: &str = "DependencyNotReady";
pub const REASON_VALIDATION_FAILED: &str = "ValidationFailed";
pub const REASON_RECONCILE_FAILED: &str = "ReconcileFailed";
pub const REASON_NAMESPACE_MANAGED: &str = "NamespaceManaged";
pub const REASON_NAMESPACE_NOT_PERMITTED: &str = "NamespaceNotPermitted";
pub const REASON_NAMESPACE_PATTERN_MISMATCH: &str = "NamespacePatternMismatch";
pub const REASON_NAMESPACE_CLAIMED_ELSEWHERE: &str = "NamespaceClaimedElsewhere";
pub const REASON_NAMESPACE_MANAGEMENT_DISABLED: &str = "NamespaceManagementDisabled";

/// Status of the Tenant resource
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TenantStatus {
    /// Conditions represent the latest available observations
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Observed generation
    #[serde(default)]
    pub observed_generation: Option<i64>,
    /// Namespaces whose management labels point at this tenant, sorted
    #[serde(default)]
    pub managed_namespaces: Vec<String>,
    /// Last reconciliation time
    #[serde(default)]
    pub last_reconcile_time: Option<String>,
}

/// Status of a NamespaceManagement resource
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceManagementStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub r#type: String,
    pub status: String,
    #[serde(default)]
    pub last_transition_time: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl Condition {
    /// Build a condition stamped with the current time
    pub fn new(r#type: &str, status: bool, reason: &str, message: impl Into<String>) -> Self {
        Self {
            r#type: r#type.to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            last_transition_time: Some(chrono::Utc::now().to_rfc3339()),
            reason: Some(reason.to_string()),
            message: Some(message.into()),
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == "True"
    }

    /// Same observation, ignoring the transition time
    pub fn same_as(&self, other: &Condition) -> bool {
        self.r#type == other.r#type
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

/// Replace the condition of the same type, keeping the old transition time
/// when nothing but the timestamp would change.
///
/// Returns `true` when the list was modified.
pub fn upsert_condition(conditions: &mut Vec<Condition>, condition: Condition) -> bool {
    match conditions.iter_mut().find(|c| c.r#type == condition.r#type) {
        Some(existing) if existing.same_as(&condition) => false,
        Some(existing) => {
            *existing = condition;
            true
        }
        None => {
            conditions.push(condition);
            true
        }
    }
}
