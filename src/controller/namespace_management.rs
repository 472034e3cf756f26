//! # Namespace Management
//!
//! Self-service delegation: a `NamespaceManagement` object created inside a
//! namespace asks the tenant living in `spec.managedBy` to manage it. The
//! tenant's ordered `namespaceManagement` rules decide. The first rule whose
//! glob pattern matches the namespace name wins:
//!
//! - no rule matches: `NamespacePatternMismatch`, nothing changes
//! - `allowManagedBy: false`: `NamespaceNotPermitted`; a label this module
//!   set earlier is taken back
//! - `allowManagedBy: true`: the resource-management label and the marker
//!   annotation are ensured on the namespace, unless its `managed-by` label
//!   already names another tenant (`NamespaceClaimedElsewhere`)
//!
//! Namespace writes re-read the namespace and retry on conflict.
//!
//! Namespaces labelled through this module whose request object is gone are
//! released again. Labels set by hand (no marker annotation) are never touched.
//!
//! Label changes made here reach the RBAC and cluster-permissions paths the
//! same way any other label edit does: through the namespace watch.

use crate::constants::{ANNOTATION_MANAGED_VIA_NAMESPACE_MANAGEMENT, LABEL_MANAGED_BY};
use crate::controller::retry::{retry_on_conflict, RetryConfig};
use crate::controller::selector::{Requirement, Selector};
use crate::controller::store::{ResourceStore, StoreError};
use crate::crd::{
    upsert_condition, Condition, NamespaceManagement, NamespaceManagementRule,
    NamespaceManagementStatus, Tenant, CONDITION_NAMESPACE_MANAGEMENT,
    REASON_NAMESPACE_CLAIMED_ELSEWHERE, REASON_NAMESPACE_MANAGED, REASON_NAMESPACE_NOT_PERMITTED,
    REASON_NAMESPACE_PATTERN_MISMATCH,
};
use k8s_openapi::api::core::v1::Namespace;
use regex::Regex;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Anchored regex for a namespace glob (`*` any run, `?` one character)
pub fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr)
}

/// Outcome of matching one namespace against a tenant's rules
///
/// `ClaimedElsewhere` never comes out of [`evaluate_rules`]; a permitted
/// claim turns into it when the namespace already belongs to another tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleDecision {
    Managed,
    NotPermitted,
    PatternMismatch,
    ClaimedElsewhere,
}

impl RuleDecision {
    pub fn reason(&self) -> &'static str {
        match self {
            RuleDecision::Managed => REASON_NAMESPACE_MANAGED,
            RuleDecision::NotPermitted => REASON_NAMESPACE_NOT_PERMITTED,
            RuleDecision::PatternMismatch => REASON_NAMESPACE_PATTERN_MISMATCH,
            RuleDecision::ClaimedElsewhere => REASON_NAMESPACE_CLAIMED_ELSEWHERE,
        }
    }

    pub fn message(&self, namespace: &str, tenant: &str) -> String {
        match self {
            RuleDecision::Managed => {
                format!("namespace {namespace} is managed by tenant {tenant}")
            }
            RuleDecision::NotPermitted => {
                format!("namespace {namespace} is not permitted for management by tenant {tenant}")
            }
            RuleDecision::PatternMismatch => format!(
                "namespace {namespace} does not match any namespace management pattern of tenant {tenant}"
            ),
            RuleDecision::ClaimedElsewhere => format!(
                "namespace {namespace} is already managed by another tenant, not by tenant {tenant}"
            ),
        }
    }
}

/// First matching rule decides. Rules with an unusable pattern are skipped.
pub fn evaluate_rules(rules: &[NamespaceManagementRule], namespace: &str) -> RuleDecision {
    for rule in rules {
        let regex = match glob_to_regex(&rule.name) {
            Ok(regex) => regex,
            Err(e) => {
                warn!(pattern = %rule.name, error = %e, "Skipping invalid namespace management pattern");
                continue;
            }
        };
        if regex.is_match(namespace) {
            return if rule.allow_managed_by {
                RuleDecision::Managed
            } else {
                RuleDecision::NotPermitted
            };
        }
    }
    RuleDecision::PatternMismatch
}

/// What one namespace-management pass did, for the tenant condition
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceManagementReport {
    pub managed: BTreeSet<String>,
    pub not_permitted: BTreeSet<String>,
    pub mismatched: BTreeSet<String>,
    pub claimed_elsewhere: BTreeSet<String>,
    pub released: BTreeSet<String>,
}

impl NamespaceManagementReport {
    fn record(&mut self, namespace: &str, decision: RuleDecision) {
        let set = match decision {
            RuleDecision::Managed => &mut self.managed,
            RuleDecision::NotPermitted => &mut self.not_permitted,
            RuleDecision::PatternMismatch => &mut self.mismatched,
            RuleDecision::ClaimedElsewhere => &mut self.claimed_elsewhere,
        };
        set.insert(namespace.to_string());
    }

    /// Summary condition for the tenant
    pub fn condition(&self) -> Condition {
        let message = format!(
            "{} namespace(s) managed, {} not permitted, {} claimed by another tenant, {} not matching any pattern",
            self.managed.len(),
            self.not_permitted.len(),
            self.claimed_elsewhere.len(),
            self.mismatched.len()
        );
        let failing = if !self.not_permitted.is_empty() {
            Some(REASON_NAMESPACE_NOT_PERMITTED)
        } else if !self.claimed_elsewhere.is_empty() {
            Some(REASON_NAMESPACE_CLAIMED_ELSEWHERE)
        } else if !self.mismatched.is_empty() {
            Some(REASON_NAMESPACE_PATTERN_MISMATCH)
        } else {
            None
        };
        match failing {
            Some(reason) => Condition::new(CONDITION_NAMESPACE_MANAGEMENT, false, reason, message),
            None => Condition::new(
                CONDITION_NAMESPACE_MANAGEMENT,
                true,
                REASON_NAMESPACE_MANAGED,
                message,
            ),
        }
    }
}

fn label_of<'a>(ns: &'a Namespace, key: &str) -> Option<&'a str> {
    ns.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(key))
        .map(String::as_str)
}

fn has_marker(ns: &Namespace) -> bool {
    ns.metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(ANNOTATION_MANAGED_VIA_NAMESPACE_MANAGEMENT))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Claim {
    Changed,
    Unchanged,
    /// `managed-by` names another tenant namespace
    Taken(String),
}

/// Label and mark `ns` as managed by `tenant_namespace`. A namespace whose
/// `managed-by` label names someone else is left alone.
fn claim(ns: &mut Namespace, tenant_namespace: &str) -> Claim {
    if let Some(owner) = label_of(ns, LABEL_MANAGED_BY) {
        if owner != tenant_namespace {
            return Claim::Taken(owner.to_string());
        }
    }
    let mut changed = false;
    let labels = ns.metadata.labels.get_or_insert_with(Default::default);
    if !labels.contains_key(LABEL_MANAGED_BY) {
        labels.insert(LABEL_MANAGED_BY.to_string(), tenant_namespace.to_string());
        changed = true;
    }
    let annotations = ns.metadata.annotations.get_or_insert_with(Default::default);
    if !annotations.contains_key(ANNOTATION_MANAGED_VIA_NAMESPACE_MANAGEMENT) {
        annotations.insert(
            ANNOTATION_MANAGED_VIA_NAMESPACE_MANAGEMENT.to_string(),
            "true".to_string(),
        );
        changed = true;
    }
    if changed {
        Claim::Changed
    } else {
        Claim::Unchanged
    }
}

/// Take back a label this module set for `tenant_namespace`; true if it changed
fn release(ns: &mut Namespace, tenant_namespace: &str) -> bool {
    if label_of(ns, LABEL_MANAGED_BY) != Some(tenant_namespace) || !has_marker(ns) {
        return false;
    }
    if let Some(labels) = ns.metadata.labels.as_mut() {
        labels.remove(LABEL_MANAGED_BY);
    }
    if let Some(annotations) = ns.metadata.annotations.as_mut() {
        annotations.remove(ANNOTATION_MANAGED_VIA_NAMESPACE_MANAGEMENT);
    }
    true
}

/// Claim `namespace` for `tenant_namespace`; `None` if the namespace is gone
async fn claim_namespace<S: ResourceStore>(
    store: &S,
    namespace: &str,
    tenant_namespace: &str,
    retry: &RetryConfig,
) -> Result<Option<Claim>, StoreError> {
    let operation = format!("claim namespace {namespace}");
    retry_on_conflict(retry, &operation, || async move {
        let Some(mut ns) = store.get_namespace(namespace).await? else {
            return Ok(None);
        };
        let outcome = claim(&mut ns, tenant_namespace);
        if outcome == Claim::Changed {
            store.update_namespace(&ns).await?;
        }
        Ok(Some(outcome))
    })
    .await
}

async fn release_namespace<S: ResourceStore>(
    store: &S,
    namespace: &str,
    tenant_namespace: &str,
    retry: &RetryConfig,
) -> Result<bool, StoreError> {
    let operation = format!("release managed namespace {namespace}");
    retry_on_conflict(retry, &operation, || async move {
        let Some(mut ns) = store.get_namespace(namespace).await? else {
            return Ok(false);
        };
        if !release(&mut ns, tenant_namespace) {
            return Ok(false);
        }
        match store.update_namespace(&ns).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    })
    .await
}

async fn set_request_condition<S: ResourceStore>(
    store: &S,
    request: &NamespaceManagement,
    condition: Condition,
) -> Result<(), StoreError> {
    let mut status = request.status.clone().unwrap_or_default();
    if !upsert_condition(&mut status.conditions, condition) {
        return Ok(());
    }
    let (Some(namespace), Some(name)) = (
        request.metadata.namespace.as_deref(),
        request.metadata.name.as_deref(),
    ) else {
        return Ok(());
    };
    let value = serde_json::to_value(NamespaceManagementStatus {
        conditions: status.conditions,
    })?;
    store
        .update_status::<NamespaceManagement>(namespace, name, value)
        .await
}

/// Apply the tenant's namespace management rules to every request that
/// names it, then release namespaces whose request is gone.
pub async fn reconcile_namespace_management<S: ResourceStore>(
    store: &S,
    tenant: &Tenant,
    retry: &RetryConfig,
) -> Result<NamespaceManagementReport, StoreError> {
    let tenant_ns = tenant.namespace_name();
    let mut report = NamespaceManagementReport::default();

    let requests: Vec<NamespaceManagement> = store
        .list_all::<NamespaceManagement>(&Selector::new())
        .await?
        .into_iter()
        .filter(|r| r.spec.managed_by == tenant_ns)
        .collect();
    let requested: BTreeSet<String> = requests
        .iter()
        .filter_map(|r| r.metadata.namespace.clone())
        .collect();

    for request in &requests {
        let Some(namespace) = request.metadata.namespace.as_deref() else {
            continue;
        };
        let mut decision = evaluate_rules(&tenant.spec.namespace_management, namespace);

        match decision {
            RuleDecision::ClaimedElsewhere => {}
            RuleDecision::PatternMismatch => {
                debug!(namespace = namespace, tenant = tenant.name(), "Namespace matches no management pattern");
            }
            RuleDecision::NotPermitted => {
                if release_namespace(store, namespace, tenant_ns, retry).await? {
                    info!(namespace = namespace, tenant = tenant.name(), "Removed management label from namespace that is not permitted");
                }
            }
            RuleDecision::Managed => match claim_namespace(store, namespace, tenant_ns, retry).await? {
                Some(Claim::Changed) => {
                    info!(namespace = namespace, tenant = tenant.name(), "Labelled namespace for management");
                }
                Some(Claim::Unchanged) => {}
                Some(Claim::Taken(owner)) => {
                    warn!(namespace = namespace, tenant = tenant.name(), owner = %owner, "Namespace is already managed by another tenant");
                    decision = RuleDecision::ClaimedElsewhere;
                }
                None => {
                    warn!(namespace = namespace, "Namespace of management request not found");
                }
            },
        }
        report.record(namespace, decision);

        let condition = Condition::new(
            CONDITION_NAMESPACE_MANAGEMENT,
            decision == RuleDecision::Managed,
            decision.reason(),
            decision.message(namespace, tenant.name()),
        );
        if let Err(e) = set_request_condition(store, request, condition).await {
            if !e.is_not_found() {
                return Err(e);
            }
        }
    }

    let labelled = store
        .list_namespaces(&Selector::new().and(Requirement::equals(LABEL_MANAGED_BY, tenant_ns)))
        .await?;
    for ns in labelled {
        let Some(name) = ns.metadata.name else {
            continue;
        };
        if requested.contains(&name) {
            continue;
        }
        if release_namespace(store, &name, tenant_ns, retry).await? {
            info!(namespace = %name, tenant = tenant.name(), "Released namespace whose management request is gone");
            report.released.insert(name);
        }
    }

    Ok(report)
}
