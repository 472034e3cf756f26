//! Policy rules granted per RBAC type and component.

use super::RbacType;
use crate::constants::{
    COMPONENT_APPLICATIONSET_CONTROLLER, COMPONENT_APPLICATION_CONTROLLER, COMPONENT_SERVER,
};
use k8s_openapi::api::rbac::v1::PolicyRule;

const APP_GROUP: &str = "argoproj.io";

fn rule(groups: &[&str], resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(groups.iter().map(|s| (*s).to_string()).collect()),
        resources: Some(resources.iter().map(|s| (*s).to_string()).collect()),
        verbs: verbs.iter().map(|s| (*s).to_string()).collect(),
        ..PolicyRule::default()
    }
}

fn events_rule() -> PolicyRule {
    rule(&[""], &["events"], &["create", "list"])
}

/// Rules for `component` under `rbac_type`. Empty when the component has no
/// role under that type.
pub fn policy_rules(rbac_type: RbacType, component: &str) -> Vec<PolicyRule> {
    match (rbac_type, component) {
        (RbacType::ResourceManagement, COMPONENT_APPLICATION_CONTROLLER) => {
            vec![rule(&["*"], &["*"], &["*"])]
        }
        (RbacType::ResourceManagement, COMPONENT_SERVER) => vec![
            rule(&["*"], &["*"], &["get", "list", "watch", "patch", "delete"]),
            events_rule(),
        ],
        (RbacType::AppManagement, COMPONENT_SERVER) => vec![
            rule(
                &[APP_GROUP],
                &["applications"],
                &["create", "get", "list", "watch", "update", "patch", "delete"],
            ),
            events_rule(),
        ],
        (RbacType::AppsetManagement, COMPONENT_APPLICATIONSET_CONTROLLER) => vec![
            rule(
                &[APP_GROUP],
                &["applications", "applicationsets", "applicationsets/finalizers"],
                &["create", "get", "list", "watch", "update", "patch", "delete"],
            ),
            rule(&[APP_GROUP], &["applicationsets/status"], &["get", "patch", "update"]),
            rule(&[""], &["secrets", "configmaps"], &["get", "list", "watch"]),
            events_rule(),
        ],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_declared_component_has_rules() {
        for rbac_type in RbacType::ALL {
            for component in rbac_type.components() {
                assert!(
                    !policy_rules(rbac_type, component).is_empty(),
                    "{rbac_type}/{component} should have rules"
                );
            }
        }
    }

    #[test]
    fn test_undeclared_component_has_no_rules() {
        assert!(policy_rules(RbacType::AppManagement, COMPONENT_APPLICATION_CONTROLLER).is_empty());
    }
}
