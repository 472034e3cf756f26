//! # Feature Flags
//!
//! Boolean toggles read from the environment once per reconcile pass, so a
//! ConfigMap change takes effect on the next reconcile without a restart.

use super::controller::env_var_or_default_bool;

/// Flag name for namespace management through `NamespaceManagement` objects
pub const FLAG_NAMESPACE_MANAGEMENT: &str = "namespace_management";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeatureFlags {
    /// `NAMESPACE_MANAGEMENT_ENABLED`
    pub namespace_management: bool,
}

impl FeatureFlags {
    pub fn from_env() -> Self {
        Self {
            namespace_management: env_var_or_default_bool("NAMESPACE_MANAGEMENT_ENABLED", false),
        }
    }

    /// Look a flag up by name. Unknown names are off.
    pub fn flag(&self, name: &str) -> bool {
        match name {
            FLAG_NAMESPACE_MANAGEMENT => self.namespace_management,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_lookup_by_name() {
        let flags = FeatureFlags {
            namespace_management: true,
        };
        assert!(flags.flag(FLAG_NAMESPACE_MANAGEMENT));
        assert!(!flags.flag("does_not_exist"));
    }

    #[test]
    fn test_flags_default_off() {
        assert!(!FeatureFlags::default().flag(FLAG_NAMESPACE_MANAGEMENT));
    }
}
