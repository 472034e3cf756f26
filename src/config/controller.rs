//! # Controller Configuration
//!
//! Controller-level settings loaded from environment variables.

use std::collections::BTreeSet;
use std::time::Duration;

/// Controller-level configuration
///
/// All settings have sensible defaults and can be overridden via environment variables.
/// Environment variables are populated from a ConfigMap using `envFrom` in the deployment.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Exponential backoff starting value (milliseconds)
    /// Initial delay before restarting a watch after API pressure (429)
    pub backoff_start_ms: u64,
    /// Exponential backoff maximum value (milliseconds)
    pub backoff_max_ms: u64,
    /// Watch stream restart delay after unknown errors (seconds)
    pub watch_restart_delay_secs: u64,
    /// Watch stream restart delay after stream ends (seconds)
    pub watch_restart_delay_after_end_secs: u64,
    /// Requeue interval while waiting for a dependency secret (seconds)
    pub dependency_requeue_secs: u64,
    /// Requeue interval after a successful reconciliation (seconds)
    pub resync_secs: u64,
    /// Interval between retries of namespaces whose mapping failed (seconds)
    pub mapper_retry_interval_secs: u64,
    /// Controller namespace
    pub controller_namespace: String,
    /// Log format (json, text)
    pub log_format: String,
    /// Maximum concurrent reconciliations
    /// Limits how many tenants can be reconciled simultaneously
    pub max_concurrent_reconciliations: u16,
    /// Tenant namespaces whose tenants are cluster scoped
    pub cluster_scoped_namespaces: BTreeSet<String>,
    /// Attempts for a write that loses an optimistic-concurrency race
    pub conflict_retry_attempts: u32,
    pub conflict_retry_initial_ms: u64,
    pub conflict_retry_max_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        use crate::constants::*;
        Self {
            backoff_start_ms: DEFAULT_BACKOFF_START_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            watch_restart_delay_secs: DEFAULT_WATCH_RESTART_DELAY_SECS,
            watch_restart_delay_after_end_secs: DEFAULT_WATCH_RESTART_DELAY_AFTER_END_SECS,
            dependency_requeue_secs: DEFAULT_DEPENDENCY_REQUEUE_SECS,
            resync_secs: DEFAULT_RESYNC_SECS,
            mapper_retry_interval_secs: DEFAULT_MAPPER_RETRY_INTERVAL_SECS,
            controller_namespace: "octopilot-system".to_string(),
            log_format: "json".to_string(),
            max_concurrent_reconciliations: DEFAULT_MAX_CONCURRENT_RECONCILIATIONS,
            cluster_scoped_namespaces: BTreeSet::new(),
            conflict_retry_attempts: DEFAULT_CONFLICT_RETRY_ATTEMPTS,
            conflict_retry_initial_ms: DEFAULT_CONFLICT_RETRY_INITIAL_MS,
            conflict_retry_max_ms: DEFAULT_CONFLICT_RETRY_MAX_MS,
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        use crate::constants::*;
        Self {
            backoff_start_ms: env_var_or_default("BACKOFF_START_MS", DEFAULT_BACKOFF_START_MS),
            backoff_max_ms: env_var_or_default("BACKOFF_MAX_MS", DEFAULT_BACKOFF_MAX_MS),
            watch_restart_delay_secs: env_var_or_default(
                "WATCH_RESTART_DELAY_SECS",
                DEFAULT_WATCH_RESTART_DELAY_SECS,
            ),
            watch_restart_delay_after_end_secs: env_var_or_default(
                "WATCH_RESTART_DELAY_AFTER_END_SECS",
                DEFAULT_WATCH_RESTART_DELAY_AFTER_END_SECS,
            ),
            dependency_requeue_secs: env_var_or_default(
                "DEPENDENCY_REQUEUE_SECS",
                DEFAULT_DEPENDENCY_REQUEUE_SECS,
            ),
            resync_secs: env_var_or_default("RESYNC_SECS", DEFAULT_RESYNC_SECS),
            mapper_retry_interval_secs: env_var_or_default(
                "MAPPER_RETRY_INTERVAL_SECS",
                DEFAULT_MAPPER_RETRY_INTERVAL_SECS,
            ),
            controller_namespace: env_var_or_default_str("POD_NAMESPACE", "octopilot-system"),
            log_format: env_var_or_default_str("LOG_FORMAT", "json"),
            max_concurrent_reconciliations: env_var_or_default(
                "MAX_CONCURRENT_RECONCILIATIONS",
                DEFAULT_MAX_CONCURRENT_RECONCILIATIONS,
            ),
            cluster_scoped_namespaces: parse_namespace_list(&env_var_or_default_str(
                "CLUSTER_SCOPED_NAMESPACES",
                "",
            )),
            conflict_retry_attempts: env_var_or_default(
                "CONFLICT_RETRY_ATTEMPTS",
                DEFAULT_CONFLICT_RETRY_ATTEMPTS,
            ),
            conflict_retry_initial_ms: env_var_or_default(
                "CONFLICT_RETRY_INITIAL_MS",
                DEFAULT_CONFLICT_RETRY_INITIAL_MS,
            ),
            conflict_retry_max_ms: env_var_or_default(
                "CONFLICT_RETRY_MAX_MS",
                DEFAULT_CONFLICT_RETRY_MAX_MS,
            ),
        }
    }

    /// Whether tenants living in `namespace` may manage every namespace
    pub fn is_cluster_scoped(&self, namespace: &str) -> bool {
        self.cluster_scoped_namespaces.contains(namespace)
    }

    /// Get watch restart delay duration
    pub fn watch_restart_delay_duration(&self) -> Duration {
        Duration::from_secs(self.watch_restart_delay_secs)
    }

    /// Get watch restart delay after end duration
    pub fn watch_restart_delay_after_end_duration(&self) -> Duration {
        Duration::from_secs(self.watch_restart_delay_after_end_secs)
    }

    pub fn dependency_requeue_duration(&self) -> Duration {
        Duration::from_secs(self.dependency_requeue_secs)
    }

    pub fn resync_duration(&self) -> Duration {
        Duration::from_secs(self.resync_secs)
    }

    pub fn mapper_retry_interval(&self) -> Duration {
        Duration::from_secs(self.mapper_retry_interval_secs)
    }

    /// Retry policy for writes racing other writers
    pub fn conflict_retry(&self) -> crate::controller::retry::RetryConfig {
        crate::controller::retry::RetryConfig {
            max_attempts: self.conflict_retry_attempts,
            initial_delay: Duration::from_millis(self.conflict_retry_initial_ms),
            max_delay: Duration::from_millis(self.conflict_retry_max_ms),
            backoff_multiplier: 2.0,
        }
    }
}

/// Split a comma separated namespace list, dropping blanks
pub(crate) fn parse_namespace_list(raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|ns| !ns.is_empty())
        .map(str::to_string)
        .collect()
}

/// Read environment variable or return default value
pub(crate) fn env_var_or_default<T: std::str::FromStr>(key: &str, default: T) -> T
where
    <T as std::str::FromStr>::Err: std::fmt::Debug,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Read environment variable as boolean or return default
pub(crate) fn env_var_or_default_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| {
            let v_lower = v.to_lowercase();
            v_lower == "true" || v_lower == "1" || v_lower == "yes" || v_lower == "on"
        })
        .unwrap_or(default)
}

/// Read environment variable as string or return default
pub(crate) fn env_var_or_default_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_namespace_list_trims_and_dedupes() {
        let parsed = parse_namespace_list(" ops , platform,,ops ");
        assert_eq!(
            parsed.into_iter().collect::<Vec<_>>(),
            vec!["ops".to_string(), "platform".to_string()]
        );
    }

    #[test]
    fn test_parse_namespace_list_empty() {
        assert!(parse_namespace_list("").is_empty());
    }

    #[test]
    fn test_cluster_scoped_lookup() {
        let config = ControllerConfig {
            cluster_scoped_namespaces: parse_namespace_list("ops"),
            ..ControllerConfig::default()
        };
        assert!(config.is_cluster_scoped("ops"));
        assert!(!config.is_cluster_scoped("team-a"));
    }
}
