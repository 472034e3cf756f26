//! # Error Policy
//!
//! Error handling and backoff logic for the controller watch loop.
//! This module handles reconciliation errors and watch stream errors.

use crate::controller::reconciler::{tenant_key, BackoffState, Reconciler, ReconcilerError};
use crate::crd::Tenant;
use crate::observability;
use kube_runtime::controller::Action;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// How the watch loop should treat a watch stream error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchErrorKind {
    Unauthorized,
    Expired,
    TooManyRequests,
    NotFound,
    Other,
}

impl WatchErrorKind {
    /// Classify by the rendered error. 404 is checked before 401: a plain
    /// text 404 body surfaces as a decode error mentioning `WatchFailed`.
    pub fn classify(error_string: &str) -> Self {
        let is_not_found = error_string.contains("ObjectNotFound")
            || error_string.contains("404")
            || error_string.contains("not found");
        let is_401 = (error_string.contains("401") || error_string.contains("Unauthorized"))
            && !is_not_found;
        let is_410 = error_string.contains("410")
            || error_string.contains("too old resource version")
            || error_string.contains("Expired")
            || error_string.contains("Gone");
        let is_429 = error_string.contains("429")
            || error_string.contains("storage is (re)initializing")
            || error_string.contains("TooManyRequests");

        if is_401 {
            WatchErrorKind::Unauthorized
        } else if is_410 {
            WatchErrorKind::Expired
        } else if is_429 {
            WatchErrorKind::TooManyRequests
        } else if is_not_found {
            WatchErrorKind::NotFound
        } else {
            WatchErrorKind::Other
        }
    }
}

/// Handle reconciliation errors with Fibonacci backoff
///
/// Backoff state is tracked per tenant so one failing tenant does not slow
/// down the others.
pub fn handle_reconciliation_error<S>(
    obj: Arc<Tenant>,
    error: &ReconcilerError,
    ctx: Arc<Reconciler<S>>,
) -> Action {
    let error_span = tracing::span!(
        tracing::Level::ERROR,
        "controller.watch.reconciliation_error",
        tenant.name = obj.name(),
        tenant.namespace = obj.namespace_name(),
        error = %error
    );
    let _error_guard = error_span.enter();

    error!(error = %error, "Reconciliation failed");
    observability::metrics::increment_reconciliation_errors();

    let (delay, error_count) = match ctx.backoff_states.lock() {
        Ok(mut states) => {
            let state = states
                .entry(tenant_key(&obj))
                .or_insert_with(BackoffState::new);
            state.increment_error();
            (state.backoff.next_delay(), state.error_count)
        }
        Err(e) => {
            warn!("Failed to lock backoff_states: {}, using default backoff", e);
            (Duration::from_secs(60), 0)
        }
    };

    let next_trigger_time = chrono::Utc::now()
        + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(60));
    info!(
        delay_secs = delay.as_secs(),
        error_count = error_count,
        next_retry = %next_trigger_time.to_rfc3339(),
        "Retrying with Fibonacci backoff"
    );

    observability::metrics::increment_requeues_total("error-backoff");
    Action::requeue(delay)
}

/// Handle watch stream errors with appropriate classification and backoff
///
/// Returns `None` to filter out the error (allow restart) or `Some(())` to continue.
pub async fn handle_watch_stream_error(
    error_string: &str,
    backoff: &Arc<AtomicU64>,
    max_backoff_ms: u64,
    watch_restart_delay_secs: u64,
) -> Option<()> {
    let error_span = tracing::span!(
        tracing::Level::WARN,
        "controller.watch.error",
        error = %error_string
    );
    let _error_guard = error_span.enter();

    match WatchErrorKind::classify(error_string) {
        WatchErrorKind::Unauthorized => {
            error!("Watch authentication failed (401 Unauthorized), RBAC may have been revoked or the token expired");
            error!("Verify the controller ClusterRole and ClusterRoleBinding still exist and bind its ServiceAccount:");
            error!("  kubectl auth can-i list tenants.tenancy.octopilot.io --as=system:serviceaccount:<namespace>:tenant-controller --all-namespaces");
            warn!(
                "Waiting {}s before retrying watch (RBAC may need time to propagate)...",
                watch_restart_delay_secs
            );
            tokio::time::sleep(Duration::from_secs(watch_restart_delay_secs)).await;
            None
        }
        WatchErrorKind::Expired => {
            warn!(error_type = "410", "Watch resource version expired, watch will restart");
            None
        }
        WatchErrorKind::TooManyRequests => {
            let current_backoff = backoff.load(Ordering::Relaxed);
            warn!(
                "API server storage reinitializing (429), backing off for {}ms before restart...",
                current_backoff
            );
            tokio::time::sleep(Duration::from_millis(current_backoff)).await;
            let new_backoff = std::cmp::min(current_backoff.saturating_mul(2), max_backoff_ms);
            backoff.store(new_backoff, Ordering::Relaxed);
            None
        }
        WatchErrorKind::NotFound => {
            let resource_info = if error_string.contains("integer `404`") {
                "CRD or resource may have been deleted (404 returned as plain text)"
            } else if error_string.contains("NamespaceManagement") {
                "NamespaceManagement resource"
            } else if error_string.contains("Tenant") {
                "Tenant resource"
            } else {
                "Resource"
            };
            warn!(
                "{} not found (404), normal if the resource was deleted or the CRD is missing. Error: {}",
                resource_info, error_string
            );
            Some(())
        }
        WatchErrorKind::Other => {
            error!("Controller stream error: {}", error_string);
            tokio::time::sleep(Duration::from_secs(watch_restart_delay_secs)).await;
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControllerConfig;
    use crate::controller::store::memory::MemoryStore;
    use crate::crd::TenantSpec;

    fn tenant() -> Arc<Tenant> {
        let mut tenant = Tenant::new("t1", TenantSpec::default());
        tenant.metadata.namespace = Some("ns1".to_string());
        Arc::new(tenant)
    }

    #[test]
    fn test_classification_prefers_not_found() {
        assert_eq!(
            WatchErrorKind::classify("WatchFailed: invalid type: integer `404`"),
            WatchErrorKind::NotFound
        );
        assert_eq!(
            WatchErrorKind::classify("ApiError: Unauthorized (401)"),
            WatchErrorKind::Unauthorized
        );
        assert_eq!(
            WatchErrorKind::classify("too old resource version"),
            WatchErrorKind::Expired
        );
        assert_eq!(
            WatchErrorKind::classify("storage is (re)initializing"),
            WatchErrorKind::TooManyRequests
        );
        assert_eq!(WatchErrorKind::classify("connection reset"), WatchErrorKind::Other);
    }

    #[test]
    fn test_reconciliation_errors_back_off_per_tenant() {
        let ctx = Arc::new(Reconciler::new(
            Arc::new(MemoryStore::new()),
            ControllerConfig::default(),
        ));
        let error = ReconcilerError::Validation("bad".to_string());

        let first = handle_reconciliation_error(tenant(), &error, Arc::clone(&ctx));
        let second = handle_reconciliation_error(tenant(), &error, Arc::clone(&ctx));
        let third = handle_reconciliation_error(tenant(), &error, Arc::clone(&ctx));
        assert_eq!(first, Action::requeue(Duration::from_secs(60)));
        assert_eq!(second, Action::requeue(Duration::from_secs(60)));
        assert_eq!(third, Action::requeue(Duration::from_secs(120)));

        ctx.reset_backoff("ns1/t1");
        let after_reset = handle_reconciliation_error(tenant(), &error, ctx);
        assert_eq!(after_reset, Action::requeue(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_too_many_requests_doubles_backoff() {
        let backoff = Arc::new(AtomicU64::new(1));
        let outcome = handle_watch_stream_error("429 TooManyRequests", &backoff, 3, 0).await;
        assert!(outcome.is_none());
        assert_eq!(backoff.load(Ordering::Relaxed), 2);
        handle_watch_stream_error("429 TooManyRequests", &backoff, 3, 0).await;
        assert_eq!(backoff.load(Ordering::Relaxed), 3);
    }
}
