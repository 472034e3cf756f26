//! # Metrics
//!
//! Prometheus metrics for monitoring the controller.
//!
//! ## Metrics Exposed
//!
//! - `tenant_controller_reconciliations_total` - Total number of tenant reconciliations
//! - `tenant_controller_reconciliation_errors_total` - Total number of reconciliation errors
//! - `tenant_controller_reconciliation_duration_seconds` - Duration of reconciliations
//! - `tenant_controller_secret_operations_total` - Generated secret outcomes by kind and outcome
//! - `tenant_controller_rbac_deletions_total` - Roles and role bindings deleted after ownership changes
//! - `tenant_controller_rbac_deletion_errors_total` - Failed role/role binding deletions
//! - `tenant_controller_mapper_requests_total` - Reconcile requests emitted by the namespace mapper
//! - `tenant_controller_requeues_total` - Requeues by reason
//! - `tenant_controller_managed_namespaces` - Namespaces currently delegated to tenants

use anyhow::Result;
use prometheus::{Histogram, IntCounter, IntCounterVec, IntGaugeVec, Registry};
use std::sync::LazyLock;

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILIATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "tenant_controller_reconciliations_total",
        "Total number of tenant reconciliations",
    )
    .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "tenant_controller_reconciliation_errors_total",
        "Total number of tenant reconciliation errors",
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILIATION_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "tenant_controller_reconciliation_duration_seconds",
            "Duration of tenant reconciliation in seconds",
        )
        .buckets(vec![0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
    )
    .expect("Failed to create RECONCILIATION_DURATION metric - this should never happen")
});

static SECRET_OPERATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "tenant_controller_secret_operations_total",
            "Generated secret reconcile outcomes by secret kind and outcome",
        ),
        &["kind", "outcome"],
    )
    .expect("Failed to create SECRET_OPERATIONS_TOTAL metric - this should never happen")
});

static RBAC_DELETIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "tenant_controller_rbac_deletions_total",
        "Total number of roles and role bindings deleted after ownership changes",
    )
    .expect("Failed to create RBAC_DELETIONS_TOTAL metric - this should never happen")
});

static RBAC_DELETION_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "tenant_controller_rbac_deletion_errors_total",
        "Total number of failed role and role binding deletions",
    )
    .expect("Failed to create RBAC_DELETION_ERRORS_TOTAL metric - this should never happen")
});

static MAPPER_REQUESTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "tenant_controller_mapper_requests_total",
            "Reconcile requests emitted by the namespace mapper by reason",
        ),
        &["reason"],
    )
    .expect("Failed to create MAPPER_REQUESTS_TOTAL metric - this should never happen")
});

static REQUEUES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "tenant_controller_requeues_total",
            "Total number of requeues by reason",
        ),
        &["reason"],
    )
    .expect("Failed to create REQUEUES_TOTAL metric - this should never happen")
});

static MANAGED_NAMESPACES: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    IntGaugeVec::new(
        prometheus::Opts::new(
            "tenant_controller_managed_namespaces",
            "Namespaces delegated to a tenant as of its last reconciliation",
        ),
        &["tenant_namespace"],
    )
    .expect("Failed to create MANAGED_NAMESPACES metric - this should never happen")
});

#[allow(
    clippy::missing_errors_doc,
    reason = "Fails only when a metric is registered twice"
)]
pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(SECRET_OPERATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RBAC_DELETIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RBAC_DELETION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(MAPPER_REQUESTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(REQUEUES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(MANAGED_NAMESPACES.clone()))?;

    Ok(())
}

pub fn increment_reconciliations() {
    RECONCILIATIONS_TOTAL.inc();
}

pub fn increment_reconciliation_errors() {
    RECONCILIATION_ERRORS_TOTAL.inc();
}

pub fn observe_reconciliation_duration(duration: f64) {
    RECONCILIATION_DURATION.observe(duration);
}

pub fn increment_secret_operations(kind: &str, outcome: &str) {
    SECRET_OPERATIONS_TOTAL
        .with_label_values(&[kind, outcome])
        .inc();
}

pub fn increment_rbac_deletions(count: usize) {
    RBAC_DELETIONS_TOTAL.inc_by(count as u64);
}

pub fn increment_rbac_deletion_errors(count: usize) {
    RBAC_DELETION_ERRORS_TOTAL.inc_by(count as u64);
}

pub fn increment_mapper_requests(reason: &str, count: usize) {
    MAPPER_REQUESTS_TOTAL
        .with_label_values(&[reason])
        .inc_by(count as u64);
}

pub fn increment_requeues_total(reason: &str) {
    REQUEUES_TOTAL.with_label_values(&[reason]).inc();
}

pub fn set_managed_namespaces(tenant_namespace: &str, count: usize) {
    MANAGED_NAMESPACES
        .with_label_values(&[tenant_namespace])
        .set(i64::try_from(count).unwrap_or(i64::MAX));
}

pub fn clear_managed_namespaces(tenant_namespace: &str) {
    let _ = MANAGED_NAMESPACES.remove_label_values(&[tenant_namespace]);
}
