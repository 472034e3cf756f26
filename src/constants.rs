//! # Constants
//!
//! Shared constants used throughout the controller.
//!
//! These values represent reasonable defaults and can be overridden via
//! configuration or environment variables where applicable. Label and
//! annotation keys are part of the contract with other tooling and must not
//! change between releases.

/// Default HTTP server port for metrics and health probes
pub const DEFAULT_METRICS_PORT: u16 = 5000;

/// Default HTTP server startup timeout (how long to wait for server to be ready)
pub const DEFAULT_SERVER_STARTUP_TIMEOUT_SECS: u64 = 10;

/// Default HTTP server readiness poll interval
pub const DEFAULT_SERVER_POLL_INTERVAL_MS: u64 = 50;

/// Default exponential backoff starting value (milliseconds)
pub const DEFAULT_BACKOFF_START_MS: u64 = 1000;

/// Default exponential backoff maximum value (milliseconds)
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;

/// Default delay before restarting watch stream after unknown errors (seconds)
pub const DEFAULT_WATCH_RESTART_DELAY_SECS: u64 = 5;

/// Default delay before restarting watch stream after it ends (seconds)
pub const DEFAULT_WATCH_RESTART_DELAY_AFTER_END_SECS: u64 = 1;

/// Default upper bound on reconciliations running at the same time
pub const DEFAULT_MAX_CONCURRENT_RECONCILIATIONS: u16 = 10;

/// Requeue interval while a dependency secret is being created (seconds)
pub const DEFAULT_DEPENDENCY_REQUEUE_SECS: u64 = 5;

/// Requeue interval after a successful reconciliation (seconds)
pub const DEFAULT_RESYNC_SECS: u64 = 600;

/// Interval between passes over ownership transitions whose mapping failed (seconds)
pub const DEFAULT_MAPPER_RETRY_INTERVAL_SECS: u64 = 30;

/// Optimistic-concurrency retry: attempts before giving up
pub const DEFAULT_CONFLICT_RETRY_ATTEMPTS: u32 = 5;

/// Optimistic-concurrency retry: first delay (milliseconds)
pub const DEFAULT_CONFLICT_RETRY_INITIAL_MS: u64 = 100;

/// Optimistic-concurrency retry: delay cap (milliseconds)
pub const DEFAULT_CONFLICT_RETRY_MAX_MS: u64 = 2_000;

/// Field manager and `part-of` value for everything this controller writes
pub const CONTROLLER_NAME: &str = "tenant-controller";

/// API group of the tenant custom resources
pub const API_GROUP: &str = "tenancy.octopilot.io";

// Namespace management labels. The value is the namespace of the owning tenant.

/// Resource-management delegation
pub const LABEL_MANAGED_BY: &str = "tenancy.octopilot.io/managed-by";
/// Application-management delegation
pub const LABEL_APPS_MANAGED_BY: &str = "tenancy.octopilot.io/apps-managed-by";
/// ApplicationSet-management delegation
pub const LABEL_APPSETS_MANAGED_BY: &str = "tenancy.octopilot.io/appsets-managed-by";

/// All management label keys, in evaluation order
pub const MANAGEMENT_LABELS: [&str; 3] = [
    LABEL_MANAGED_BY,
    LABEL_APPS_MANAGED_BY,
    LABEL_APPSETS_MANAGED_BY,
];

/// RBAC type carried by every generated role and role binding
pub const LABEL_RBAC_TYPE: &str = "tenancy.octopilot.io/rbac-type";
pub const RBAC_TYPE_RESOURCE_MANAGEMENT: &str = "resource-management";
pub const RBAC_TYPE_APP_MANAGEMENT: &str = "app-management";
pub const RBAC_TYPE_APPSET_MANAGEMENT: &str = "appset-management";

/// Component label shared with the deployed workloads
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";
pub const COMPONENT_APPLICATION_CONTROLLER: &str = "application-controller";
pub const COMPONENT_APPLICATIONSET_CONTROLLER: &str = "applicationset-controller";
pub const COMPONENT_SERVER: &str = "server";

/// Control-plane components that receive per-namespace RBAC
pub const RBAC_COMPONENTS: [&str; 3] = [
    COMPONENT_APPLICATION_CONTROLLER,
    COMPONENT_APPLICATIONSET_CONTROLLER,
    COMPONENT_SERVER,
];

/// SSO components cleaned up when SSO is removed from a tenant
pub const COMPONENT_DEX: &str = "dex-server";
pub const COMPONENT_KEYCLOAK: &str = "keycloak";

/// Tenant reference carried by generated RBAC in managed namespaces
pub const LABEL_TENANT_NAMESPACE: &str = "tenancy.octopilot.io/tenant-namespace";
pub const LABEL_TENANT_NAME: &str = "tenancy.octopilot.io/tenant-name";

pub const LABEL_PART_OF: &str = "app.kubernetes.io/part-of";
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";

/// Marks the cluster-permissions secret
pub const LABEL_SECRET_TYPE: &str = "tenancy.octopilot.io/secret-type";
pub const SECRET_TYPE_CLUSTER: &str = "cluster";

/// Secrets carrying this annotation with value `"true"` are never updated
pub const ANNOTATION_IGNORE_DRIFT: &str = "tenancy.octopilot.io/ignore-drift";

/// Set on namespaces labelled through a `NamespaceManagement` object
pub const ANNOTATION_MANAGED_VIA_NAMESPACE_MANAGEMENT: &str =
    "tenancy.octopilot.io/managed-via-namespace-management";

/// Finalizer guarding namespace cleanup on tenant deletion
pub const TENANT_FINALIZER: &str = "tenancy.octopilot.io/cleanup";

/// In-cluster API server address recorded in the cluster-permissions secret
pub const DEFAULT_SERVER_URL: &str = "https://kubernetes.default.svc";
pub const DEFAULT_CLUSTER_NAME: &str = "in-cluster";

// Secret data keys

pub const KEY_TLS_CERT: &str = "tls.crt";
pub const KEY_TLS_KEY: &str = "tls.key";
pub const KEY_CA_CERT: &str = "ca.crt";
pub const KEY_ADMIN_PASSWORD: &str = "admin.password";
pub const KEY_ADMIN_PASSWORD_MTIME: &str = "admin.passwordMtime";
pub const KEY_SERVER_SECRET_KEY: &str = "server.secretkey";
pub const KEY_CLUSTER_NAME: &str = "name";
pub const KEY_CLUSTER_SERVER: &str = "server";
pub const KEY_CLUSTER_NAMESPACES: &str = "namespaces";
pub const KEY_CLUSTER_CONFIG: &str = "config";

/// Generated admin password length
pub const ADMIN_PASSWORD_LENGTH: usize = 24;
/// Minimum digits in a generated password
pub const ADMIN_PASSWORD_MIN_DIGITS: usize = 4;
/// Minimum symbols in a generated password
pub const ADMIN_PASSWORD_MIN_SYMBOLS: usize = 4;

/// Validity of the tenant CA (years)
pub const CA_VALIDITY_YEARS: i64 = 10;
/// Validity of leaf certificates (years)
pub const CERT_VALIDITY_YEARS: i64 = 1;
