//! # Event Dispatch
//!
//! Sits on the watch delivery path between the raw watch streams and the
//! tenant controller queue.
//!
//! Watchers deliver only the current state of an object, so the event
//! sources keep the small amount of history the predicates need: the
//! management label values per namespace and whether SSO was configured per
//! tenant. The [`EventDispatcher`] runs the predicates on every translated
//! event, hands passing namespace events to the [`NamespaceMapper`] and
//! pushes the resulting tenant requests into the channel the controller
//! consumes with `reconcile_on`.
//!
//! Tenant events pass through [`EventDispatcher::filter_tenant_event`]. A
//! detected [`TenantTransition`] runs its registered pre-reconcile hook
//! first; when the hook succeeds the event is swallowed.

use crate::constants::{COMPONENT_DEX, COMPONENT_KEYCLOAK, LABEL_COMPONENT, LABEL_INSTANCE};
use crate::controller::mapper::{bare_namespace, NamespaceMapper};
use crate::controller::predicates::{
    namespace_create, namespace_delete, namespace_update, tenant_transition, ManagementLabels,
    TenantTransition,
};
use crate::controller::rbac::{delete_matching, AggregateError};
use crate::controller::retry::RetryConfig;
use crate::controller::selector::{Requirement, Selector};
use crate::controller::store::ResourceStore;
use crate::controller::tracker::OwnershipTracker;
use crate::crd::Tenant;
use async_trait::async_trait;
use futures::channel::mpsc::UnboundedSender;
use k8s_openapi::api::core::v1::{Namespace, Secret};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube_runtime::reflector::ObjectRef;
use kube_runtime::watcher;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

/// A namespace watch event with the label history the predicates need
#[derive(Debug, Clone)]
pub enum NamespaceEvent {
    Create(Namespace),
    Update {
        old: ManagementLabels,
        new: Namespace,
    },
    Delete {
        old: ManagementLabels,
        namespace: Namespace,
    },
}

impl NamespaceEvent {
    pub fn namespace(&self) -> &Namespace {
        match self {
            NamespaceEvent::Create(ns)
            | NamespaceEvent::Update { new: ns, .. }
            | NamespaceEvent::Delete { namespace: ns, .. } => ns,
        }
    }
}

fn namespace_name(ns: &Namespace) -> String {
    ns.metadata.name.clone().unwrap_or_default()
}

/// Turns namespace watcher events into create/update/delete events.
///
/// The first listing only records snapshots: namespaces that existed before
/// the controller started are not creations. Later re-lists after a watch
/// restart compare against the snapshots like any update, and a namespace
/// missing from a re-list was deleted while nobody watched.
#[derive(Debug, Default)]
pub struct NamespaceEventSource {
    snapshots: HashMap<String, ManagementLabels>,
    relist: Option<HashSet<String>>,
    primed: bool,
}

impl NamespaceEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn translate(&mut self, event: watcher::Event<Namespace>) -> Vec<NamespaceEvent> {
        match event {
            watcher::Event::Init => {
                self.relist = Some(HashSet::new());
                Vec::new()
            }
            watcher::Event::InitApply(ns) => {
                let name = namespace_name(&ns);
                if let Some(seen) = self.relist.as_mut() {
                    seen.insert(name.clone());
                }
                if self.primed {
                    vec![self.apply(ns)]
                } else {
                    self.snapshots.insert(name, ManagementLabels::of(&ns));
                    Vec::new()
                }
            }
            watcher::Event::InitDone => {
                self.primed = true;
                let Some(seen) = self.relist.take() else {
                    return Vec::new();
                };
                let vanished: Vec<String> = self
                    .snapshots
                    .keys()
                    .filter(|name| !seen.contains(*name))
                    .cloned()
                    .collect();
                vanished
                    .into_iter()
                    .filter_map(|name| {
                        let old = self.snapshots.remove(&name)?;
                        Some(NamespaceEvent::Delete {
                            old,
                            namespace: bare_namespace(&name),
                        })
                    })
                    .collect()
            }
            watcher::Event::Apply(ns) => vec![self.apply(ns)],
            watcher::Event::Delete(ns) => {
                let old = self
                    .snapshots
                    .remove(&namespace_name(&ns))
                    .unwrap_or_else(|| ManagementLabels::of(&ns));
                vec![NamespaceEvent::Delete { old, namespace: ns }]
            }
        }
    }

    fn apply(&mut self, ns: Namespace) -> NamespaceEvent {
        match self
            .snapshots
            .insert(namespace_name(&ns), ManagementLabels::of(&ns))
        {
            Some(old) => NamespaceEvent::Update { old, new: ns },
            None => NamespaceEvent::Create(ns),
        }
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

fn tenant_key(tenant: &Tenant) -> String {
    format!("{}/{}", tenant.namespace_name(), tenant.name())
}

/// Remembers per tenant whether SSO was configured
#[derive(Debug, Default)]
pub struct TenantEventSource {
    sso: HashMap<String, bool>,
    relist: Option<HashSet<String>>,
}

impl TenantEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, tenant: &Tenant) -> Option<TenantTransition> {
        let key = tenant_key(tenant);
        if let Some(seen) = self.relist.as_mut() {
            seen.insert(key.clone());
        }
        let had_sso = self.sso.insert(key, tenant.has_sso());
        tenant_transition(had_sso, tenant)
    }

    pub fn forget(&mut self, tenant: &Tenant) {
        self.sso.remove(&tenant_key(tenant));
    }

    pub fn begin_relist(&mut self) {
        self.relist = Some(HashSet::new());
    }

    pub fn end_relist(&mut self) {
        if let Some(seen) = self.relist.take() {
            self.sso.retain(|key, _| seen.contains(key));
        }
    }
}

pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// One-shot compensating action run before a tenant event reaches the queue
#[async_trait]
pub trait PreReconcileHook: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, tenant: &Tenant) -> Result<(), HookError>;
}

/// Hooks keyed by the transition that triggers them
#[derive(Default, Clone)]
pub struct PreReconcileHooks {
    hooks: HashMap<TenantTransition, Arc<dyn PreReconcileHook>>,
}

impl std::fmt::Debug for PreReconcileHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.hooks.iter().map(|(t, h)| (t.as_str(), h.name())))
            .finish()
    }
}

impl PreReconcileHooks {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn register(mut self, transition: TenantTransition, hook: Arc<dyn PreReconcileHook>) -> Self {
        self.hooks.insert(transition, hook);
        self
    }

    pub fn get(&self, transition: TenantTransition) -> Option<&Arc<dyn PreReconcileHook>> {
        self.hooks.get(&transition)
    }
}

/// Removes what SSO left behind in the tenant namespace: secrets, roles and
/// role bindings of the SSO components belonging to the tenant
#[derive(Debug)]
pub struct SsoCleanup<S> {
    store: Arc<S>,
}

impl<S: ResourceStore> SsoCleanup<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn cleanup(&self, tenant: &Tenant) -> Result<usize, AggregateError> {
        let namespace = tenant.namespace_name();
        let selector = Selector::new()
            .and(Requirement::is_in(
                LABEL_COMPONENT,
                [COMPONENT_DEX, COMPONENT_KEYCLOAK],
            ))
            .and(Requirement::equals(LABEL_INSTANCE, tenant.name()));

        let store = &*self.store;
        let mut errors = Vec::new();
        let mut deleted = delete_matching::<Secret, S>(store, namespace, &selector, &mut errors).await;
        deleted += delete_matching::<Role, S>(store, namespace, &selector, &mut errors).await;
        deleted += delete_matching::<RoleBinding, S>(store, namespace, &selector, &mut errors).await;

        info!(
            tenant = tenant.name(),
            namespace = namespace,
            deleted = deleted,
            failures = errors.len(),
            "Cleaned up SSO resources"
        );
        AggregateError::into_result(errors, deleted)
    }
}

#[async_trait]
impl<S: ResourceStore> PreReconcileHook for SsoCleanup<S> {
    fn name(&self) -> &'static str {
        "sso-cleanup"
    }

    async fn run(&self, tenant: &Tenant) -> Result<(), HookError> {
        self.cleanup(tenant).await?;
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Predicates, mapper and hooks wired onto the watch delivery path
pub struct EventDispatcher<S> {
    tracker: Arc<OwnershipTracker>,
    mapper: NamespaceMapper<S>,
    hooks: PreReconcileHooks,
    namespaces: Mutex<NamespaceEventSource>,
    tenants: Mutex<TenantEventSource>,
    requests: UnboundedSender<ObjectRef<Tenant>>,
}

impl<S> std::fmt::Debug for EventDispatcher<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("hooks", &self.hooks)
            .field("pending_namespaces", &self.tracker.len())
            .finish_non_exhaustive()
    }
}

impl<S: ResourceStore> EventDispatcher<S> {
    pub fn new(
        store: Arc<S>,
        tracker: Arc<OwnershipTracker>,
        retry: RetryConfig,
        hooks: PreReconcileHooks,
        requests: UnboundedSender<ObjectRef<Tenant>>,
    ) -> Self {
        Self {
            mapper: NamespaceMapper::new(store, Arc::clone(&tracker), retry),
            tracker,
            hooks,
            namespaces: Mutex::new(NamespaceEventSource::new()),
            tenants: Mutex::new(TenantEventSource::new()),
            requests,
        }
    }

    /// Dispatcher with the SSO cleanup hook registered
    pub fn with_default_hooks(
        store: Arc<S>,
        tracker: Arc<OwnershipTracker>,
        retry: RetryConfig,
        requests: UnboundedSender<ObjectRef<Tenant>>,
    ) -> Self {
        let hooks = PreReconcileHooks::new().register(
            TenantTransition::SsoRemoved,
            Arc::new(SsoCleanup::new(Arc::clone(&store))),
        );
        Self::new(store, tracker, retry, hooks, requests)
    }

    pub fn mapper(&self) -> &NamespaceMapper<S> {
        &self.mapper
    }

    /// Run one namespace watch event through predicates and mapper.
    /// Returns the number of tenant requests sent.
    pub async fn handle_namespace_event(&self, event: watcher::Event<Namespace>) -> usize {
        let events = lock(&self.namespaces).translate(event);
        let mut sent = 0;
        for event in events {
            sent += self.dispatch(event).await;
        }
        sent
    }

    /// Map again every namespace whose transitions are still parked, which
    /// only happens when an earlier mapping failed part way
    pub async fn retry_pending(&self) -> usize {
        self.tracker.initialize();
        let mut sent = 0;
        for name in self.tracker.namespaces() {
            debug!(namespace = %name, "Retrying ownership transitions");
            sent += self.send(self.mapper.retry(&name).await);
        }
        sent
    }

    async fn dispatch(&self, event: NamespaceEvent) -> usize {
        self.tracker.initialize();
        let passed = match &event {
            NamespaceEvent::Create(ns) => namespace_create(&self.tracker, ns),
            NamespaceEvent::Update { old, new } => namespace_update(&self.tracker, old, new),
            NamespaceEvent::Delete { old, namespace } => {
                namespace_delete(&self.tracker, old, namespace)
            }
        };
        let namespace = event.namespace();
        let terminating = namespace.metadata.deletion_timestamp.is_some();
        if !passed && !terminating {
            return 0;
        }

        self.send(self.mapper.map(namespace).await)
    }

    fn send(&self, requests: Vec<ObjectRef<Tenant>>) -> usize {
        let sent = requests.len();
        for request in requests {
            debug!(tenant = %request, "Requesting tenant reconcile");
            if let Err(e) = self.requests.unbounded_send(request) {
                warn!(error = %e, "Tenant request channel closed");
            }
        }
        sent
    }

    /// Pass a tenant watch event on to the controller, or swallow it.
    /// `Some` is the object the controller should see.
    pub async fn filter_tenant_event(&self, event: watcher::Event<Tenant>) -> Option<Tenant> {
        let tenant = match event {
            watcher::Event::Init => {
                lock(&self.tenants).begin_relist();
                return None;
            }
            watcher::Event::InitDone => {
                lock(&self.tenants).end_relist();
                return None;
            }
            watcher::Event::Delete(tenant) => {
                lock(&self.tenants).forget(&tenant);
                return Some(tenant);
            }
            watcher::Event::Apply(tenant) | watcher::Event::InitApply(tenant) => tenant,
        };

        let transition = lock(&self.tenants).observe(&tenant);
        let Some(transition) = transition else {
            return Some(tenant);
        };
        let Some(hook) = self.hooks.get(transition) else {
            return Some(tenant);
        };

        match hook.run(&tenant).await {
            Ok(()) => {
                info!(
                    tenant = tenant.name(),
                    namespace = tenant.namespace_name(),
                    transition = transition.as_str(),
                    hook = hook.name(),
                    "Pre-reconcile hook handled tenant event"
                );
                None
            }
            Err(e) => {
                error!(
                    tenant = tenant.name(),
                    namespace = tenant.namespace_name(),
                    transition = transition.as_str(),
                    hook = hook.name(),
                    error = %e,
                    "Pre-reconcile hook failed, reconciling normally"
                );
                Some(tenant)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::LABEL_MANAGED_BY;
    use crate::controller::secrets::test_support::tenant;
    use crate::controller::store::memory::MemoryStore;
    use crate::crd::{SsoProvider, SsoSpec};
    use futures::channel::mpsc;
    use kube::api::ObjectMeta;

    fn ns(name: &str, owner: Option<&str>) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: owner.map(|o| [(LABEL_MANAGED_BY.to_string(), o.to_string())].into()),
                ..ObjectMeta::default()
            },
            ..Namespace::default()
        }
    }

    fn with_sso(mut t: Tenant) -> Tenant {
        t.spec.sso = Some(SsoSpec {
            provider: SsoProvider::Dex,
            dex: None,
            keycloak: None,
        });
        t
    }

    #[test]
    fn test_initial_listing_only_primes() {
        let mut source = NamespaceEventSource::new();
        assert!(source.translate(watcher::Event::Init).is_empty());
        assert!(source
            .translate(watcher::Event::InitApply(ns("ns2", Some("ns1"))))
            .is_empty());
        assert!(source.translate(watcher::Event::InitDone).is_empty());
        assert_eq!(source.len(), 1);

        match source.translate(watcher::Event::Apply(ns("ns2", None))).as_slice() {
            [NamespaceEvent::Update { old, .. }] => {
                assert_eq!(
                    old.get(crate::controller::rbac::RbacType::ResourceManagement),
                    Some("ns1")
                );
            }
            other => panic!("expected update, got {other:?}"),
        }
        assert!(matches!(
            source.translate(watcher::Event::Apply(ns("ns9", None))).as_slice(),
            [NamespaceEvent::Create(_)]
        ));
    }

    #[test]
    fn test_relist_reports_vanished_namespaces_as_deleted() {
        let mut source = NamespaceEventSource::new();
        source.translate(watcher::Event::Init);
        source.translate(watcher::Event::InitApply(ns("a", None)));
        source.translate(watcher::Event::InitApply(ns("b", Some("ns1"))));
        source.translate(watcher::Event::InitDone);

        source.translate(watcher::Event::Init);
        assert!(matches!(
            source.translate(watcher::Event::InitApply(ns("a", None))).as_slice(),
            [NamespaceEvent::Update { .. }]
        ));
        match source.translate(watcher::Event::InitDone).as_slice() {
            [NamespaceEvent::Delete { old, namespace }] => {
                assert_eq!(namespace.metadata.name.as_deref(), Some("b"));
                assert_eq!(
                    old.get(crate::controller::rbac::RbacType::ResourceManagement),
                    Some("ns1")
                );
            }
            other => panic!("expected one delete, got {other:?}"),
        }
        assert_eq!(source.len(), 1);
    }

    #[tokio::test]
    async fn test_label_change_sends_requests() {
        let store = Arc::new(MemoryStore::new());
        store.create(&tenant("t1", "ns1")).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded();
        let dispatcher = EventDispatcher::with_default_hooks(
            Arc::clone(&store),
            Arc::new(OwnershipTracker::new()),
            RetryConfig::immediate(3),
            tx,
        );

        dispatcher.handle_namespace_event(watcher::Event::Init).await;
        dispatcher
            .handle_namespace_event(watcher::Event::InitApply(ns("ns2", None)))
            .await;
        dispatcher.handle_namespace_event(watcher::Event::InitDone).await;

        let sent = dispatcher
            .handle_namespace_event(watcher::Event::Apply(ns("ns2", Some("ns1"))))
            .await;
        assert_eq!(sent, 1);
        assert_eq!(rx.try_next().unwrap(), Some(ObjectRef::new("t1").within("ns1")));

        let sent = dispatcher
            .handle_namespace_event(watcher::Event::Apply(ns("ns2", Some("ns1"))))
            .await;
        assert_eq!(sent, 0);
    }

    #[tokio::test]
    async fn test_sso_removal_runs_cleanup_and_swallows_event() {
        let store = Arc::new(MemoryStore::new());
        let t1 = tenant("t1", "ns1");
        let mut dex = Secret::default();
        dex.metadata.name = Some("t1-dex-server".to_string());
        dex.metadata.namespace = Some("ns1".to_string());
        dex.metadata.labels = Some(
            [
                (LABEL_COMPONENT.to_string(), COMPONENT_DEX.to_string()),
                (LABEL_INSTANCE.to_string(), "t1".to_string()),
            ]
            .into(),
        );
        store.create(&dex).await.unwrap();

        let (tx, _rx) = mpsc::unbounded();
        let dispatcher = EventDispatcher::with_default_hooks(
            Arc::clone(&store),
            Arc::new(OwnershipTracker::new()),
            RetryConfig::immediate(3),
            tx,
        );

        let first = dispatcher
            .filter_tenant_event(watcher::Event::Apply(with_sso(t1.clone())))
            .await;
        assert!(first.is_some());

        let removed = dispatcher
            .filter_tenant_event(watcher::Event::Apply(t1.clone()))
            .await;
        assert!(removed.is_none());
        assert!(store
            .get::<Secret>("ns1", "t1-dex-server")
            .await
            .unwrap()
            .is_none());

        let next = dispatcher.filter_tenant_event(watcher::Event::Apply(t1)).await;
        assert!(next.is_some());
    }

    #[tokio::test]
    async fn test_failed_hook_lets_event_through() {
        let store = Arc::new(MemoryStore::new());
        let t1 = tenant("t1", "ns1");
        let mut dex = Secret::default();
        dex.metadata.name = Some("t1-dex-server".to_string());
        dex.metadata.namespace = Some("ns1".to_string());
        dex.metadata.labels = Some(
            [
                (LABEL_COMPONENT.to_string(), COMPONENT_DEX.to_string()),
                (LABEL_INSTANCE.to_string(), "t1".to_string()),
            ]
            .into(),
        );
        store.create(&dex).await.unwrap();
        store.fail_deletes_of::<Secret>("ns1", "t1-dex-server");

        let (tx, _rx) = mpsc::unbounded();
        let dispatcher = EventDispatcher::with_default_hooks(
            Arc::clone(&store),
            Arc::new(OwnershipTracker::new()),
            RetryConfig::immediate(3),
            tx,
        );
        dispatcher
            .filter_tenant_event(watcher::Event::Apply(with_sso(t1.clone())))
            .await;
        assert!(dispatcher
            .filter_tenant_event(watcher::Event::Apply(t1))
            .await
            .is_some());
    }
}
