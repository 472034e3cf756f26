//! # In-Memory Store
//!
//! A [`ResourceStore`] holding objects in process. It follows the API
//! server's rules that matter to the controller: optimistic concurrency on
//! `resourceVersion`, deletion held back by finalizers, and idempotent
//! deletes. Every call is counted per verb and kind so tests can assert how
//! many writes a reconcile performed, and failures can be injected.

use super::{kind_of, object_key, write_target, NamespacedObject, ResourceStore, StoreError};
use crate::controller::selector::Selector;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::Resource;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

const NAMESPACE_KIND: &str = "Namespace";

/// (kind, namespace, name); namespaces themselves use an empty namespace
type ObjectId = (String, String, String);

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<ObjectId, serde_json::Value>,
    next_version: u64,
    calls: BTreeMap<(&'static str, String), usize>,
    failing_deletes: BTreeSet<ObjectId>,
    pending_conflicts: BTreeMap<String, usize>,
}

impl State {
    fn bump_version(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    fn record(&mut self, verb: &'static str, kind: &str) {
        *self.calls.entry((verb, kind.to_string())).or_default() += 1;
    }

    fn take_conflict(&mut self, kind: &str) -> bool {
        match self.pending_conflicts.get_mut(kind) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|e| StoreError::Backend(format!("memory store lock poisoned: {e}")))
    }

    /// Number of calls of `verb` (`get`, `list`, `create`, `update`,
    /// `delete`, `update_status`) made for kind `K`
    pub fn calls<K: Resource<DynamicType = ()>>(&self, verb: &str) -> usize {
        self.calls_for_kind(&kind_of::<K>(), verb)
    }

    /// Same as [`MemoryStore::calls`] for namespaces
    pub fn namespace_calls(&self, verb: &str) -> usize {
        self.calls_for_kind(NAMESPACE_KIND, verb)
    }

    fn calls_for_kind(&self, kind: &str, verb: &str) -> usize {
        self.state.lock().map_or(0, |state| {
            state
                .calls
                .iter()
                .filter(|((v, k), _)| *v == verb && k == kind)
                .map(|(_, n)| *n)
                .sum()
        })
    }

    /// Total writes (create, update, delete, status) across all kinds
    pub fn write_calls(&self) -> usize {
        self.state.lock().map_or(0, |state| {
            state
                .calls
                .iter()
                .filter(|((v, _), _)| *v != "get" && *v != "list")
                .map(|(_, n)| *n)
                .sum()
        })
    }

    pub fn reset_calls(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.calls.clear();
        }
    }

    /// Make every delete of the named object fail
    pub fn fail_deletes_of<K: Resource<DynamicType = ()>>(&self, namespace: &str, name: &str) {
        if let Ok(mut state) = self.state.lock() {
            state
                .failing_deletes
                .insert((kind_of::<K>(), namespace.to_string(), name.to_string()));
        }
    }

    /// Fail the next `count` updates of kind `K` with a conflict
    pub fn inject_conflicts<K: Resource<DynamicType = ()>>(&self, count: usize) {
        if let Ok(mut state) = self.state.lock() {
            state.pending_conflicts.insert(kind_of::<K>(), count);
        }
    }

    /// Fail the next `count` namespace updates with a conflict
    pub fn inject_namespace_conflicts(&self, count: usize) {
        if let Ok(mut state) = self.state.lock() {
            state.pending_conflicts.insert(NAMESPACE_KIND.to_string(), count);
        }
    }

    /// Stop injecting delete failures and conflicts
    pub fn heal(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.failing_deletes.clear();
            state.pending_conflicts.clear();
        }
    }

    /// Drop a namespace outright, leaving its contents behind
    pub fn remove_namespace(&self, name: &str) -> bool {
        let id = (NAMESPACE_KIND.to_string(), String::new(), name.to_string());
        self.state
            .lock()
            .is_ok_and(|mut state| state.objects.remove(&id).is_some())
    }

    /// Seed a namespace (counts as a namespace create)
    pub fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace, StoreError> {
        let name = namespace.metadata.name.clone().unwrap_or_default();
        let id = (NAMESPACE_KIND.to_string(), String::new(), name.clone());
        let mut state = self.lock()?;
        state.record("create", NAMESPACE_KIND);
        if state.objects.contains_key(&id) {
            return Err(StoreError::AlreadyExists {
                kind: NAMESPACE_KIND.to_string(),
                key: name,
            });
        }
        let mut stored = namespace.clone();
        stored.metadata.resource_version = Some(state.bump_version());
        state.objects.insert(id, serde_json::to_value(&stored)?);
        Ok(stored)
    }

    fn matching<K: serde::de::DeserializeOwned + Resource>(
        state: &State,
        kind: &str,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> Result<Vec<K>, StoreError> {
        let mut out = Vec::new();
        for ((k, ns, _), value) in &state.objects {
            if k != kind || namespace.is_some_and(|want| want != ns) {
                continue;
            }
            let obj: K = serde_json::from_value(value.clone())?;
            if selector.matches_opt(obj.meta().labels.as_ref()) {
                out.push(obj);
            }
        }
        Ok(out)
    }
}

fn has_finalizers<K: Resource>(obj: &K) -> bool {
    obj.meta().finalizers.as_ref().is_some_and(|f| !f.is_empty())
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get<K: NamespacedObject>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<K>, StoreError> {
        let kind = kind_of::<K>();
        let mut state = self.lock()?;
        state.record("get", &kind);
        state
            .objects
            .get(&(kind, namespace.to_string(), name.to_string()))
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
            .map_err(StoreError::from)
    }

    async fn list<K: NamespacedObject>(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<K>, StoreError> {
        let kind = kind_of::<K>();
        let mut state = self.lock()?;
        state.record("list", &kind);
        Self::matching(&state, &kind, Some(namespace), selector)
    }

    async fn list_all<K: NamespacedObject>(
        &self,
        selector: &Selector,
    ) -> Result<Vec<K>, StoreError> {
        let kind = kind_of::<K>();
        let mut state = self.lock()?;
        state.record("list", &kind);
        Self::matching(&state, &kind, None, selector)
    }

    async fn create<K: NamespacedObject>(&self, obj: &K) -> Result<K, StoreError> {
        let kind = kind_of::<K>();
        let (namespace, name) = write_target(obj)?;
        let id = (kind.clone(), namespace, name);
        let mut state = self.lock()?;
        state.record("create", &kind);
        if state.objects.contains_key(&id) {
            return Err(StoreError::AlreadyExists {
                kind,
                key: object_key(obj),
            });
        }
        let mut stored = obj.clone();
        stored.meta_mut().resource_version = Some(state.bump_version());
        state.objects.insert(id, serde_json::to_value(&stored)?);
        Ok(stored)
    }

    async fn update<K: NamespacedObject>(&self, obj: &K) -> Result<K, StoreError> {
        let kind = kind_of::<K>();
        let (namespace, name) = write_target(obj)?;
        let id = (kind.clone(), namespace, name);
        let mut state = self.lock()?;
        state.record("update", &kind);
        if state.take_conflict(&kind) {
            return Err(StoreError::Conflict {
                kind,
                key: object_key(obj),
            });
        }
        let current: K = match state.objects.get(&id) {
            Some(v) => serde_json::from_value(v.clone())?,
            None => {
                return Err(StoreError::NotFound {
                    kind,
                    key: object_key(obj),
                })
            }
        };
        if let Some(expected) = obj.meta().resource_version.as_deref() {
            if current.meta().resource_version.as_deref() != Some(expected) {
                return Err(StoreError::Conflict {
                    kind,
                    key: object_key(obj),
                });
            }
        }
        let mut stored = obj.clone();
        if current.meta().deletion_timestamp.is_some() && !has_finalizers(&stored) {
            state.objects.remove(&id);
            return Ok(stored);
        }
        stored.meta_mut().deletion_timestamp = current.meta().deletion_timestamp.clone();
        stored.meta_mut().resource_version = Some(state.bump_version());
        state.objects.insert(id, serde_json::to_value(&stored)?);
        Ok(stored)
    }

    async fn delete<K: NamespacedObject>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), StoreError> {
        let kind = kind_of::<K>();
        let id = (kind.clone(), namespace.to_string(), name.to_string());
        let mut state = self.lock()?;
        state.record("delete", &kind);
        if state.failing_deletes.contains(&id) {
            return Err(StoreError::Backend(format!(
                "injected delete failure for {kind} {namespace}/{name}"
            )));
        }
        let Some(mut value) = state.objects.get(&id).cloned() else {
            return Ok(());
        };
        let obj: K = serde_json::from_value(value.clone())?;
        if !has_finalizers(&obj) {
            state.objects.remove(&id);
            return Ok(());
        }
        if obj.meta().deletion_timestamp.is_none() {
            let version = state.bump_version();
            if let Some(meta) = value.get_mut("metadata").and_then(|m| m.as_object_mut()) {
                meta.insert(
                    "deletionTimestamp".to_string(),
                    serde_json::Value::String(
                        chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                    ),
                );
                meta.insert(
                    "resourceVersion".to_string(),
                    serde_json::Value::String(version),
                );
            }
            state.objects.insert(id, value);
        }
        Ok(())
    }

    async fn update_status<K: NamespacedObject>(
        &self,
        namespace: &str,
        name: &str,
        status: serde_json::Value,
    ) -> Result<(), StoreError> {
        let kind = kind_of::<K>();
        let id = (kind.clone(), namespace.to_string(), name.to_string());
        let mut state = self.lock()?;
        state.record("update_status", &kind);
        let version = state.bump_version();
        let Some(value) = state.objects.get_mut(&id) else {
            return Err(StoreError::NotFound {
                kind,
                key: format!("{namespace}/{name}"),
            });
        };
        if let Some(map) = value.as_object_mut() {
            map.insert("status".to_string(), status);
            if let Some(meta) = map.get_mut("metadata").and_then(|m| m.as_object_mut()) {
                meta.insert(
                    "resourceVersion".to_string(),
                    serde_json::Value::String(version),
                );
            }
        }
        Ok(())
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, StoreError> {
        let mut state = self.lock()?;
        state.record("get", NAMESPACE_KIND);
        state
            .objects
            .get(&(NAMESPACE_KIND.to_string(), String::new(), name.to_string()))
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
            .map_err(StoreError::from)
    }

    async fn list_namespaces(&self, selector: &Selector) -> Result<Vec<Namespace>, StoreError> {
        let mut state = self.lock()?;
        state.record("list", NAMESPACE_KIND);
        Self::matching(&state, NAMESPACE_KIND, Some(""), selector)
    }

    async fn update_namespace(&self, namespace: &Namespace) -> Result<Namespace, StoreError> {
        let name = namespace.metadata.name.clone().unwrap_or_default();
        let id = (NAMESPACE_KIND.to_string(), String::new(), name.clone());
        let mut state = self.lock()?;
        state.record("update", NAMESPACE_KIND);
        if state.take_conflict(NAMESPACE_KIND) {
            return Err(StoreError::Conflict {
                kind: NAMESPACE_KIND.to_string(),
                key: name,
            });
        }
        let current: Namespace = match state.objects.get(&id) {
            Some(v) => serde_json::from_value(v.clone())?,
            None => {
                return Err(StoreError::NotFound {
                    kind: NAMESPACE_KIND.to_string(),
                    key: name,
                })
            }
        };
        if let Some(expected) = namespace.metadata.resource_version.as_deref() {
            if current.metadata.resource_version.as_deref() != Some(expected) {
                return Err(StoreError::Conflict {
                    kind: NAMESPACE_KIND.to_string(),
                    key: name,
                });
            }
        }
        let mut stored = namespace.clone();
        stored.metadata.resource_version = Some(state.bump_version());
        state.objects.insert(id, serde_json::to_value(&stored)?);
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::selector::Requirement;
    use k8s_openapi::api::core::v1::Secret;
    use kube::api::ObjectMeta;

    fn secret(name: &str, labels: &[(&str, &str)]) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns1".to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                        .collect(),
                ),
                ..ObjectMeta::default()
            },
            ..Secret::default()
        }
    }

    #[tokio::test]
    async fn test_update_with_stale_resource_version_conflicts() {
        let store = MemoryStore::new();
        let created = store.create(&secret("a", &[])).await.unwrap();
        store.update(&created).await.unwrap();

        let err = store.update(&created).await.unwrap_err();
        assert!(err.is_conflict(), "stale update should conflict: {err}");
    }

    #[tokio::test]
    async fn test_list_filters_by_selector() {
        let store = MemoryStore::new();
        store.create(&secret("a", &[("t", "x")])).await.unwrap();
        store.create(&secret("b", &[("t", "y")])).await.unwrap();

        let selected: Vec<Secret> = store
            .list("ns1", &Selector::new().and(Requirement::equals("t", "y")))
            .await
            .unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].metadata.name.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent_and_respects_finalizers() {
        let store = MemoryStore::new();
        store.delete::<Secret>("ns1", "missing").await.unwrap();

        let mut guarded = secret("guarded", &[]);
        guarded.metadata.finalizers = Some(vec!["example.com/f".to_string()]);
        store.create(&guarded).await.unwrap();
        store.delete::<Secret>("ns1", "guarded").await.unwrap();

        let mut pending: Secret = store.get("ns1", "guarded").await.unwrap().unwrap();
        assert!(pending.metadata.deletion_timestamp.is_some());

        pending.metadata.finalizers = None;
        store.update(&pending).await.unwrap();
        assert!(store
            .get::<Secret>("ns1", "guarded")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_call_counters() {
        let store = MemoryStore::new();
        store.create(&secret("a", &[])).await.unwrap();
        let _ = store.get::<Secret>("ns1", "a").await.unwrap();
        assert_eq!(store.calls::<Secret>("create"), 1);
        assert_eq!(store.calls::<Secret>("get"), 1);
        assert_eq!(store.write_calls(), 1);
        store.reset_calls();
        assert_eq!(store.write_calls(), 0);
    }
}
