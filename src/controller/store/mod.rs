//! # Resource Store
//!
//! The controller's only path to cluster state. Every secret, role, role
//! binding, tenant and namespace read or write goes through [`ResourceStore`],
//! which keeps the reconciliation logic independent of the API client.
//!
//! - [`KubeStore`] talks to the API server through `kube::Api`
//! - [`memory::MemoryStore`] keeps objects in process for tests

mod kube_store;
pub mod memory;

pub use kube_store::KubeStore;

use crate::controller::selector::Selector;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::NamespaceResourceScope;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Any namespaced object the store can handle
pub trait NamespacedObject:
    Resource<Scope = NamespaceResourceScope, DynamicType = ()>
    + Clone
    + std::fmt::Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> NamespacedObject for K where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + std::fmt::Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: String, key: String },

    #[error("conflict writing {kind} {key}: object was modified")]
    Conflict { kind: String, key: String },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: String, key: String },

    #[error("{kind} {key} is missing {field}")]
    InvalidObject {
        kind: String,
        key: String,
        field: &'static str,
    },

    #[error("API request failed: {0}")]
    Api(#[source] kube::Error),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store failure: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists { .. })
    }
}

/// Generic CRUD over typed objects with label-selector filtering.
///
/// `delete` is idempotent: deleting an absent object succeeds. `update`
/// honours the object's `resourceVersion` and fails with
/// [`StoreError::Conflict`] when another writer got there first.
#[async_trait]
pub trait ResourceStore: Send + Sync + 'static {
    async fn get<K: NamespacedObject>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<K>, StoreError>;

    async fn list<K: NamespacedObject>(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<K>, StoreError>;

    /// List across every namespace
    async fn list_all<K: NamespacedObject>(&self, selector: &Selector)
        -> Result<Vec<K>, StoreError>;

    async fn create<K: NamespacedObject>(&self, obj: &K) -> Result<K, StoreError>;

    async fn update<K: NamespacedObject>(&self, obj: &K) -> Result<K, StoreError>;

    async fn delete<K: NamespacedObject>(&self, namespace: &str, name: &str)
        -> Result<(), StoreError>;

    /// Merge `status` into the object's status subresource
    async fn update_status<K: NamespacedObject>(
        &self,
        namespace: &str,
        name: &str,
        status: serde_json::Value,
    ) -> Result<(), StoreError>;

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, StoreError>;

    async fn list_namespaces(&self, selector: &Selector) -> Result<Vec<Namespace>, StoreError>;

    async fn update_namespace(&self, namespace: &Namespace) -> Result<Namespace, StoreError>;
}

/// `namespace/name` of an object, for errors and logs
pub fn object_key<K: Resource>(obj: &K) -> String {
    format!(
        "{}/{}",
        obj.meta().namespace.as_deref().unwrap_or_default(),
        obj.meta().name.as_deref().unwrap_or_default()
    )
}

pub(crate) fn kind_of<K: Resource<DynamicType = ()>>() -> String {
    K::kind(&()).into_owned()
}

/// Namespace and name of an object about to be written
pub(crate) fn write_target<K: Resource<DynamicType = ()>>(
    obj: &K,
) -> Result<(String, String), StoreError> {
    let namespace = obj
        .meta()
        .namespace
        .clone()
        .ok_or_else(|| StoreError::InvalidObject {
            kind: kind_of::<K>(),
            key: object_key(obj),
            field: "metadata.namespace",
        })?;
    let name = obj
        .meta()
        .name
        .clone()
        .ok_or_else(|| StoreError::InvalidObject {
            kind: kind_of::<K>(),
            key: object_key(obj),
            field: "metadata.name",
        })?;
    Ok((namespace, name))
}
