//! # Kubernetes Store
//!
//! [`ResourceStore`] backed by the API server.

use super::{kind_of, write_target, NamespacedObject, ResourceStore, StoreError};
use crate::constants::CONTROLLER_NAME;
use crate::controller::selector::Selector;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
use tracing::debug;

#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl std::fmt::Debug for KubeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStore").finish_non_exhaustive()
    }
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api<K: NamespacedObject>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn list_params(selector: &Selector) -> ListParams {
    if selector.is_empty() {
        ListParams::default()
    } else {
        ListParams::default().labels_from(&selector.to_label_selector())
    }
}

/// Map API failures onto the store's error vocabulary
fn map_error<K: Resource<DynamicType = ()>>(err: kube::Error, key: &str) -> StoreError {
    match err {
        kube::Error::Api(api_err) if api_err.code == 404 => StoreError::NotFound {
            kind: kind_of::<K>(),
            key: key.to_string(),
        },
        kube::Error::Api(api_err) if api_err.code == 409 && api_err.reason == "AlreadyExists" => {
            StoreError::AlreadyExists {
                kind: kind_of::<K>(),
                key: key.to_string(),
            }
        }
        kube::Error::Api(api_err) if api_err.code == 409 => StoreError::Conflict {
            kind: kind_of::<K>(),
            key: key.to_string(),
        },
        other => StoreError::Api(other),
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get<K: NamespacedObject>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<K>, StoreError> {
        self.api::<K>(namespace)
            .get_opt(name)
            .await
            .map_err(|e| map_error::<K>(e, &format!("{namespace}/{name}")))
    }

    async fn list<K: NamespacedObject>(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<K>, StoreError> {
        let list = self
            .api::<K>(namespace)
            .list(&list_params(selector))
            .await
            .map_err(|e| map_error::<K>(e, namespace))?;
        Ok(list.items)
    }

    async fn list_all<K: NamespacedObject>(
        &self,
        selector: &Selector,
    ) -> Result<Vec<K>, StoreError> {
        let list = Api::<K>::all(self.client.clone())
            .list(&list_params(selector))
            .await
            .map_err(|e| map_error::<K>(e, "*"))?;
        Ok(list.items)
    }

    async fn create<K: NamespacedObject>(&self, obj: &K) -> Result<K, StoreError> {
        let (namespace, name) = write_target(obj)?;
        debug!(kind = %kind_of::<K>(), namespace = %namespace, name = %name, "store.create");
        self.api::<K>(&namespace)
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| map_error::<K>(e, &format!("{namespace}/{name}")))
    }

    async fn update<K: NamespacedObject>(&self, obj: &K) -> Result<K, StoreError> {
        let (namespace, name) = write_target(obj)?;
        debug!(kind = %kind_of::<K>(), namespace = %namespace, name = %name, "store.update");
        self.api::<K>(&namespace)
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| map_error::<K>(e, &format!("{namespace}/{name}")))
    }

    async fn delete<K: NamespacedObject>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), StoreError> {
        debug!(kind = %kind_of::<K>(), namespace = %namespace, name = %name, "store.delete");
        match self
            .api::<K>(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(api_err)) if api_err.code == 404 => Ok(()),
            Err(e) => Err(map_error::<K>(e, &format!("{namespace}/{name}"))),
        }
    }

    async fn update_status<K: NamespacedObject>(
        &self,
        namespace: &str,
        name: &str,
        status: serde_json::Value,
    ) -> Result<(), StoreError> {
        let patch = serde_json::json!({ "status": status });
        self.api::<K>(namespace)
            .patch_status(
                name,
                &PatchParams::apply(CONTROLLER_NAME),
                &Patch::Merge(patch),
            )
            .await
            .map_err(|e| map_error::<K>(e, &format!("{namespace}/{name}")))?;
        Ok(())
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, StoreError> {
        Api::<Namespace>::all(self.client.clone())
            .get_opt(name)
            .await
            .map_err(|e| map_error::<Namespace>(e, name))
    }

    async fn list_namespaces(&self, selector: &Selector) -> Result<Vec<Namespace>, StoreError> {
        let list = Api::<Namespace>::all(self.client.clone())
            .list(&list_params(selector))
            .await
            .map_err(|e| map_error::<Namespace>(e, "*"))?;
        Ok(list.items)
    }

    async fn update_namespace(&self, namespace: &Namespace) -> Result<Namespace, StoreError> {
        let name = namespace
            .metadata
            .name
            .clone()
            .ok_or_else(|| StoreError::InvalidObject {
                kind: "Namespace".to_string(),
                key: String::new(),
                field: "metadata.name",
            })?;
        debug!(namespace = %name, "store.update_namespace");
        Api::<Namespace>::all(self.client.clone())
            .replace(&name, &PostParams::default(), namespace)
            .await
            .map_err(|e| map_error::<Namespace>(e, &name))
    }
}
