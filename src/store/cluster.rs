//! Kubernetes Resource Store
//!
//! Backs the [`ResourceStore`] port with the cluster API. Conflicts and
//! missing objects reported by the API server are mapped onto the agent's
//! own error variants so retry logic never has to look at HTTP codes.

use crate::domain::ports::{ListFilter, ResourceStore};
use crate::error::{Error, Result};
use async_trait::async_trait;
use kube::api::{ListParams, PostParams};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use tracing::debug;

/// Cluster-scoped resource store over `Api<K>`
pub struct KubeStore<K>
where
    K: Resource,
{
    api: Api<K>,
    kind: String,
}

impl<K> KubeStore<K>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug + Send + Sync + 'static,
    K::DynamicType: Default,
{
    /// Create a store for all objects of kind `K`
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
            kind: K::kind(&K::DynamicType::default()).to_string(),
        }
    }

    fn map_err(&self, err: kube::Error, name: &str) -> Error {
        match &err {
            kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
                Error::ResourceExists {
                    kind: self.kind.clone(),
                    name: name.to_string(),
                }
            }
            kube::Error::Api(resp) if resp.code == 409 => Error::Conflict {
                kind: self.kind.clone(),
                name: name.to_string(),
            },
            kube::Error::Api(resp) if resp.code == 404 => Error::ResourceNotFound {
                kind: self.kind.clone(),
                name: name.to_string(),
            },
            _ => Error::Kube(err),
        }
    }

    fn object_name(&self, object: &K) -> Result<String> {
        object
            .meta()
            .name
            .clone()
            .ok_or_else(|| Error::Internal(format!("{} without a name", self.kind)))
    }
}

#[async_trait]
impl<K> ResourceStore<K> for KubeStore<K>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug + Send + Sync + 'static,
    K::DynamicType: Default,
{
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn get(&self, name: &str) -> Result<K> {
        self.api.get(name).await.map_err(|e| self.map_err(e, name))
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<K>> {
        let mut params = ListParams::default();
        if !filter.labels.is_empty() {
            params = params.labels(&filter.to_selector());
        }
        let list = self
            .api
            .list(&params)
            .await
            .map_err(|e| self.map_err(e, ""))?;
        Ok(list.items)
    }

    async fn create(&self, object: &K) -> Result<K> {
        let name = self.object_name(object)?;
        debug!(kind = %self.kind, name = %name, "creating resource");
        let created = self
            .api
            .create(&PostParams::default(), object)
            .await
            .map_err(|e| self.map_err(e, &name))?;

        // Status is a subresource; create ignores it.
        let mut with_status = object.clone();
        with_status.meta_mut().resource_version = created.meta().resource_version.clone();
        self.api
            .replace_status(&name, &PostParams::default(), serde_json::to_vec(&with_status)?)
            .await
            .map_err(|e| self.map_err(e, &name))
    }

    async fn update(&self, object: &K) -> Result<K> {
        let name = self.object_name(object)?;
        let status_written = self
            .api
            .replace_status(&name, &PostParams::default(), serde_json::to_vec(object)?)
            .await
            .map_err(|e| self.map_err(e, &name))?;

        let mut with_meta = object.clone();
        with_meta.meta_mut().resource_version = status_written.meta().resource_version.clone();
        self.api
            .replace(&name, &PostParams::default(), &with_meta)
            .await
            .map_err(|e| self.map_err(e, &name))
    }
}
