//! Cluster access capability
//!
//! Every cluster read and write made by components goes through
//! [`ClusterClient`], which works on untyped objects so one trait object can
//! serve every kind. Typed helpers convert at the edges.

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::core::{ApiResource, DynamicObject};
use kube::{Client, Resource};
#[cfg(test)]
use mockall::automock;
use serde::de::DeserializeOwned;
use serde::Serialize;

use summon_common::{Error, Result};

/// CRUD over cluster objects of any kind.
///
/// An empty `namespace` addresses cluster-scoped kinds, or every namespace
/// when listing. An empty `label_selector` matches everything.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch one object; `Ok(None)` when it does not exist
    async fn get(
        &self,
        ar: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>>;

    /// List objects
    async fn list(
        &self,
        ar: &ApiResource,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>>;

    /// Create an object; fails with 409 when it already exists
    async fn create(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Replace an object; fails with 409 on a stale resource version
    async fn replace(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Replace only the status subresource
    async fn replace_status(&self, ar: &ApiResource, obj: &DynamicObject)
        -> Result<DynamicObject>;

    /// Delete an object; deleting something already gone succeeds
    async fn delete(&self, ar: &ApiResource, namespace: &str, name: &str) -> Result<()>;
}

/// [`ClusterClient`] backed by the API server
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, ar: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        if namespace.is_empty() {
            Api::all_with(self.client.clone(), ar)
        } else {
            Api::namespaced_with(self.client.clone(), namespace, ar)
        }
    }
}

fn object_name(obj: &DynamicObject) -> Result<&str> {
    obj.metadata
        .name
        .as_deref()
        .ok_or_else(|| Error::internal_with_context("client", "object has no name"))
}

fn object_namespace(obj: &DynamicObject) -> &str {
    obj.metadata.namespace.as_deref().unwrap_or_default()
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get(
        &self,
        ar: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        Ok(self.api(ar, namespace).get_opt(name).await?)
    }

    async fn list(
        &self,
        ar: &ApiResource,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>> {
        let mut lp = ListParams::default();
        if !label_selector.is_empty() {
            lp = lp.labels(label_selector);
        }
        Ok(self.api(ar, namespace).list(&lp).await?.items)
    }

    async fn create(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
        let api = self.api(ar, object_namespace(obj));
        Ok(api.create(&PostParams::default(), obj).await?)
    }

    async fn replace(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
        let api = self.api(ar, object_namespace(obj));
        Ok(api
            .replace(object_name(obj)?, &PostParams::default(), obj)
            .await?)
    }

    async fn replace_status(
        &self,
        ar: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        let api = self.api(ar, object_namespace(obj));
        let body = serde_json::to_vec(obj)?;
        Ok(api
            .replace_status(object_name(obj)?, &PostParams::default(), body)
            .await?)
    }

    async fn delete(&self, ar: &ApiResource, namespace: &str, name: &str) -> Result<()> {
        match self
            .api(ar, namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// API coordinates for a typed kind
pub fn api_resource<K: Resource<DynamicType = ()>>() -> ApiResource {
    ApiResource::erase::<K>(&())
}

/// Typed object to untyped, filling in apiVersion/kind
pub fn to_dynamic<K>(obj: &K) -> Result<DynamicObject>
where
    K: Resource<DynamicType = ()> + Serialize,
{
    let mut value = serde_json::to_value(obj)?;
    if let Some(map) = value.as_object_mut() {
        map.insert(
            "apiVersion".to_string(),
            serde_json::Value::String(K::api_version(&()).to_string()),
        );
        map.insert(
            "kind".to_string(),
            serde_json::Value::String(K::kind(&()).to_string()),
        );
    }
    serde_json::from_value(value)
        .map_err(|e| Error::serialization_for_kind(K::kind(&()).to_string(), e.to_string()))
}

/// Untyped object to typed
pub fn from_dynamic<K>(obj: DynamicObject) -> Result<K>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    let value = serde_json::to_value(obj)?;
    serde_json::from_value(value)
        .map_err(|e| Error::serialization_for_kind(K::kind(&()).to_string(), e.to_string()))
}
