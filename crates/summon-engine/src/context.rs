//! Per-reconcile context threaded through every component call

use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;

use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use summon_common::clock::SharedClock;
use summon_common::template::{Extras, TemplateRenderer};
use summon_common::{Error, Result};

use crate::client::{api_resource, from_dynamic, to_dynamic, ClusterClient};
use crate::top::TopObject;

/// Bounds every child kind handled through the context satisfies
pub trait ChildObject:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<K> ChildObject for K where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Result of a create-or-update
#[derive(Clone, Debug)]
pub struct Converged<K> {
    /// Object as stored after the call
    pub object: K,
    /// The object did not exist before
    pub created: bool,
    /// An existing object was written
    pub updated: bool,
}

/// Everything a component may touch during one tick.
///
/// `top` is the live copy of the object being reconciled. The engine applies
/// status modifiers to it as components return; components read it but do
/// not write its status directly.
pub struct ComponentContext<T: TopObject> {
    /// The object being reconciled
    pub top: T,
    client: Arc<dyn ClusterClient>,
    renderer: Arc<TemplateRenderer>,
    clock: SharedClock,
    cancel: CancellationToken,
    enable_finalizers: bool,
}

impl<T: TopObject> ComponentContext<T> {
    /// Context for one tick over `top`
    pub fn new(
        top: T,
        client: Arc<dyn ClusterClient>,
        renderer: Arc<TemplateRenderer>,
        clock: SharedClock,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            top,
            client,
            renderer,
            clock,
            cancel,
            enable_finalizers: false,
        }
    }

    /// Turn finalizer management on or off
    pub fn with_finalizers(mut self, enabled: bool) -> Self {
        self.enable_finalizers = enabled;
        self
    }

    /// Name of the top object
    pub fn name(&self) -> String {
        self.top.name_any()
    }

    /// Namespace of the top object; empty when cluster-scoped
    pub fn namespace(&self) -> String {
        self.top.namespace().unwrap_or_default()
    }

    /// Raw cluster access
    pub fn client(&self) -> &Arc<dyn ClusterClient> {
        &self.client
    }

    /// Current time
    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    /// Run `fut` unless the tick is cancelled first
    pub async fn guard<R>(&self, fut: impl Future<Output = Result<R>>) -> Result<R> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::internal_with_context("engine", "reconcile cancelled")),
            r = fut => r,
        }
    }

    /// Fetch a child in the top's namespace
    pub async fn get<K: ChildObject>(&self, name: &str) -> Result<Option<K>> {
        let ns = self.namespace();
        self.get_in(&ns, name).await
    }

    /// Fetch an object anywhere
    pub async fn get_in<K: ChildObject>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let ar = api_resource::<K>();
        match self.guard(self.client.get(&ar, namespace, name)).await? {
            Some(obj) => Ok(Some(from_dynamic(obj)?)),
            None => Ok(None),
        }
    }

    /// List objects anywhere; empty namespace lists across namespaces
    pub async fn list_in<K: ChildObject>(&self, namespace: &str, label_selector: &str) -> Result<Vec<K>> {
        let ar = api_resource::<K>();
        self.guard(self.client.list(&ar, namespace, label_selector))
            .await?
            .into_iter()
            .map(from_dynamic)
            .collect()
    }

    /// Create an object
    pub async fn create<K: ChildObject>(&self, obj: &K) -> Result<K> {
        let ar = api_resource::<K>();
        let created = self.guard(self.client.create(&ar, &to_dynamic(obj)?)).await?;
        from_dynamic(created)
    }

    /// Replace an object
    pub async fn update<K: ChildObject>(&self, obj: &K) -> Result<K> {
        let ar = api_resource::<K>();
        let updated = self.guard(self.client.replace(&ar, &to_dynamic(obj)?)).await?;
        from_dynamic(updated)
    }

    /// Delete a child in the top's namespace; absent is fine
    pub async fn delete<K: ChildObject>(&self, name: &str) -> Result<()> {
        let ar = api_resource::<K>();
        let ns = self.namespace();
        self.guard(self.client.delete(&ar, &ns, name)).await
    }

    /// Render a bundled template against the top (`GetTemplate`)
    pub fn render<K: DeserializeOwned>(&self, id: &str, extras: Option<&Extras>) -> Result<K> {
        self.renderer.render(id, &self.top, extras)
    }

    /// Render `id` and converge the result (`CreateOrUpdate`)
    pub async fn create_or_update<K, F>(
        &self,
        id: &str,
        extras: Option<&Extras>,
        mutator: F,
    ) -> Result<Converged<K>>
    where
        K: ChildObject,
        F: Fn(&K, &mut K) -> Result<()> + Send + Sync,
    {
        let desired: K = self.render(id, extras)?;
        self.converge(desired, mutator).await
    }

    /// Converge an already-built desired object.
    ///
    /// The desired object is bound to the top (namespace and controller
    /// owner reference). When absent it is created from a copy of the desired
    /// object passed through `mutator`; when present `mutator` copies the
    /// mutable fields onto the existing object, which is written only if
    /// that changed it. A create that races with another writer is retried
    /// once as an update.
    pub async fn converge<K, F>(&self, mut desired: K, mutator: F) -> Result<Converged<K>>
    where
        K: ChildObject,
        F: Fn(&K, &mut K) -> Result<()> + Send + Sync,
    {
        self.bind(&mut desired)?;
        let ns = desired.namespace().unwrap_or_default();
        let name = desired.name_any();

        if let Some(existing) = self.get_in::<K>(&ns, &name).await? {
            return self.update_existing(&desired, existing, &mutator).await;
        }

        let mut fresh = desired.clone();
        mutator(&desired, &mut fresh)?;
        fresh.meta_mut().owner_references = desired.meta().owner_references.clone();
        match self.create(&fresh).await {
            Ok(object) => {
                debug!(kind = %K::kind(&()), name = %name, "created child");
                Ok(Converged {
                    object,
                    created: true,
                    updated: false,
                })
            }
            Err(e) if e.is_conflict() => {
                let existing = self.get_in::<K>(&ns, &name).await?.ok_or_else(|| {
                    Error::internal_with_context(
                        "create-or-update",
                        format!("{} {} vanished after create conflict", K::kind(&()), name),
                    )
                })?;
                self.update_existing(&desired, existing, &mutator).await
            }
            Err(e) => Err(e),
        }
    }

    async fn update_existing<K, F>(&self, desired: &K, mut existing: K, mutator: &F) -> Result<Converged<K>>
    where
        K: ChildObject,
        F: Fn(&K, &mut K) -> Result<()> + Send + Sync,
    {
        let before = serde_json::to_value(&existing)?;
        mutator(desired, &mut existing)?;
        if let Some(owner) = self.top.controller_owner_ref(&()) {
            set_controller_ref(existing.meta_mut(), owner);
        }
        if serde_json::to_value(&existing)? == before {
            return Ok(Converged {
                object: existing,
                created: false,
                updated: false,
            });
        }
        let object = self.update(&existing).await?;
        debug!(kind = %K::kind(&()), name = %existing.name_any(), "updated child");
        Ok(Converged {
            object,
            created: false,
            updated: true,
        })
    }

    fn bind<K: ChildObject>(&self, desired: &mut K) -> Result<()> {
        if desired.meta().name.as_deref().unwrap_or_default().is_empty() {
            return Err(Error::internal_with_context(
                "create-or-update",
                format!("desired {} has no name", K::kind(&())),
            ));
        }
        let ns = self.namespace();
        if desired.meta().namespace.is_none() && !ns.is_empty() {
            desired.meta_mut().namespace = Some(ns);
        }
        if let Some(owner) = self.top.controller_owner_ref(&()) {
            set_controller_ref(desired.meta_mut(), owner);
        }
        Ok(())
    }

    /// Add `finalizer` to the top when finalizers are enabled.
    /// Returns whether the top now carries it.
    pub async fn ensure_finalizer(&mut self, finalizer: &str) -> Result<bool> {
        if !self.enable_finalizers {
            return Ok(false);
        }
        if self.top.finalizers().iter().any(|f| f == finalizer) {
            return Ok(true);
        }
        let mut top = self.top.clone();
        top.finalizers_mut().push(finalizer.to_string());
        self.write_top_metadata(top).await?;
        Ok(true)
    }

    /// Drop `finalizer` from the top if present
    pub async fn remove_finalizer(&mut self, finalizer: &str) -> Result<()> {
        if !self.top.finalizers().iter().any(|f| f == finalizer) {
            return Ok(());
        }
        let mut top = self.top.clone();
        top.finalizers_mut().retain(|f| f != finalizer);
        self.write_top_metadata(top).await
    }

    async fn write_top_metadata(&mut self, top: T) -> Result<()> {
        let ar = api_resource::<T>();
        let stored = self.guard(self.client.replace(&ar, &to_dynamic(&top)?)).await?;
        self.top.meta_mut().finalizers = top.meta().finalizers.clone();
        self.top.meta_mut().resource_version = stored.metadata.resource_version;
        Ok(())
    }

    /// The top is being deleted
    pub fn is_deleting(&self) -> bool {
        self.top.meta().deletion_timestamp.is_some()
    }
}

fn set_controller_ref(
    meta: &mut kube::api::ObjectMeta,
    owner: k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference,
) {
    let refs = meta.owner_references.get_or_insert_with(Vec::new);
    refs.retain(|r| r.controller != Some(true) && r.uid != owner.uid);
    refs.push(owner);
}

/// Default mutator: copy everything except `metadata` and `status` from the
/// desired object, and merge its labels and annotations.
pub fn copy_desired<K: Serialize + DeserializeOwned>(desired: &K, existing: &mut K) -> Result<()> {
    let desired = serde_json::to_value(desired)?;
    let mut current = serde_json::to_value(&*existing)?;
    if let (Some(want), Some(have)) = (desired.as_object(), current.as_object_mut()) {
        for (key, value) in want {
            match key.as_str() {
                "status" | "apiVersion" | "kind" => {}
                "metadata" => merge_metadata(value, have),
                _ => {
                    have.insert(key.clone(), value.clone());
                }
            }
        }
    }
    *existing = serde_json::from_value(current)?;
    Ok(())
}

fn merge_metadata(
    desired: &serde_json::Value,
    have: &mut serde_json::Map<String, serde_json::Value>,
) {
    let meta = have
        .entry("metadata")
        .or_insert_with(|| serde_json::Value::Object(Default::default()));
    let Some(meta) = meta.as_object_mut() else {
        return;
    };
    for field in ["labels", "annotations"] {
        let Some(want) = desired.get(field).and_then(|v| v.as_object()) else {
            continue;
        };
        let target = meta
            .entry(field)
            .or_insert_with(|| serde_json::Value::Object(Default::default()));
        if let Some(target) = target.as_object_mut() {
            for (k, v) in want {
                target.insert(k.clone(), v.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ConfigMap, Service, ServicePort, ServiceSpec};
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn meta(name: &str, labels: &[(&str, &str)]) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.into()),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn copy_desired_overwrites_body_and_merges_labels() {
        let desired = ConfigMap {
            metadata: meta("c", &[("app", "summon")]),
            data: Some(BTreeMap::from([("k".to_string(), "new".to_string())])),
            ..Default::default()
        };
        let mut existing = ConfigMap {
            metadata: ObjectMeta {
                resource_version: Some("7".into()),
                ..meta("c", &[("team", "ops")])
            },
            data: Some(BTreeMap::from([("k".to_string(), "old".to_string())])),
            ..Default::default()
        };
        copy_desired(&desired, &mut existing).unwrap();
        assert_eq!(existing.data.as_ref().unwrap()["k"], "new");
        let labels = existing.metadata.labels.as_ref().unwrap();
        assert_eq!(labels["app"], "summon");
        assert_eq!(labels["team"], "ops");
        assert_eq!(existing.metadata.resource_version.as_deref(), Some("7"));
    }

    #[test]
    fn copy_desired_then_restore_keeps_identity_fields() {
        let desired = Service {
            metadata: meta("s", &[]),
            spec: Some(ServiceSpec {
                ports: Some(vec![ServicePort {
                    port: 8000,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let mut existing = Service {
            metadata: meta("s", &[]),
            spec: Some(ServiceSpec {
                cluster_ip: Some("10.0.0.7".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let ip = existing.spec.as_ref().and_then(|s| s.cluster_ip.clone());
        copy_desired(&desired, &mut existing).unwrap();
        if let Some(spec) = existing.spec.as_mut() {
            spec.cluster_ip = ip;
        }
        let spec = existing.spec.unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("10.0.0.7"));
        assert_eq!(spec.ports.unwrap()[0].port, 8000);
    }
}
