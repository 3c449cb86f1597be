//! RidecellIngress: an Ingress whose short hostnames are qualified from labels

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::ObjectMeta;
use kube::core::ApiResource;
use summon_common::crd::{ChildPhase, RidecellIngress};
use summon_common::{Error, Result, CLOUD_LABEL, ENVIRONMENT_LABEL, REGION_LABEL};
use summon_engine::{
    api_resource, copy_desired, ClusterClient, Component, ComponentContext, Engine, ReconcileResult,
};

/// Annotation recording the hostnames after expansion
pub const EXPANDED_HOSTS_ANNOTATION: &str = "ridecell.io/expanded-hosts";

const BASE_DOMAIN: &str = "ridecell.io";

/// Qualify `host` when it has no dot.
///
/// `web` with environment `dev`, region `us-west-2` and no cloud becomes
/// `web.dev.us-west-2.ridecell.io`.
pub fn expand_host(host: &str, labels: &BTreeMap<String, String>) -> Result<String> {
    if host.contains('.') {
        return Ok(host.to_string());
    }
    let label = |key: &str| {
        labels
            .get(key)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::validation(format!("label {key} is required to expand host {host}")))
    };
    let mut parts = vec![host, label(ENVIRONMENT_LABEL)?.as_str(), label(REGION_LABEL)?.as_str()];
    if let Some(cloud) = labels.get(CLOUD_LABEL).filter(|c| !c.is_empty()) {
        parts.push(cloud.as_str());
    }
    parts.push(BASE_DOMAIN);
    Ok(parts.join("."))
}

/// The child Ingress with every host expanded
pub fn desired_ingress(top: &RidecellIngress) -> Result<Ingress> {
    let labels = top.metadata.labels.clone().unwrap_or_default();
    let mut spec = top.spec.to_ingress_spec();
    let mut hosts = Vec::new();
    for rule in spec.rules.iter_mut().flatten() {
        if let Some(host) = &rule.host {
            let expanded = expand_host(host, &labels)?;
            hosts.push(expanded.clone());
            rule.host = Some(expanded);
        }
    }
    for tls in spec.tls.iter_mut().flatten() {
        for host in tls.hosts.iter_mut().flatten() {
            *host = expand_host(host, &labels)?;
        }
    }

    let mut annotations = top.metadata.annotations.clone().unwrap_or_default();
    annotations.remove("kubectl.kubernetes.io/last-applied-configuration");
    annotations.insert(EXPANDED_HOSTS_ANNOTATION.to_string(), hosts.join(","));

    Ok(Ingress {
        metadata: ObjectMeta {
            name: top.metadata.name.clone(),
            namespace: top.metadata.namespace.clone(),
            labels: top.metadata.labels.clone(),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(spec),
        ..Default::default()
    })
}

/// Converges the expanded Ingress
pub struct ExpandIngress;

#[async_trait]
impl Component<RidecellIngress> for ExpandIngress {
    fn name(&self) -> &'static str {
        "ingress"
    }

    fn watch_types(&self) -> Vec<ApiResource> {
        vec![api_resource::<Ingress>()]
    }

    fn is_reconcilable(&self, _ctx: &ComponentContext<RidecellIngress>) -> bool {
        true
    }

    async fn reconcile(
        &self,
        ctx: &mut ComponentContext<RidecellIngress>,
    ) -> Result<ReconcileResult<RidecellIngress>> {
        let ingress = desired_ingress(&ctx.top)
            .map_err(|e| Error::validation_for(ctx.name(), e.to_string()))?;
        ctx.converge(ingress, copy_desired).await?;
        Ok(ReconcileResult::modify(|top: &mut RidecellIngress| {
            let status = top.status.get_or_insert_with(Default::default);
            status.status = ChildPhase::Ready;
            status.message = String::new();
            Ok(())
        }))
    }
}

/// RidecellIngress engine
pub fn engine(client: Arc<dyn ClusterClient>) -> Engine<RidecellIngress> {
    Engine::builder("ridecellingress", client)
        .component(ExpandIngress)
        .build()
}
