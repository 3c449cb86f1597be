//! Non-secret settings document, `<name>-config`

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ObjectMeta;
use kube::core::ApiResource;
use summon_common::crd::{ConfigValue, SummonPlatform};
use summon_common::Result;
use summon_engine::{api_resource, copy_desired, Component, ReconcileResult};

use super::cloud::{miv_bucket_name, static_bucket_name};
use super::{child_name, Ctx, Outcome};

/// Key of the settings document inside `<name>-config`
pub const CONFIG_KEY: &str = "summon-platform.yml";

/// Settings derived from the instance itself; `spec.config` overrides them
pub(crate) fn derived_config(top: &SummonPlatform) -> BTreeMap<String, ConfigValue> {
    let spec = &top.spec;
    let name = top.metadata.name.clone().unwrap_or_default();
    let mut out = BTreeMap::new();
    let mut set = |k: &str, v: ConfigValue| {
        out.insert(k.to_string(), v);
    };
    set("WEBAPP_URL", ConfigValue::String(format!("https://{}", spec.hostname)));
    set("ALLOWED_HOSTS", ConfigValue::String(hosts(top).join(",")));
    set("PLATFORM_ENV", ConfigValue::String(spec.environment.to_uppercase()));
    set("SENTRY_ENVIRONMENT", ConfigValue::String(spec.environment.clone()));
    set("AWS_REGION", ConfigValue::String(spec.aws_region.clone()));
    set("AWS_STORAGE_BUCKET_NAME", ConfigValue::String(static_bucket_name(top)));
    set("MIV_BUCKET", ConfigValue::String(miv_bucket_name(top)));
    set("SQS_REGION", ConfigValue::String(spec.sqs_region.clone()));
    set("SQS_QUEUE_NAME", ConfigValue::String(spec.sqs_queue.clone()));
    set("REDIS_URL", ConfigValue::String(format!("redis://{}-redis/2", name)));
    set("CHANNELS_REDIS_URL", ConfigValue::String(format!("redis://{}-redis/1", name)));
    set(
        "STATIC_URL",
        ConfigValue::String(format!("https://{}/static/", spec.hostname)),
    );
    if !spec.dispatch.version.is_empty() {
        set("DISPATCH_URL", ConfigValue::String(format!("http://{}-dispatch:8000", name)));
    }
    if !spec.hw_aux.version.is_empty() {
        set("HWAUX_URL", ConfigValue::String(format!("http://{}-hwaux:8000", name)));
    }
    if !spec.gcp_project.is_empty() {
        set("GCP_PROJECT", ConfigValue::String(spec.gcp_project.clone()));
    }
    out
}

/// Every public hostname: primary first, then aliases
pub(crate) fn hosts(top: &SummonPlatform) -> Vec<String> {
    let mut hosts = vec![top.spec.hostname.clone()];
    for alias in &top.spec.aliases {
        if !hosts.contains(alias) {
            hosts.push(alias.clone());
        }
    }
    hosts
}

/// The rendered settings document
pub(crate) fn config_document(top: &SummonPlatform) -> Result<String> {
    let mut config = derived_config(top);
    for (k, v) in &top.spec.config {
        config.insert(k.clone(), v.clone());
    }
    Ok(serde_yaml::to_string(&config)?)
}

/// Renders `<name>-config`
pub struct ConfigMapComponent;

#[async_trait]
impl Component<SummonPlatform> for ConfigMapComponent {
    fn name(&self) -> &'static str {
        "config-map"
    }

    fn watch_types(&self) -> Vec<ApiResource> {
        vec![api_resource::<ConfigMap>()]
    }

    fn is_reconcilable(&self, _ctx: &Ctx) -> bool {
        true
    }

    async fn reconcile(&self, ctx: &mut Ctx) -> Outcome {
        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some(child_name(&ctx.top, '-', "config")),
                namespace: Some(ctx.namespace()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                CONFIG_KEY.to_string(),
                config_document(&ctx.top)?,
            )])),
            ..Default::default()
        };
        ctx.converge(config_map, copy_desired).await?;
        Ok(ReconcileResult::done())
    }
}
