use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::ObjectMeta;
use summon_common::config::PlatformConfig;
use summon_common::crd::SummonPlatform;
use summon_engine::{copy_desired, Component, ReconcileResult};

use super::{child_name, secret_data, Ctx, Outcome};

/// Agent config for instances reporting to New Relic
pub struct NewRelic {
    config: Arc<PlatformConfig>,
}

impl NewRelic {
    /// Agent config carrying the operator's license key
    pub fn new(config: Arc<PlatformConfig>) -> Self {
        Self { config }
    }
}

fn newrelic_ini(license_key: &str, app_name: &str) -> String {
    format!(
        "[newrelic]\n\
         license_key = {license_key}\n\
         app_name = {app_name}\n\
         monitor_mode = true\n\
         log_level = info\n\
         ssl = true\n\
         high_security = false\n\
         transaction_tracer.enabled = true\n\
         transaction_tracer.record_sql = obfuscated\n\
         error_collector.enabled = true\n\
         browser_monitoring.auto_instrument = false\n"
    )
}

#[async_trait]
impl Component<SummonPlatform> for NewRelic {
    fn name(&self) -> &'static str {
        "new-relic"
    }

    fn is_reconcilable(&self, ctx: &Ctx) -> bool {
        ctx.top.spec.enable_new_relic == Some(true)
    }

    async fn reconcile(&self, ctx: &mut Ctx) -> Outcome {
        let app_name = child_name(&ctx.top, '-', "summon-platform");
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(child_name(&ctx.top, '.', "newrelic")),
                namespace: Some(ctx.namespace()),
                ..Default::default()
            },
            data: Some(secret_data([(
                "newrelic.ini",
                newrelic_ini(&self.config.new_relic_license_key, &app_name),
            )])),
            ..Default::default()
        };
        ctx.converge(secret, copy_desired).await?;
        Ok(ReconcileResult::done())
    }
}
