//! Workload deployments and statefulsets, one per role
//!
//! Every app pod template carries the hashes of the config map and the app
//! secrets so a change to either rolls the pods.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::core::ApiResource;
use serde_json::json;
use summon_common::config::PlatformConfig;
use summon_common::crd::SummonPlatform;
use summon_common::hash::sorted_map_hash;
use summon_common::template::Extras;
use summon_common::{extras, Error, Result};
use summon_engine::{api_resource, copy_desired, Component, ReconcileResult};
use tracing::debug;

use super::{child_name, postgres_ready, pull_secret_ready, secret_strings, Ctx, Outcome};
use crate::templates;

/// Pod template annotation holding the config map hash
pub const CONFIG_HASH_ANNOTATION: &str = "summon.ridecell.io/configHash";

/// Pod template annotation holding the app secrets hash
pub const APP_SECRETS_HASH_ANNOTATION: &str = "summon.ridecell.io/appSecretsHash";

/// Image of the main application at `version`
pub(crate) fn summon_image(config: &PlatformConfig, version: &str) -> String {
    format!("{}:{}", config.image_repository, version)
}

fn satellite_image(config: &PlatformConfig, repository: &str, version: &str) -> String {
    let prefix = config
        .image_repository
        .rsplit_once('/')
        .map(|(prefix, _)| prefix)
        .unwrap_or(config.image_repository.as_str());
    format!("{prefix}/{repository}:{version}")
}

/// A workload role of the platform
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    /// Django web frontend
    Web,
    /// Websocket frontend
    Daphne,
    /// Celery workers
    Celeryd,
    /// Channels workers
    ChannelWorker,
    /// Static asset server
    Static,
    /// Celery scheduler; a single-replica statefulset
    CeleryBeat,
    /// Channels and cache redis
    Redis,
    /// Dispatch satellite
    Dispatch,
    /// Business portal satellite
    BusinessPortal,
    /// Trip share satellite
    TripShare,
    /// Hardware aux satellite
    HwAux,
    /// Kafka consumer on the main image
    KafkaConsumer,
}

impl Role {
    /// Every role, in rollout order
    pub const ALL: [Role; 12] = [
        Role::Web,
        Role::Daphne,
        Role::Celeryd,
        Role::ChannelWorker,
        Role::Static,
        Role::CeleryBeat,
        Role::Redis,
        Role::Dispatch,
        Role::BusinessPortal,
        Role::TripShare,
        Role::HwAux,
        Role::KafkaConsumer,
    ];

    /// Name suffix and `app.kubernetes.io/name` label
    pub fn name(self) -> &'static str {
        match self {
            Role::Web => "web",
            Role::Daphne => "daphne",
            Role::Celeryd => "celeryd",
            Role::ChannelWorker => "channelworker",
            Role::Static => "static",
            Role::CeleryBeat => "celerybeat",
            Role::Redis => "redis",
            Role::Dispatch => "dispatch",
            Role::BusinessPortal => "businessportal",
            Role::TripShare => "tripshare",
            Role::HwAux => "hwaux",
            Role::KafkaConsumer => "kafkaconsumer",
        }
    }

    /// Object name for this role on `top`
    pub fn object_name(self, top: &SummonPlatform) -> String {
        child_name(top, '-', self.name())
    }

    /// Serving port, if the role serves HTTP or another protocol
    pub fn port(self) -> Option<i32> {
        match self {
            Role::Web | Role::Static => Some(8000),
            Role::Daphne => Some(9000),
            Role::Redis => Some(6379),
            Role::Dispatch | Role::BusinessPortal | Role::TripShare | Role::HwAux => Some(8000),
            Role::Celeryd | Role::ChannelWorker | Role::CeleryBeat | Role::KafkaConsumer => None,
        }
    }

    /// Runs as a StatefulSet rather than a Deployment
    pub fn is_stateful(self) -> bool {
        self == Role::CeleryBeat
    }

    fn satellite(self) -> Option<&'static str> {
        match self {
            Role::Dispatch => Some("dispatch"),
            Role::BusinessPortal => Some("business-portal"),
            Role::TripShare => Some("trip-share"),
            Role::HwAux => Some("hw-aux"),
            _ => None,
        }
    }

    fn satellite_version(self, top: &SummonPlatform) -> &str {
        let spec = &top.spec;
        match self {
            Role::Dispatch => &spec.dispatch.version,
            Role::BusinessPortal => &spec.business_portal.version,
            Role::TripShare => &spec.trip_share.version,
            Role::HwAux => &spec.hw_aux.version,
            _ => "",
        }
    }

    /// Mounts the config map and app secrets
    fn mounts_app(self) -> bool {
        self != Role::Redis && self.satellite().is_none()
    }

    fn command(self) -> Vec<&'static str> {
        match self {
            Role::Web => vec![
                "python", "-m", "twisted", "--log-format", "text", "web", "--listen", "tcp:8000",
                "--wsgi", "summon_platform.wsgi.application",
            ],
            Role::Daphne => vec![
                "daphne", "-b", "0.0.0.0", "-p", "9000", "summon_platform.asgi:channel_layer",
            ],
            Role::Celeryd => vec!["celery", "-A", "summon_platform", "worker", "-l", "info"],
            Role::ChannelWorker => vec!["python", "manage.py", "runworker", "-v2"],
            Role::Static => vec![
                "python", "-m", "twisted", "--log-format", "text", "web", "--listen", "tcp:8000",
                "--path", "/static",
            ],
            Role::CeleryBeat => vec![
                "celery", "-A", "summon_platform", "beat", "-l", "info",
                "--schedule", "/schedule/beat", "--pidfile=",
            ],
            Role::KafkaConsumer => vec!["python", "manage.py", "run_kafka_consumer"],
            Role::Redis | Role::Dispatch | Role::BusinessPortal | Role::TripShare | Role::HwAux => {
                Vec::new()
            }
        }
    }

    fn resources(self) -> serde_json::Value {
        let (cpu, memory) = match self {
            Role::Web | Role::Celeryd => ("500m", "1G"),
            Role::Redis => ("100m", "200M"),
            Role::CeleryBeat => ("100m", "500M"),
            _ => ("200m", "500M"),
        };
        json!({
            "requests": {"cpu": cpu, "memory": memory},
            "limits": {"memory": memory},
        })
    }

    /// Declared replica count
    pub fn replicas(self, top: &SummonPlatform) -> i32 {
        let r = &top.spec.replicas;
        let declared = match self {
            Role::Web => r.web,
            Role::Daphne => r.daphne,
            Role::Celeryd => r.celeryd,
            Role::ChannelWorker => r.channel_worker,
            Role::Static => r.static_,
            Role::CeleryBeat => r.celery_beat,
            Role::Redis => Some(1),
            Role::Dispatch => r.dispatch,
            Role::BusinessPortal => r.business_portal,
            Role::TripShare => r.trip_share,
            Role::HwAux => r.hw_aux,
            Role::KafkaConsumer => r.kafka_consumer,
        };
        declared.unwrap_or(1)
    }

    /// Whether `top` runs this role at all
    pub fn enabled(self, top: &SummonPlatform) -> bool {
        match self {
            Role::Dispatch | Role::BusinessPortal | Role::TripShare | Role::HwAux => {
                !self.satellite_version(top).is_empty()
            }
            Role::KafkaConsumer => top.spec.replicas.kafka_consumer.unwrap_or(0) > 0,
            _ => true,
        }
    }

    fn image(self, config: &PlatformConfig, top: &SummonPlatform) -> String {
        match (self, self.satellite()) {
            (Role::Redis, _) => "redis:5.0.5".to_string(),
            (_, Some(repository)) => satellite_image(config, repository, self.satellite_version(top)),
            _ => summon_image(config, &top.spec.version),
        }
    }

    /// Replica count is owned by an autoscaler
    pub fn autoscaled(self, top: &SummonPlatform) -> bool {
        self == Role::Celeryd && top.spec.autoscaling.celeryd.is_some()
    }

    fn extras(self, config: &PlatformConfig, top: &SummonPlatform, hashes: &BTreeMap<String, String>) -> Extras {
        let annotations = if self.mounts_app() { hashes.clone() } else { BTreeMap::new() };
        extras! {
            "role" => self.name(),
            "replicas" => self.replicas(top),
            "image" => self.image(config, top),
            "command" => self.command(),
            "port" => self.port(),
            "mount_app" => self.mounts_app(),
            "resources" => self.resources(),
            "annotations" => annotations,
        }
    }
}

async fn input_hashes(ctx: &Ctx) -> Result<BTreeMap<String, String>> {
    let config_name = child_name(&ctx.top, '-', "config");
    let config = ctx
        .get::<ConfigMap>(&config_name)
        .await?
        .ok_or_else(|| Error::missing_input("ConfigMap", config_name.as_str(), false))?;
    let secrets_name = child_name(&ctx.top, '.', "app-secrets");
    let secrets = ctx
        .get::<Secret>(&secrets_name)
        .await?
        .ok_or_else(|| Error::missing_input("Secret", secrets_name.as_str(), false))?;

    Ok(BTreeMap::from([
        (
            CONFIG_HASH_ANNOTATION.to_string(),
            sorted_map_hash(&config.data.unwrap_or_default())?,
        ),
        (
            APP_SECRETS_HASH_ANNOTATION.to_string(),
            sorted_map_hash(&secret_strings(&secrets))?,
        ),
    ]))
}

/// Deployments and statefulsets for every enabled role
pub struct Workloads {
    config: Arc<PlatformConfig>,
}

impl Workloads {
    /// Workloads pulling from the configured image repository
    pub fn new(config: Arc<PlatformConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Component<SummonPlatform> for Workloads {
    fn name(&self) -> &'static str {
        "workloads"
    }

    fn watch_types(&self) -> Vec<ApiResource> {
        vec![api_resource::<Deployment>(), api_resource::<StatefulSet>()]
    }

    fn is_reconcilable(&self, ctx: &Ctx) -> bool {
        pull_secret_ready(&ctx.top) && postgres_ready(&ctx.top) && ctx.top.phase().allows_workloads()
    }

    async fn reconcile(&self, ctx: &mut Ctx) -> Outcome {
        // a version bump earlier in this tick moves the phase back to migrating
        if !ctx.top.phase().allows_workloads() {
            return Ok(ReconcileResult::done());
        }
        let hashes = input_hashes(ctx).await?;
        for role in Role::ALL {
            let name = role.object_name(&ctx.top);
            if !role.enabled(&ctx.top) {
                if role.is_stateful() {
                    ctx.delete::<StatefulSet>(&name).await?;
                } else {
                    ctx.delete::<Deployment>(&name).await?;
                }
                continue;
            }

            let extra = role.extras(&self.config, &ctx.top, &hashes);
            if role.is_stateful() {
                ctx.create_or_update::<StatefulSet, _>(templates::STATEFULSET, Some(&extra), copy_desired)
                    .await?;
                continue;
            }

            let autoscaled = role.autoscaled(&ctx.top);
            let converged = ctx
                .create_or_update::<Deployment, _>(
                    templates::DEPLOYMENT,
                    Some(&extra),
                    move |want: &Deployment, have: &mut Deployment| {
                        let current = have.spec.as_ref().and_then(|s| s.replicas);
                        copy_desired(want, have)?;
                        if autoscaled {
                            if let (Some(spec), Some(n)) = (have.spec.as_mut(), current) {
                                spec.replicas = Some(n);
                            }
                        }
                        Ok(())
                    },
                )
                .await?;
            if converged.updated {
                debug!(instance = %ctx.name(), role = role.name(), "rolled workload");
            }
        }
        Ok(ReconcileResult::done())
    }
}

/// HorizontalPodAutoscaler for celery workers when enabled
pub struct Autoscalers;

#[async_trait]
impl Component<SummonPlatform> for Autoscalers {
    fn name(&self) -> &'static str {
        "autoscalers"
    }

    fn watch_types(&self) -> Vec<ApiResource> {
        vec![api_resource::<HorizontalPodAutoscaler>()]
    }

    fn is_reconcilable(&self, ctx: &Ctx) -> bool {
        ctx.top.phase().allows_workloads()
    }

    async fn reconcile(&self, ctx: &mut Ctx) -> Outcome {
        let Some(bounds) = ctx.top.spec.autoscaling.celeryd.clone() else {
            ctx.delete::<HorizontalPodAutoscaler>(&Role::Celeryd.object_name(&ctx.top))
                .await?;
            return Ok(ReconcileResult::done());
        };
        let extra = extras! {
            "role" => Role::Celeryd.name(),
            "min_replicas" => bounds.min_replicas,
            "max_replicas" => bounds.max_replicas.max(bounds.min_replicas),
        };
        ctx.create_or_update::<HorizontalPodAutoscaler, _>(templates::HPA, Some(&extra), copy_desired)
            .await?;
        Ok(ReconcileResult::done())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use summon_common::crd::{AutoscalerSpec, SatelliteSpec, SummonPlatformSpec};

    fn platform() -> SummonPlatform {
        SummonPlatform::new(
            "foo",
            SummonPlatformSpec {
                version: "1.2.3".into(),
                ..Default::default()
            },
        )
    }

    #[rstest]
    #[case(Role::Web, "us.gcr.io/ridecell-1/summon:1.2.3")]
    #[case(Role::KafkaConsumer, "us.gcr.io/ridecell-1/summon:1.2.3")]
    #[case(Role::Dispatch, "us.gcr.io/ridecell-1/dispatch:7-abc-master")]
    #[case(Role::Redis, "redis:5.0.5")]
    fn images_per_role(#[case] role: Role, #[case] image: &str) {
        let mut p = platform();
        p.spec.dispatch = SatelliteSpec {
            version: "7-abc-master".into(),
        };
        assert_eq!(role.image(&PlatformConfig::default(), &p), image);
    }

    #[test]
    fn satellites_and_kafka_are_opt_in() {
        let mut p = platform();
        assert!(Role::Web.enabled(&p));
        assert!(!Role::TripShare.enabled(&p));
        assert!(!Role::KafkaConsumer.enabled(&p));
        p.spec.trip_share.version = "3".into();
        p.spec.replicas.kafka_consumer = Some(2);
        assert!(Role::TripShare.enabled(&p));
        assert!(Role::KafkaConsumer.enabled(&p));
    }

    #[test]
    fn only_celeryd_is_autoscaled() {
        let mut p = platform();
        assert!(!Role::Celeryd.autoscaled(&p));
        p.spec.autoscaling.celeryd = Some(AutoscalerSpec {
            min_replicas: 1,
            max_replicas: 5,
        });
        assert!(Role::Celeryd.autoscaled(&p));
        assert!(!Role::Web.autoscaled(&p));
    }

    #[test]
    fn hashes_only_annotate_app_pods() {
        let hashes = BTreeMap::from([(CONFIG_HASH_ANNOTATION.to_string(), "abc".to_string())]);
        let config = PlatformConfig::default();
        let web = Role::Web.extras(&config, &platform(), &hashes);
        assert_eq!(web["annotations"][CONFIG_HASH_ANNOTATION], "abc");
        let redis = Role::Redis.extras(&config, &platform(), &hashes);
        assert_eq!(redis["annotations"], json!({}));
        assert_eq!(redis["mount_app"], json!(false));
    }
}
