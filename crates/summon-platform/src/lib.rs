//! SummonPlatform composition
//!
//! The ordered component list that converges one platform instance, the
//! readiness aggregator, the notification engine and the autodeploy tag
//! cache. [`platform_engine`] wires all of it onto a [`summon_engine::Engine`].

#![deny(missing_docs)]

pub mod components;
pub mod notification;
pub mod tag_cache;
pub mod templates;

use std::sync::Arc;

use summon_common::clock::SharedClock;
use summon_common::config::PlatformConfig;
use summon_common::crd::SummonPlatform;
use summon_common::Result;
use summon_engine::{ClusterClient, Engine};

use components::{
    AppSecret, AutoDeploy, Autoscalers, Backup, ConfigMapComponent, Defaults, DisruptionBudgets,
    FernetRotate, GcpServiceAccountComponent, IamUserComponent, Ingresses, MigrateWait, Migrations,
    MivBucket, MockCarServer, NewRelic, Notification, Postgres, PullSecretComponent, Rabbitmq,
    SecretKey, ServiceMonitors, Services, StaticBucket, StatusAggregator, Workloads,
};
use notification::NotificationEngine;
use tag_cache::TagCache;

/// Long-lived collaborators shared by every SummonPlatform tick
#[derive(Clone)]
pub struct PlatformDeps {
    /// Operator settings
    pub config: Arc<PlatformConfig>,
    /// Autodeploy tag listing
    pub tag_cache: Arc<TagCache>,
    /// Process-wide notification dedup and sinks
    pub notifier: Arc<NotificationEngine>,
    /// Wall clock
    pub clock: SharedClock,
}

/// Build the SummonPlatform engine with its components in dispatch order
pub fn platform_engine(
    client: Arc<dyn ClusterClient>,
    deps: PlatformDeps,
) -> Result<Engine<SummonPlatform>> {
    let config = deps.config;
    let renderer = Arc::new(templates::renderer()?);

    let engine = Engine::builder("summonplatform", client)
        .templates(renderer)
        .clock(deps.clock)
        .finalizers(config.enable_finalizers)
        .component(Defaults::new(config.clone()))
        .component(AutoDeploy::new(deps.tag_cache))
        .component(PullSecretComponent)
        .component(Postgres)
        .component(IamUserComponent::new(config.clone()))
        .component(StaticBucket)
        .component(MivBucket)
        .component(GcpServiceAccountComponent)
        .component(Rabbitmq)
        .component(SecretKey)
        .component(FernetRotate)
        .component(MockCarServer)
        .component(AppSecret)
        .component(NewRelic::new(config.clone()))
        .component(ConfigMapComponent)
        .component(Backup)
        .component(Migrations::new(config.clone()))
        .component(MigrateWait)
        .component(Workloads::new(config.clone()))
        .component(Autoscalers)
        .component(Services)
        .component(Ingresses)
        .component(DisruptionBudgets)
        .component(ServiceMonitors)
        .component(StatusAggregator::new(config.enable_new_status_check))
        .component(Notification::new(deps.notifier))
        .build();
    Ok(engine)
}
