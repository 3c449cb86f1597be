//! SummonPlatform CRD: one running instance of the platform

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ChildPhase, PlatformPhase, PostgresConnection, RabbitmqConnection};

/// SummonPlatform converges one platform instance: database, broker, secrets,
/// migrations and every workload.
///
/// Example:
/// ```yaml
/// apiVersion: summon.ridecell.io/v1beta1
/// kind: SummonPlatform
/// metadata:
///   name: foo-dev
///   namespace: summon-dev
/// spec:
///   version: 1234-abc1234-master
///   secrets: [foo-dev]
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "summon.ridecell.io",
    version = "v1beta1",
    kind = "SummonPlatform",
    namespaced,
    status = "SummonPlatformStatus",
    shortname = "summon",
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SummonPlatformSpec {
    /// Primary hostname. Defaults to `<name>.ridecell.us`.
    #[serde(default)]
    pub hostname: String,

    /// Additional hostnames served by the web ingress
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,

    /// Image tag to deploy. Mutually exclusive with `autoDeploy`.
    #[serde(default)]
    pub version: String,

    /// Branch to track; the newest built tag for the branch becomes `version`
    #[serde(default)]
    pub auto_deploy: String,

    /// Input secrets overlaid onto the app secrets, later entries win
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<String>,

    /// Name of the image pull secret
    #[serde(default)]
    pub pull_secret: String,

    /// Non-secret Django settings
    #[serde(default)]
    pub config: BTreeMap<String, ConfigValue>,

    /// Replica counts per workload role
    #[serde(default)]
    pub replicas: ReplicasSpec,

    /// Roles whose replica count is owned by a HorizontalPodAutoscaler
    #[serde(default)]
    pub autoscaling: AutoscalingSpec,

    /// Age after which a new fernet key is generated
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub fernet_key_lifetime: Option<Duration>,

    /// Database placement and migration knobs
    #[serde(default)]
    pub database: DatabaseSpec,

    /// Pre-migration snapshot settings
    #[serde(default)]
    pub backup: BackupSpec,

    /// Deliberate pauses in the rollout
    #[serde(default)]
    pub waits: WaitsSpec,

    /// Where status transitions are announced
    #[serde(default)]
    pub notifications: NotificationsSpec,

    /// Render a New Relic agent config secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_new_relic: Option<bool>,

    /// Provision a tenant on the mock car server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_mock_car_server: Option<bool>,

    /// dev, qa, uat, prod. Defaults from the namespace suffix.
    #[serde(default)]
    pub environment: String,

    /// AWS region for buckets and IAM
    #[serde(default)]
    pub aws_region: String,

    /// SQS queue for outbound data
    #[serde(default)]
    pub sqs_queue: String,

    /// SQS region. Defaults to us-west-2.
    #[serde(default)]
    pub sqs_region: String,

    /// Media-in-vehicle bucket settings
    #[serde(default)]
    pub miv: MivSpec,

    /// GCP project for the workload service account; empty disables it
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub gcp_project: String,

    /// Flavor loaded before the first migration
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub flavor: String,

    /// Dispatch satellite
    #[serde(default)]
    pub dispatch: SatelliteSpec,

    /// Business portal satellite
    #[serde(default)]
    pub business_portal: SatelliteSpec,

    /// Trip share satellite
    #[serde(default)]
    pub trip_share: SatelliteSpec,

    /// Hardware aux satellite
    #[serde(default)]
    pub hw_aux: SatelliteSpec,
}

/// A config value: string, boolean or number
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(untagged)]
pub enum ConfigValue {
    /// Boolean flag
    Bool(bool),
    /// Numeric setting
    Float(f64),
    /// Anything else
    String(String),
}

impl From<&str> for ConfigValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<bool> for ConfigValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for ConfigValue {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

/// Replica counts per role; `None` until defaulted
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicasSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daphne: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub celeryd: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_worker: Option<i32>,
    #[serde(default, rename = "static", skip_serializing_if = "Option::is_none")]
    pub static_: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub celery_beat: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatch: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_portal: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trip_share: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hw_aux: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kafka_consumer: Option<i32>,
}

/// Autoscaler bounds for one role
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalerSpec {
    /// Lower bound
    #[serde(default = "default_min_replicas")]
    pub min_replicas: i32,
    /// Upper bound
    pub max_replicas: i32,
}

fn default_min_replicas() -> i32 {
    1
}

/// Which roles are autoscaled
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalingSpec {
    /// Autoscale celery workers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub celeryd: Option<AutoscalerSpec>,
}

/// Database placement
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSpec {
    /// Give this instance its own database server
    #[serde(default)]
    pub exclusive: bool,
    /// Shared database server name when not exclusive
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub shared_name: String,
    /// Migration behaviour tweaks
    #[serde(default)]
    pub migration_overrides: MigrationOverridesSpec,
}

/// Opt-outs for migration preamble steps
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MigrationOverridesSpec {
    /// Skip the CORE-1540 fixup on upgrades
    #[serde(default)]
    pub skip_core1540_fixup: bool,
}

/// Pre-migration snapshot settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    /// How long snapshots are kept
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub ttl: Option<Duration>,
    /// Hold migrations until the snapshot is ready
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_until_ready: Option<bool>,
}

/// Deliberate pauses in the rollout
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WaitsSpec {
    /// Pause between migrations finishing and workloads rolling
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub post_migrate: Option<Duration>,
}

/// Notification targets
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationsSpec {
    /// Primary chat channel
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub slack_channel: String,
    /// Additional chat channels
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub slack_channels: Vec<String>,
    /// Deploy tracker endpoint override
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub deploy_status_url: String,
    /// Trigger regression tests on new versions
    #[serde(default)]
    pub circleci_regression_webhook: bool,
}

impl NotificationsSpec {
    /// Every configured chat channel, primary first, without duplicates
    pub fn channels(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let all = std::iter::once(&self.slack_channel).chain(self.slack_channels.iter());
        for channel in all {
            if !channel.is_empty() && !out.contains(channel) {
                out.push(channel.clone());
            }
        }
        out
    }
}

/// Media-in-vehicle bucket
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MivSpec {
    /// Use this externally managed bucket instead of an operator-managed one
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub existing_bucket: String,
}

/// A separately versioned satellite application
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SatelliteSpec {
    /// Image tag; empty disables the satellite
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
}

/// Observed state of a SummonPlatform
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SummonPlatformStatus {
    /// Overall phase
    #[serde(default)]
    pub status: PlatformPhase,
    /// Human-readable message
    #[serde(default)]
    pub message: String,
    /// Image pull secret status
    #[serde(default)]
    pub pull_secret_status: ChildPhase,
    /// Database status
    #[serde(default)]
    pub postgres_status: ChildPhase,
    /// Database connection details
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postgres_connection: Option<PostgresConnection>,
    /// Broker vhost status
    #[serde(default, rename = "rabbitmqStatus")]
    pub rabbitmq_status: ChildPhase,
    /// Broker connection details
    #[serde(default, rename = "rabbitmqConnection", skip_serializing_if = "Option::is_none")]
    pub rabbitmq_connection: Option<RabbitmqConnection>,
    /// Version whose migrations completed
    #[serde(default)]
    pub migrate_version: String,
    /// Version whose pre-migration snapshot completed
    #[serde(default)]
    pub backup_version: String,
    /// Versions already announced
    #[serde(default)]
    pub notification: NotificationStatus,
    /// MIV bucket in use
    #[serde(default)]
    pub miv: MivStatus,
    /// Post-migrate wait bookkeeping
    #[serde(default)]
    pub wait: WaitStatus,
}

/// Last version announced per tracked component
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summon_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dispatch_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub business_portal_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub trip_share_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hw_aux_version: String,
    /// Version the regression webhook was last triggered for
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub regression_tests_version: String,
}

/// MIV bucket status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MivStatus {
    /// Bucket name in use
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bucket: String,
}

/// Post-migrate wait bookkeeping
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WaitStatus {
    /// Rollout may proceed after this instant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,
}

impl SummonPlatform {
    /// Status, creating an empty one if needed
    pub fn status_mut(&mut self) -> &mut SummonPlatformStatus {
        self.status.get_or_insert_with(Default::default)
    }

    /// Current phase, `Unknown` when no status was ever written
    pub fn phase(&self) -> PlatformPhase {
        self.status.as_ref().map(|s| s.status).unwrap_or_default()
    }

    /// Read-only view of the status, empty when none was ever written
    pub fn status_or_default(&self) -> SummonPlatformStatus {
        self.status.clone().unwrap_or_default()
    }
}
