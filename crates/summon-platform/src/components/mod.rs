//! Components of the SummonPlatform composition
//!
//! Each component owns one slice of the instance. Data dependencies between
//! them are expressed only through `is_reconcilable` gates over the top's
//! status; the order the engine is built with decides dispatch within a tick.

mod app_secret;
mod autodeploy;
mod backing;
mod backup;
mod cloud;
mod config_map;
mod defaults;
mod derived_secrets;
mod migrations;
mod network;
mod new_relic;
mod notify;
mod status;
mod workloads;

pub use app_secret::{AppSecret, APP_SECRETS_KEY};
pub use autodeploy::AutoDeploy;
pub use backing::{Postgres, PullSecretComponent, Rabbitmq};
pub use backup::Backup;
pub use cloud::{GcpServiceAccountComponent, IamUserComponent, MivBucket, StaticBucket};
pub use config_map::{ConfigMapComponent, CONFIG_KEY};
pub use defaults::{Defaults, CONFIG_DEFAULTS};
pub use derived_secrets::{FernetRotate, MockCarServer, SecretKey, FERNET_TIMESTAMP_FORMAT};
pub use migrations::{MigrateWait, Migrations};
pub use network::{DisruptionBudgets, Ingresses, ServiceMonitors, Services};
pub use new_relic::NewRelic;
pub use notify::Notification;
pub use status::{workload_ready, StatusAggregator};
pub use workloads::{Autoscalers, Role, Workloads, APP_SECRETS_HASH_ANNOTATION, CONFIG_HASH_ANNOTATION};

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use summon_common::crd::{
    ChildPhase, GcpServiceAccount, IAMUser, MigrationJob, MockCarServerTenant, PostgresDatabase,
    PullSecret, RDSSnapshot, RabbitmqVhost, S3Bucket, SummonPlatform,
};
use summon_common::Result;
use summon_engine::{ComponentContext, ReconcileResult};

pub(crate) type Ctx = ComponentContext<SummonPlatform>;
pub(crate) type Outcome = Result<ReconcileResult<SummonPlatform>>;

/// Phase and message reported by a child custom resource
pub(crate) trait ChildStatus {
    fn child_phase(&self) -> ChildPhase;
    fn child_message(&self) -> String;
}

macro_rules! child_status {
    ($($kind:ty),+ $(,)?) => {
        $(
            impl ChildStatus for $kind {
                fn child_phase(&self) -> ChildPhase {
                    self.status.as_ref().map(|s| s.status).unwrap_or_default()
                }

                fn child_message(&self) -> String {
                    self.status.as_ref().map(|s| s.message.clone()).unwrap_or_default()
                }
            }
        )+
    };
}

child_status!(
    PullSecret,
    PostgresDatabase,
    RabbitmqVhost,
    S3Bucket,
    IAMUser,
    GcpServiceAccount,
    MockCarServerTenant,
    RDSSnapshot,
    MigrationJob,
);

pub(crate) fn postgres_ready(top: &SummonPlatform) -> bool {
    top.status
        .as_ref()
        .is_some_and(|s| s.postgres_status.is_ready())
}

pub(crate) fn rabbitmq_ready(top: &SummonPlatform) -> bool {
    top.status
        .as_ref()
        .is_some_and(|s| s.rabbitmq_status.is_ready())
}

pub(crate) fn pull_secret_ready(top: &SummonPlatform) -> bool {
    top.status
        .as_ref()
        .is_some_and(|s| s.pull_secret_status.is_ready())
}

/// Secret data decoded as UTF-8
pub(crate) fn secret_strings(secret: &Secret) -> BTreeMap<String, String> {
    secret
        .data
        .iter()
        .flatten()
        .map(|(k, v)| (k.clone(), String::from_utf8_lossy(&v.0).into_owned()))
        .collect()
}

/// Encode string values as secret data
pub(crate) fn secret_data<I, K, V>(entries: I) -> BTreeMap<String, ByteString>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Vec<u8>>,
{
    entries
        .into_iter()
        .map(|(k, v)| (k.into(), ByteString(v.into())))
        .collect()
}

/// Name of a per-instance object: `<instance><sep><suffix>`
pub(crate) fn child_name(top: &SummonPlatform, sep: char, suffix: &str) -> String {
    format!("{}{}{}", top.metadata.name.as_deref().unwrap_or_default(), sep, suffix)
}
