//! Status vocabulary and small shared types

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Lifecycle of a SummonPlatform instance
///
/// `"" → Initializing → Migrating → CreatingBackup → PostMigrateWait → Deploying → Ready`,
/// with `Error` reachable from any state.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum PlatformPhase {
    /// Never reconciled
    #[default]
    #[serde(rename = "")]
    Unknown,
    /// Waiting on backing services (database, pull secret)
    Initializing,
    /// Schema migrations are running
    Migrating,
    /// Pre-migration database snapshot is being taken
    CreatingBackup,
    /// Migrations done, holding before rolling out workloads
    PostMigrateWait,
    /// Workloads are being rolled out
    Deploying,
    /// Every expected workload reports ready
    Ready,
    /// Reconcile failed; see `message`
    Error,
}

impl PlatformPhase {
    /// Workload deployments may only be converged in these phases
    pub fn allows_workloads(self) -> bool {
        matches!(self, Self::Deploying | Self::Ready)
    }
}

impl std::fmt::Display for PlatformPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unknown => "",
            Self::Initializing => "Initializing",
            Self::Migrating => "Migrating",
            Self::CreatingBackup => "CreatingBackup",
            Self::PostMigrateWait => "PostMigrateWait",
            Self::Deploying => "Deploying",
            Self::Ready => "Ready",
            Self::Error => "Error",
        };
        f.write_str(s)
    }
}

/// Status reported by child custom resources owned by other controllers
///
/// Values this operator does not know about collapse to `Unknown` so a new
/// child controller release can never break deserialization of the parent.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum ChildPhase {
    /// Child is being provisioned
    Creating,
    /// Child work is in progress
    Running,
    /// Child converged
    Ready,
    /// Child failed; see its message
    Error,
    /// No status reported yet
    #[default]
    #[serde(other)]
    Unknown,
}

impl ChildPhase {
    /// True once the child converged
    pub fn is_ready(self) -> bool {
        self == Self::Ready
    }
}

/// Reference to a key inside a Secret in the same namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    /// Secret name
    pub name: String,
    /// Key inside the secret data
    #[serde(default)]
    pub key: String,
}

/// Connection details published by a PostgresDatabase
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PostgresConnection {
    /// Database host
    pub host: String,
    /// Database port
    #[serde(default = "default_postgres_port")]
    pub port: i32,
    /// Login role
    pub username: String,
    /// Database name
    pub database: String,
    /// Where the password lives
    pub password_secret_ref: SecretRef,
    /// Cloud database instance identifier, empty for shared local databases
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub instance_id: String,
}

fn default_postgres_port() -> i32 {
    5432
}

/// Connection details published by a RabbitmqVhost
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RabbitmqConnection {
    /// Broker host
    pub host: String,
    /// Broker port
    #[serde(default = "default_rabbitmq_port")]
    pub port: i32,
    /// Login user
    pub username: String,
    /// Virtual host
    pub vhost: String,
    /// Where the password lives
    pub password_secret_ref: SecretRef,
}

fn default_rabbitmq_port() -> i32 {
    5671
}

/// `{status, message}` pair shared by every auxiliary resource
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BasicStatus {
    /// Current phase
    #[serde(default)]
    pub status: ChildPhase,
    /// Human-readable message
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl BasicStatus {
    /// Status with the given phase and message
    pub fn new(status: ChildPhase, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}
