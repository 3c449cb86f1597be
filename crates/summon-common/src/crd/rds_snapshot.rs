//! RDSSnapshot CRD: a database snapshot with a time-to-live

use std::time::Duration;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::ChildPhase;

/// Snapshot of a cloud database instance, deleted once older than `ttl`
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "db.ridecell.io",
    version = "v1beta1",
    kind = "RDSSnapshot",
    namespaced,
    status = "RDSSnapshotStatus",
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RDSSnapshotSpec {
    /// Database instance to snapshot
    pub rds_instance_id: String,
    /// Snapshot identifier; defaults to the object name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub snapshot_id: String,
    /// How long the snapshot is kept; unset keeps it forever
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub ttl: Option<Duration>,
}

/// RDSSnapshot status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RDSSnapshotStatus {
    #[serde(default)]
    pub status: ChildPhase,
    #[serde(default)]
    pub message: String,
}

impl RDSSnapshot {
    /// Cloud snapshot identifier
    pub fn snapshot_id(&self) -> String {
        if self.spec.snapshot_id.is_empty() {
            self.metadata.name.clone().unwrap_or_default()
        } else {
            self.spec.snapshot_id.clone()
        }
    }
}
