//! MigrationJob CRD: one schema migration run

use k8s_openapi::api::batch::v1::JobSpec;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::ChildPhase;

/// Runs the migration Job for one version and reports its outcome
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "summon.ridecell.io",
    version = "v1beta1",
    kind = "MigrationJob",
    namespaced,
    status = "MigrationJobStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct MigrationJobSpec {
    /// Version being migrated to
    #[serde(default)]
    pub version: String,
    /// Job to run
    pub template: JobSpec,
}

/// MigrationJob status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MigrationJobStatus {
    #[serde(default)]
    pub status: ChildPhase,
    #[serde(default)]
    pub message: String,
    /// Spec version the phase was observed for
    #[serde(default)]
    pub version: String,
}
