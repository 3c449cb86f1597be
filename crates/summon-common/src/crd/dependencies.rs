//! Child custom resources created for a SummonPlatform and converged by
//! their own controllers. Only the fields this operator reads or writes are
//! modelled.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ChildPhase, PostgresConnection, RabbitmqConnection};

/// Image pull credentials copied into the instance namespace
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "secrets.ridecell.io",
    version = "v1beta1",
    kind = "PullSecret",
    namespaced,
    status = "PullSecretStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct PullSecretSpec {
    /// Name of the docker config secret to materialise
    pub pull_secret_name: String,
}

/// PullSecret status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PullSecretStatus {
    #[serde(default)]
    pub status: ChildPhase,
    #[serde(default)]
    pub message: String,
}

/// Database (and login role) for one instance
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "db.ridecell.io",
    version = "v1beta1",
    kind = "PostgresDatabase",
    namespaced,
    status = "PostgresDatabaseStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct PostgresDatabaseSpec {
    /// Database name inside the server
    pub database_name: String,
    /// Shared database server; empty when the instance has its own
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub shared_name: String,
    /// Extensions to enable
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, String>,
}

/// PostgresDatabase status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostgresDatabaseStatus {
    #[serde(default)]
    pub status: ChildPhase,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<PostgresConnection>,
}

/// Message-broker virtual host for one instance
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "db.ridecell.io",
    version = "v1beta1",
    kind = "RabbitmqVhost",
    namespaced,
    status = "RabbitmqVhostStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct RabbitmqVhostSpec {
    /// Virtual host name
    pub vhost_name: String,
}

/// RabbitmqVhost status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RabbitmqVhostStatus {
    #[serde(default)]
    pub status: ChildPhase,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<RabbitmqConnection>,
}

/// Object storage bucket
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "aws.ridecell.io",
    version = "v1beta1",
    kind = "S3Bucket",
    namespaced,
    status = "S3BucketStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct S3BucketSpec {
    /// Globally unique bucket name
    pub bucket_name: String,
    /// Bucket region
    #[serde(default)]
    pub region: String,
    /// Bucket policy document, JSON
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bucket_policy: String,
}

/// S3Bucket status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct S3BucketStatus {
    #[serde(default)]
    pub status: ChildPhase,
    #[serde(default)]
    pub message: String,
}

/// Cloud IAM user; its controller writes `<name>.aws-credentials`
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "aws.ridecell.io",
    version = "v1beta1",
    kind = "IAMUser",
    namespaced,
    status = "IAMUserStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct IAMUserSpec {
    /// IAM user name
    pub user_name: String,
    /// Inline policy documents keyed by policy name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inline_policies: BTreeMap<String, String>,
    /// Permissions boundary applied to the user
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub permissions_boundary_arn: String,
}

/// IAMUser status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IAMUserStatus {
    #[serde(default)]
    pub status: ChildPhase,
    #[serde(default)]
    pub message: String,
}

/// Cloud service account for GCP-integrated instances
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "gcp.ridecell.io",
    version = "v1beta1",
    kind = "GcpServiceAccount",
    namespaced,
    status = "GcpServiceAccountStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct GcpServiceAccountSpec {
    /// GCP project
    pub project: String,
    /// Service account id
    pub account_id: String,
    /// Human-readable description
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// GcpServiceAccount status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GcpServiceAccountStatus {
    #[serde(default)]
    pub status: ChildPhase,
    #[serde(default)]
    pub message: String,
}

/// Tenant on the mock car server; its controller writes `<name>.tenant-otakeys`
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "summon.ridecell.io",
    version = "v1beta1",
    kind = "MockCarServerTenant",
    namespaced,
    status = "MockCarServerTenantStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct MockCarServerTenantSpec {
    /// Hardware flavour to emulate
    #[serde(default)]
    pub tenant_hardware_type: String,
    /// Where the mock server posts vehicle events
    #[serde(default)]
    pub callback_url: String,
}

/// MockCarServerTenant status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MockCarServerTenantStatus {
    #[serde(default)]
    pub status: ChildPhase,
    #[serde(default)]
    pub message: String,
}

/// Prometheus scrape target
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "monitoring.coreos.com",
    version = "v1",
    kind = "ServiceMonitor",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMonitorSpec {
    /// Endpoints to scrape
    #[serde(default)]
    pub endpoints: Vec<ServiceMonitorEndpoint>,
    /// Services to scrape, by label
    #[serde(default)]
    pub selector: ServiceMonitorSelector,
}

/// One scrape endpoint
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMonitorEndpoint {
    /// Named service port
    pub port: String,
    /// Metrics path
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    /// Scrape interval
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub interval: String,
}

/// Label selector
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMonitorSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}
