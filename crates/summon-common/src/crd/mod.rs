//! Custom Resource Definitions used by the summon operator

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::CustomResourceExt;

mod dependencies;
mod encrypted_secret;
mod migration_job;
mod rds_snapshot;
mod ridecell_ingress;
mod summon_platform;
mod types;

pub use dependencies::{
    GcpServiceAccount, GcpServiceAccountSpec, GcpServiceAccountStatus, IAMUser, IAMUserSpec,
    IAMUserStatus, MockCarServerTenant, MockCarServerTenantSpec, MockCarServerTenantStatus,
    PostgresDatabase, PostgresDatabaseSpec, PostgresDatabaseStatus, PullSecret, PullSecretSpec,
    PullSecretStatus, RabbitmqVhost, RabbitmqVhostSpec, RabbitmqVhostStatus, S3Bucket,
    S3BucketSpec, S3BucketStatus, ServiceMonitor, ServiceMonitorEndpoint, ServiceMonitorSelector,
    ServiceMonitorSpec,
};
pub use encrypted_secret::{EncryptedSecret, EncryptedSecretSpec, EncryptedSecretStatus};
pub use migration_job::{MigrationJob, MigrationJobSpec, MigrationJobStatus};
pub use rds_snapshot::{RDSSnapshot, RDSSnapshotSpec, RDSSnapshotStatus};
pub use ridecell_ingress::{RidecellIngress, RidecellIngressSpec, RidecellIngressStatus};
pub use summon_platform::{
    AutoscalerSpec, AutoscalingSpec, BackupSpec, ConfigValue, DatabaseSpec, MigrationOverridesSpec,
    MivSpec, MivStatus, NotificationStatus, NotificationsSpec, ReplicasSpec, SatelliteSpec,
    SummonPlatform, SummonPlatformSpec, SummonPlatformStatus, WaitStatus, WaitsSpec,
};
pub use types::{
    BasicStatus, ChildPhase, PlatformPhase, PostgresConnection, RabbitmqConnection, SecretRef,
};

/// CRDs this operator installs, for `summon-operator crd`
pub fn owned_crds() -> Vec<CustomResourceDefinition> {
    vec![
        SummonPlatform::crd(),
        EncryptedSecret::crd(),
        RidecellIngress::crd(),
        RDSSnapshot::crd(),
        MigrationJob::crd(),
        MockCarServerTenant::crd(),
    ]
}
