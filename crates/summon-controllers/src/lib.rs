//! Auxiliary reconcilers
//!
//! Small single-component engines living next to the SummonPlatform one:
//! KMS-encrypted secrets, ingresses with short hostnames, database snapshots
//! with a time-to-live, migration jobs and the node firewall allow-list.
//! Each module exposes an `engine` constructor; the binary runs them all.

#![deny(missing_docs)]

pub mod encrypted_secret;
pub mod firewall;
pub mod migration_job;
pub mod rds_snapshot;
pub mod ridecell_ingress;

pub use encrypted_secret::{AwsKms, KmsDecrypter};
pub use firewall::{FirewallSink, HttpFirewall, LoggingFirewall};
pub use rds_snapshot::{run_ttl_scanner, AwsRds, RdsBackend};

/// Shared SDK configuration for the cloud clients in this crate
pub async fn aws_sdk_config(region: &str) -> aws_config::SdkConfig {
    aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(region.to_string()))
        .load()
        .await
}
