//! Command line and environment settings

use std::time::Duration;

use clap::{Parser, Subcommand};
use summon_common::config::{
    ControllersConfig, NotificationConfig, PlatformConfig, DEFAULT_CIRCLECI_URL,
    DEFAULT_DEPLOY_STATUS_URL, DEFAULT_IMAGE_REPOSITORY,
};

/// Summon operator - converges summon platform instances and their helpers
#[derive(Parser, Debug)]
#[command(name = "summon-operator", version, about, long_about = None)]
pub struct Cli {
    /// Emit JSON log lines
    #[arg(long, env = "LOG_JSON", global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print every CRD the operator owns as a YAML stream
    Crd,
    /// Run all controllers (default)
    Run(RunArgs),
}

/// Settings for `run`; every flag falls back to its environment variable
#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    /// Chat API token; unset disables chat notifications
    #[arg(long, env = "SLACK_API_KEY", default_value = "", hide_env_values = true)]
    pub slack_api_key: String,

    /// Deploy tracker endpoint
    #[arg(long, env = "DEPLOY_STAT_URL", default_value = DEFAULT_DEPLOY_STATUS_URL)]
    pub deploy_status_url: String,

    /// CI API token for regression test webhooks
    #[arg(long, env = "CIRCLECI_API_KEY", default_value = "", hide_env_values = true)]
    pub circleci_api_key: String,

    /// CI pipeline endpoint for regression test webhooks
    #[arg(long, env = "CIRCLECI_URL", default_value = DEFAULT_CIRCLECI_URL)]
    pub circleci_url: String,

    /// License key rendered into every instance's monitoring secret
    #[arg(long, env = "NEW_RELIC_LICENSE_KEY", default_value = "", hide_env_values = true)]
    pub new_relic_license_key: String,

    /// Service account key for registry access and GCP secrets
    #[arg(long, env = "GOOGLE_SERVICE_ACCOUNT_KEY", default_value = "", hide_env_values = true)]
    pub google_service_account_key: String,

    /// Registry API base used for autodeploy tag listings
    #[arg(long, default_value = "https://us.gcr.io")]
    pub registry_url: String,

    /// Registry override for local testing
    #[arg(long, env = "LOCAL_REGISTRY_URL")]
    pub local_registry_url: Option<String>,

    /// Repository workload images are pulled from
    #[arg(long, default_value = DEFAULT_IMAGE_REPOSITORY)]
    pub image_repository: String,

    /// Permissions boundary attached to IAM users
    #[arg(long, env = "PERMISSIONS_BOUNDARY_ARN", default_value = "")]
    pub permissions_boundary_arn: String,

    /// Trust policy for IAM roles
    #[arg(long, env = "AWS_ASSUME_ROLE_POLICY_DOCUMENT", default_value = "")]
    pub assume_role_policy_document: String,

    /// Region for buckets, KMS and RDS
    #[arg(long, env = "AWS_REGION", default_value = "us-west-2")]
    pub aws_region: String,

    /// Tear down external resources through finalizers
    #[arg(long, env = "ENABLE_FINALIZERS")]
    pub enable_finalizers: bool,

    /// Aggregate readiness over the extended workload set
    #[arg(long, env = "ENABLE_NEW_STATUS_CHECK")]
    pub enable_new_status_check: bool,

    /// How often snapshots are checked for an expired TTL
    #[arg(long, default_value = "1h", value_parser = humantime::parse_duration)]
    pub snapshot_scan_interval: Duration,

    /// Firewall broker endpoint; unset only logs the node rules
    #[arg(long, env = "FIREWALL_URL")]
    pub firewall_url: Option<String>,
}

impl RunArgs {
    /// Settings for the SummonPlatform composition
    pub fn platform_config(&self) -> PlatformConfig {
        PlatformConfig {
            image_repository: self.image_repository.clone(),
            registry_url: self
                .local_registry_url
                .clone()
                .filter(|u| !u.is_empty())
                .unwrap_or_else(|| self.registry_url.clone()),
            new_relic_license_key: self.new_relic_license_key.clone(),
            google_service_account_key: self.google_service_account_key.clone(),
            permissions_boundary_arn: self.permissions_boundary_arn.clone(),
            assume_role_policy_document: self.assume_role_policy_document.clone(),
            aws_region: self.aws_region.clone(),
            enable_finalizers: self.enable_finalizers,
            enable_new_status_check: self.enable_new_status_check,
        }
    }

    /// Notification sink settings
    pub fn notification_config(&self) -> NotificationConfig {
        NotificationConfig {
            slack_api_key: self.slack_api_key.clone(),
            deploy_status_url: self.deploy_status_url.clone(),
            circleci_api_key: self.circleci_api_key.clone(),
            circleci_url: self.circleci_url.clone(),
        }
    }

    /// Settings for the auxiliary controllers
    pub fn controllers_config(&self) -> ControllersConfig {
        ControllersConfig {
            aws_region: self.aws_region.clone(),
            snapshot_scan_interval: self.snapshot_scan_interval,
            firewall_url: self.firewall_url.clone().filter(|u| !u.is_empty()),
            enable_finalizers: self.enable_finalizers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_args(extra: &[&str]) -> RunArgs {
        let argv = ["summon-operator", "run"].iter().chain(extra);
        match Cli::try_parse_from(argv).unwrap().command {
            Some(Command::Run(args)) => args,
            other => panic!("expected run, got {other:?}"),
        }
    }

    #[test]
    fn crd_subcommand_parses() {
        let cli = Cli::try_parse_from(["summon-operator", "--log-json", "crd"]).unwrap();
        assert!(cli.log_json);
        assert!(matches!(cli.command, Some(Command::Crd)));
    }

    #[test]
    fn local_registry_overrides_registry() {
        let args = run_args(&[
            "--registry-url",
            "https://us.gcr.io",
            "--local-registry-url",
            "http://localhost:5000",
        ]);
        assert_eq!(args.platform_config().registry_url, "http://localhost:5000");
    }

    #[test]
    fn controller_settings_come_from_flags() {
        let args = run_args(&[
            "--aws-region",
            "eu-west-1",
            "--snapshot-scan-interval",
            "30m",
            "--firewall-url",
            "https://firewall.example/rules",
            "--enable-finalizers",
        ]);
        let config = args.controllers_config();
        assert_eq!(config.aws_region, "eu-west-1");
        assert_eq!(config.snapshot_scan_interval, Duration::from_secs(1800));
        assert_eq!(config.firewall_url.as_deref(), Some("https://firewall.example/rules"));
        assert!(config.enable_finalizers);
        assert!(args.platform_config().enable_finalizers);
    }

    #[test]
    fn bad_interval_is_rejected() {
        let argv = ["summon-operator", "run", "--snapshot-scan-interval", "soon"];
        assert!(Cli::try_parse_from(argv).is_err());
    }
}
