//! Operator configuration injected into components at engine build time
//!
//! The binary fills these from CLI flags and environment variables;
//! components never read the process environment themselves.

use std::time::Duration;

/// Default image repository for summon workloads
pub const DEFAULT_IMAGE_REPOSITORY: &str = "us.gcr.io/ridecell-1/summon";

/// Default deploy tracker endpoint
pub const DEFAULT_DEPLOY_STATUS_URL: &str = "https://deploy-status.ridecell.io/deploy";

/// Default CI pipeline endpoint for regression tests
pub const DEFAULT_CIRCLECI_URL: &str =
    "https://circleci.com/api/v2/project/gh/Ridecell/kubernetes-regression-tests/pipeline";

/// How long autodeploy tag listings stay fresh
pub const TAG_CACHE_EXPIRY: Duration = Duration::from_secs(5 * 60);

/// Settings consumed by the SummonPlatform composition
#[derive(Clone, Debug)]
pub struct PlatformConfig {
    /// Repository workload images are pulled from
    pub image_repository: String,
    /// Registry API base used to list autodeploy tags
    pub registry_url: String,
    /// License key rendered into the New Relic secret
    pub new_relic_license_key: String,
    /// Key material for the GCP service account secret
    pub google_service_account_key: String,
    /// Permissions boundary applied to IAM users
    pub permissions_boundary_arn: String,
    /// Trust policy for IAM roles
    pub assume_role_policy_document: String,
    /// Default region for buckets and IAM
    pub aws_region: String,
    /// Child teardown via finalizers
    pub enable_finalizers: bool,
    /// Aggregate readiness over the extended workload set
    pub enable_new_status_check: bool,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            image_repository: DEFAULT_IMAGE_REPOSITORY.to_string(),
            registry_url: "https://us.gcr.io".to_string(),
            new_relic_license_key: String::new(),
            google_service_account_key: String::new(),
            permissions_boundary_arn: String::new(),
            assume_role_policy_document: String::new(),
            aws_region: "us-west-2".to_string(),
            enable_finalizers: false,
            enable_new_status_check: false,
        }
    }
}

/// Notification sink credentials and endpoints
#[derive(Clone, Debug, Default)]
pub struct NotificationConfig {
    /// Chat API token; empty disables chat delivery
    pub slack_api_key: String,
    /// Deploy tracker endpoint; empty disables it
    pub deploy_status_url: String,
    /// CI API token; empty disables regression webhooks
    pub circleci_api_key: String,
    /// CI pipeline endpoint
    pub circleci_url: String,
}

impl NotificationConfig {
    /// Chat delivery is configured
    pub fn slack_enabled(&self) -> bool {
        !self.slack_api_key.is_empty()
    }
}

/// Settings for the auxiliary controllers
#[derive(Clone, Debug)]
pub struct ControllersConfig {
    /// Region used for KMS and RDS clients
    pub aws_region: String,
    /// How often expired snapshots are looked for
    pub snapshot_scan_interval: Duration,
    /// Firewall broker endpoint; unset logs the computed rules only
    pub firewall_url: Option<String>,
    /// Child teardown via finalizers
    pub enable_finalizers: bool,
}

impl Default for ControllersConfig {
    fn default() -> Self {
        Self {
            aws_region: "us-west-2".to_string(),
            snapshot_scan_interval: Duration::from_secs(60 * 60),
            firewall_url: None,
            enable_finalizers: false,
        }
    }
}
