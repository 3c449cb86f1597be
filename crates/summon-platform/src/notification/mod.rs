//! Exactly-once deploy and failure announcements
//!
//! Deliveries are deduplicated in a process-wide map keyed per instance and
//! component. A restart may repeat an announcement; one process never does.

mod message;
mod sinks;

pub use message::{
    deploy_attachment, error_attachment, parse_build_tag, Attachment, AttachmentField, BuildTag,
    COLOR_DANGER, COLOR_GOOD,
};
pub use sinks::{
    regression_payload, DeployRecord, DeployTracker, HttpDeployTracker, HttpRegressionWebhook,
    HttpSlack, RegressionWebhook, SlackSink, SLACK_POST_MESSAGE_URL,
};

use std::sync::Arc;

use dashmap::DashMap;
use kube::ResourceExt;
use summon_common::config::NotificationConfig;
use summon_common::crd::{NotificationStatus, SummonPlatform};
use summon_common::error::OBJECT_MODIFIED_MESSAGE;
use summon_common::{Result, OPERATOR_NAME};
use tracing::{info, warn};

/// Separately versioned parts of an instance whose deploys are announced
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Tracked {
    /// The platform itself
    Summon,
    /// Dispatch satellite
    Dispatch,
    /// Business portal satellite
    BusinessPortal,
    /// Trip share satellite
    TripShare,
    /// Hardware aux satellite
    HwAux,
}

impl Tracked {
    /// Every tracked component
    pub const ALL: [Tracked; 5] = [
        Tracked::Summon,
        Tracked::Dispatch,
        Tracked::BusinessPortal,
        Tracked::TripShare,
        Tracked::HwAux,
    ];

    /// Name used in dedup keys and messages
    pub fn name(self) -> &'static str {
        match self {
            Tracked::Summon => "summon",
            Tracked::Dispatch => "dispatch",
            Tracked::BusinessPortal => "businessPortal",
            Tracked::TripShare => "tripShare",
            Tracked::HwAux => "hwAux",
        }
    }

    fn repository(self) -> &'static str {
        match self {
            Tracked::Summon => "summon-platform",
            Tracked::Dispatch => "dispatch",
            Tracked::BusinessPortal => "business-portal",
            Tracked::TripShare => "trip-share",
            Tracked::HwAux => "hw-aux",
        }
    }

    /// Version the spec asks for
    pub fn desired(self, top: &SummonPlatform) -> &str {
        let spec = &top.spec;
        match self {
            Tracked::Summon => &spec.version,
            Tracked::Dispatch => &spec.dispatch.version,
            Tracked::BusinessPortal => &spec.business_portal.version,
            Tracked::TripShare => &spec.trip_share.version,
            Tracked::HwAux => &spec.hw_aux.version,
        }
    }

    /// Version last announced, as recorded in status
    pub fn announced(self, status: &NotificationStatus) -> &str {
        match self {
            Tracked::Summon => &status.summon_version,
            Tracked::Dispatch => &status.dispatch_version,
            Tracked::BusinessPortal => &status.business_portal_version,
            Tracked::TripShare => &status.trip_share_version,
            Tracked::HwAux => &status.hw_aux_version,
        }
    }

    /// Record `version` as announced
    pub fn set_announced(self, status: &mut NotificationStatus, version: String) {
        let slot = match self {
            Tracked::Summon => &mut status.summon_version,
            Tracked::Dispatch => &mut status.dispatch_version,
            Tracked::BusinessPortal => &mut status.business_portal_version,
            Tracked::TripShare => &mut status.trip_share_version,
            Tracked::HwAux => &mut status.hw_aux_version,
        };
        *slot = version;
    }
}

/// What a success pass delivered; recorded onto the status by the caller
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Components announced at a version, newly or earlier in this process
    pub announced: Vec<(Tracked, String)>,
    /// Version the regression pipeline was triggered for
    pub regression_version: Option<String>,
    /// Some sink failed; a later tick should retry
    pub incomplete: bool,
}

impl Delivery {
    /// Nothing to record
    pub fn is_empty(&self) -> bool {
        self.announced.is_empty() && self.regression_version.is_none()
    }

    /// Write the delivered versions into a notification status
    pub fn apply(&self, status: &mut NotificationStatus) {
        for (component, version) in &self.announced {
            component.set_announced(status, version.clone());
        }
        if let Some(version) = &self.regression_version {
            status.regression_tests_version = version.clone();
        }
    }
}

/// Process-wide notification dispatcher with dedup
#[derive(Default)]
pub struct NotificationEngine {
    slack: Option<Arc<dyn SlackSink>>,
    deploy_tracker: Option<Arc<dyn DeployTracker>>,
    default_deploy_url: String,
    regression: Option<Arc<dyn RegressionWebhook>>,
    sent: DashMap<String, String>,
}

impl NotificationEngine {
    /// Engine with no sinks; every delivery is a no-op
    pub fn new() -> Self {
        Self::default()
    }

    /// Sinks configured from operator settings
    pub fn from_config(config: &NotificationConfig) -> Result<Self> {
        let mut engine = Self::new();
        if config.slack_enabled() {
            engine = engine.with_slack(Arc::new(HttpSlack::new(config.slack_api_key.clone())?));
        }
        engine = engine.with_deploy_tracker(
            Arc::new(HttpDeployTracker::new()?),
            config.deploy_status_url.clone(),
        );
        if !config.circleci_api_key.is_empty() && !config.circleci_url.is_empty() {
            engine = engine.with_regression_webhook(Arc::new(HttpRegressionWebhook::new(
                config.circleci_url.clone(),
                config.circleci_api_key.clone(),
            )?));
        }
        Ok(engine)
    }

    /// Deliver chat messages through `sink`
    pub fn with_slack(mut self, sink: Arc<dyn SlackSink>) -> Self {
        self.slack = Some(sink);
        self
    }

    /// Record deploys through `tracker`; instances may override `default_url`
    pub fn with_deploy_tracker(mut self, tracker: Arc<dyn DeployTracker>, default_url: impl Into<String>) -> Self {
        self.deploy_tracker = Some(tracker);
        self.default_deploy_url = default_url.into();
        self
    }

    /// Trigger regression runs through `webhook`
    pub fn with_regression_webhook(mut self, webhook: Arc<dyn RegressionWebhook>) -> Self {
        self.regression = Some(webhook);
        self
    }

    fn instance_key(top: &SummonPlatform) -> String {
        format!("{}/{}", top.namespace().unwrap_or_default(), top.name_any())
    }

    async fn post_all(&self, top: &SummonPlatform, attachment: &Attachment) -> bool {
        let Some(slack) = &self.slack else {
            return true;
        };
        let mut ok = true;
        for channel in top.spec.notifications.channels() {
            if let Err(e) = slack.post(&channel, attachment).await {
                warn!(instance = %top.name_any(), channel = %channel, error = %e, "chat notification failed");
                ok = false;
            }
        }
        ok
    }

    async fn record_deploy(&self, top: &SummonPlatform, version: &str) -> bool {
        let Some(tracker) = &self.deploy_tracker else {
            return true;
        };
        let url = match top.spec.notifications.deploy_status_url.as_str() {
            "" => self.default_deploy_url.as_str(),
            url => url,
        };
        if url.is_empty() {
            return true;
        }
        let record = DeployRecord {
            customer_name: top.name_any(),
            environment: top.spec.environment.clone(),
            deploy_user: OPERATOR_NAME.to_string(),
            tag: version.to_string(),
        };
        match tracker.record(url, &record).await {
            Ok(()) => true,
            Err(e) => {
                warn!(instance = %top.name_any(), error = %e, "deploy tracker failed");
                false
            }
        }
    }

    /// Announce every tracked component whose version was not announced yet.
    ///
    /// Call only while the instance is `Ready`.
    pub async fn notify_success(&self, top: &SummonPlatform) -> Result<Delivery> {
        let instance = Self::instance_key(top);
        let status = top.status_or_default();
        let mut delivery = Delivery::default();

        for component in Tracked::ALL {
            let version = component.desired(top);
            if version.is_empty() || component.announced(&status.notification) == version {
                continue;
            }
            let key = format!("{}/{}", instance, component.name());
            if self.sent.get(&key).is_some_and(|v| v.as_str() == version) {
                delivery.announced.push((component, version.to_string()));
                continue;
            }

            let attachment = deploy_attachment(top, component.name(), component.repository(), version);
            let mut ok = self.post_all(top, &attachment).await;
            if component == Tracked::Summon {
                ok &= self.record_deploy(top, version).await;
            }
            if ok {
                info!(instance = %instance, component = component.name(), version, "announced deploy");
                self.sent.insert(key, version.to_string());
                delivery.announced.push((component, version.to_string()));
            } else {
                delivery.incomplete = true;
            }
        }

        let version = &top.spec.version;
        let wants_regression = top.spec.notifications.circleci_regression_webhook
            && !version.is_empty()
            && status.notification.regression_tests_version != *version;
        if let (true, Some(webhook)) = (wants_regression, &self.regression) {
            match webhook.trigger(&top.name_any(), version).await {
                Ok(()) => {
                    info!(instance = %instance, version = %version, "triggered regression tests");
                    delivery.regression_version = Some(version.clone());
                }
                Err(e) => {
                    warn!(instance = %instance, error = %e, "regression webhook failed");
                    delivery.incomplete = true;
                }
            }
        }
        Ok(delivery)
    }

    /// Announce a failure once per instance, version and message
    pub async fn notify_error(&self, top: &SummonPlatform, message: &str) -> Result<()> {
        if message.is_empty() || message.contains(OBJECT_MODIFIED_MESSAGE) {
            return Ok(());
        }
        let key = format!("{}/{}", Self::instance_key(top), top.spec.version);
        let value = format!("ERROR {message}");
        if self.sent.get(&key).is_some_and(|v| *v == value) {
            return Ok(());
        }
        if self.post_all(top, &error_attachment(top, message)).await {
            self.sent.insert(key, value);
        }
        Ok(())
    }
}
