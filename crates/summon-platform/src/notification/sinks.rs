//! Delivery targets for notifications and their HTTP implementations

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use summon_common::{Error, Result};
use tracing::debug;

use super::message::Attachment;

/// Chat API endpoint for posting messages
pub const SLACK_POST_MESSAGE_URL: &str = "https://slack.com/api/chat.postMessage";

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Posts attachments to chat channels
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SlackSink: Send + Sync {
    /// Post one attachment to `channel`
    async fn post(&self, channel: &str, attachment: &Attachment) -> Result<()>;
}

/// Body sent to the deploy tracker
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct DeployRecord {
    /// Instance name
    pub customer_name: String,
    /// dev, qa, uat or prod
    pub environment: String,
    /// Always the operator itself
    pub deploy_user: String,
    /// Version deployed
    pub tag: String,
}

/// Records deploys in the deploy tracker
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeployTracker: Send + Sync {
    /// POST `record` to `url`
    async fn record(&self, url: &str, record: &DeployRecord) -> Result<()>;
}

/// Starts regression tests against a freshly deployed instance
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RegressionWebhook: Send + Sync {
    /// Trigger the pipeline for `tenant` at `version`
    async fn trigger(&self, tenant: &str, version: &str) -> Result<()>;
}

fn http_client(sink: &str) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|e| Error::sink(sink, e.to_string()))
}

#[derive(Debug, Deserialize)]
struct SlackResponse {
    ok: bool,
    #[serde(default)]
    error: String,
}

/// [`SlackSink`] over the chat web API
pub struct HttpSlack {
    client: reqwest::Client,
    url: String,
    token: String,
}

impl HttpSlack {
    /// Client authenticating with `token`
    pub fn new(token: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: http_client("slack")?,
            url: SLACK_POST_MESSAGE_URL.to_string(),
            token: token.into(),
        })
    }

    /// Post somewhere other than the public API
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }
}

#[async_trait]
impl SlackSink for HttpSlack {
    async fn post(&self, channel: &str, attachment: &Attachment) -> Result<()> {
        let body = json!({ "channel": channel, "attachments": [attachment] });
        let response: SlackResponse = self
            .client
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::sink("slack", e.to_string()))?
            .json()
            .await
            .map_err(|e| Error::sink("slack", e.to_string()))?;
        if !response.ok {
            return Err(Error::sink("slack", response.error));
        }
        debug!(channel, title = %attachment.title, "posted to slack");
        Ok(())
    }
}

/// [`DeployTracker`] over HTTP
pub struct HttpDeployTracker {
    client: reqwest::Client,
}

impl HttpDeployTracker {
    /// Tracker client
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: http_client("deploy-status")?,
        })
    }
}

#[async_trait]
impl DeployTracker for HttpDeployTracker {
    async fn record(&self, url: &str, record: &DeployRecord) -> Result<()> {
        let response = self
            .client
            .post(url)
            .json(record)
            .send()
            .await
            .map_err(|e| Error::sink("deploy-status", e.to_string()))?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(Error::sink(
                "deploy-status",
                format!("unexpected status {status} from {url}"),
            ));
        }
        Ok(())
    }
}

/// CI pipeline parameters for a regression run
pub fn regression_payload(tenant: &str, version: &str) -> serde_json::Value {
    json!({
        "branch": "master",
        "parameters": {
            "deployment-regression-tests": true,
            "framework-tests": false,
            "tenant-name": tenant,
            "build-tag": version,
        },
    })
}

/// [`RegressionWebhook`] over the CI pipeline API
pub struct HttpRegressionWebhook {
    client: reqwest::Client,
    url: String,
    token: String,
}

impl HttpRegressionWebhook {
    /// Pipeline trigger at `url` authenticating with `token`
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: http_client("circleci")?,
            url: url.into(),
            token: token.into(),
        })
    }
}

#[async_trait]
impl RegressionWebhook for HttpRegressionWebhook {
    async fn trigger(&self, tenant: &str, version: &str) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .header("Circle-Token", &self.token)
            .json(&regression_payload(tenant, version))
            .send()
            .await
            .map_err(|e| Error::sink("circleci", e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::sink(
                "circleci",
                format!("pipeline trigger returned {}", response.status()),
            ));
        }
        Ok(())
    }
}
