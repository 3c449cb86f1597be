//! Node firewall allow-list
//!
//! Runs on Node create and delete only. Every tick lists the cluster's
//! nodes, collects their external addresses and, when the set changed since
//! the last successful push, sends it to the firewall broker.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use serde::Serialize;
use summon_common::{Error, Result};
use summon_engine::{ClusterClient, Component, ComponentContext, Engine, ReconcileResult};
use tokio::sync::Mutex;
use tracing::info;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// One allow rule
#[derive(Clone, Debug, Serialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct FirewallRule {
    /// Source range, a single host
    pub cidr: String,
    /// Node the address belongs to
    pub description: String,
}

/// Receives the full rule list on every change
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FirewallSink: Send + Sync {
    /// Replace the allow-list with `rules`
    async fn push(&self, rules: &[FirewallRule]) -> Result<()>;
}

/// [`FirewallSink`] that only logs, for clusters without a broker
pub struct LoggingFirewall;

#[async_trait]
impl FirewallSink for LoggingFirewall {
    async fn push(&self, rules: &[FirewallRule]) -> Result<()> {
        let cidrs: Vec<&str> = rules.iter().map(|r| r.cidr.as_str()).collect();
        info!(rules = ?cidrs, "computed node firewall rules");
        Ok(())
    }
}

/// [`FirewallSink`] over the broker's HTTP API
pub struct HttpFirewall {
    client: reqwest::Client,
    url: String,
}

impl HttpFirewall {
    /// Broker client for `url`
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::sink("firewall", e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[derive(Serialize)]
struct RuleList<'a> {
    rules: &'a [FirewallRule],
}

#[async_trait]
impl FirewallSink for HttpFirewall {
    async fn push(&self, rules: &[FirewallRule]) -> Result<()> {
        let response = self
            .client
            .put(&self.url)
            .json(&RuleList { rules })
            .send()
            .await
            .map_err(|e| Error::sink("firewall", e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::sink(
                "firewall",
                format!("broker returned {}", response.status()),
            ));
        }
        Ok(())
    }
}

/// Allow rules for every external address, sorted
pub fn node_rules(nodes: &[Node]) -> Vec<FirewallRule> {
    let rules: BTreeSet<FirewallRule> = nodes
        .iter()
        .flat_map(|node| {
            let name = node.metadata.name.clone().unwrap_or_default();
            node.status
                .iter()
                .flat_map(|s| s.addresses.iter().flatten())
                .filter(|a| a.type_ == "ExternalIP" && !a.address.is_empty())
                .map(move |a| FirewallRule {
                    cidr: format!("{}/32", a.address),
                    description: name.clone(),
                })
        })
        .collect();
    rules.into_iter().collect()
}

/// Pushes the node allow-list when it changes
pub struct SyncFirewall {
    sink: Arc<dyn FirewallSink>,
    last_pushed: Mutex<Option<Vec<FirewallRule>>>,
}

impl SyncFirewall {
    /// Sync through `sink`
    pub fn new(sink: Arc<dyn FirewallSink>) -> Self {
        Self {
            sink,
            last_pushed: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Component<Node> for SyncFirewall {
    fn name(&self) -> &'static str {
        "firewall"
    }

    fn is_reconcilable(&self, _ctx: &ComponentContext<Node>) -> bool {
        true
    }

    async fn reconcile(&self, ctx: &mut ComponentContext<Node>) -> Result<ReconcileResult<Node>> {
        let nodes = ctx.list_in::<Node>("", "").await?;
        let rules = node_rules(&nodes);

        let mut last = self.last_pushed.lock().await;
        if last.as_ref() == Some(&rules) {
            return Ok(ReconcileResult::done());
        }
        ctx.guard(self.sink.push(&rules)).await?;
        info!(nodes = nodes.len(), rules = rules.len(), "pushed node firewall rules");
        *last = Some(rules);
        Ok(ReconcileResult::done())
    }
}

/// Node firewall engine
pub fn engine(client: Arc<dyn ClusterClient>, sink: Arc<dyn FirewallSink>) -> Engine<Node> {
    Engine::builder("firewall", client)
        .create_delete_only()
        .component(SyncFirewall::new(sink))
        .build()
}
