//! Autodeploy image tag cache
//!
//! One process-wide listing of built image tags, refreshed at most every
//! [`TAG_CACHE_EXPIRY`]. A background refresher also wakes every
//! autodeploying instance when the listing changes, so new builds roll out
//! without waiting for an unrelated event.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use summon_common::config::TAG_CACHE_EXPIRY;
use summon_common::crd::SummonPlatform;
use summon_common::{Error, Result};
use summon_engine::{api_resource, from_dynamic, ClusterClient, ObjectKey};

const MAX_BRANCH_LEN: usize = 48;

/// Where tag listings come from
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TagSource: Send + Sync {
    /// Every tag in the workload image repository
    async fn list_tags(&self) -> Result<Vec<String>>;
}

/// Docker registry v2 tag listing
pub struct RegistryTagSource {
    http: reqwest::Client,
    url: String,
    password: Option<String>,
}

#[derive(Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Vec<String>,
}

impl RegistryTagSource {
    /// Tags of `image_repository` (`host/path/name`) via `registry_url`.
    /// A non-empty `service_account_key` is sent as `_json_key` basic auth.
    pub fn new(registry_url: &str, image_repository: &str, service_account_key: &str) -> Self {
        let path = image_repository
            .split_once('/')
            .map(|(_, p)| p)
            .unwrap_or(image_repository);
        Self {
            http: reqwest::Client::new(),
            url: format!("{}/v2/{}/tags/list", registry_url.trim_end_matches('/'), path),
            password: (!service_account_key.is_empty()).then(|| service_account_key.to_string()),
        }
    }
}

#[async_trait]
impl TagSource for RegistryTagSource {
    async fn list_tags(&self) -> Result<Vec<String>> {
        let mut req = self.http.get(&self.url);
        if let Some(password) = &self.password {
            req = req.basic_auth("_json_key", Some(password));
        }
        let resp = req
            .send()
            .await
            .map_err(|e| Error::internal_with_context("tag-cache", e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Error::internal_with_context(
                "tag-cache",
                format!("registry returned {}", resp.status()),
            ));
        }
        let list: TagList = resp
            .json()
            .await
            .map_err(|e| Error::internal_with_context("tag-cache", e.to_string()))?;
        Ok(list.tags)
    }
}

struct StaticTags(Vec<String>);

#[async_trait]
impl TagSource for StaticTags {
    async fn list_tags(&self) -> Result<Vec<String>> {
        Ok(self.0.clone())
    }
}

#[derive(Default)]
struct CacheState {
    fetched_at: Option<Instant>,
    tags: Arc<Vec<String>>,
}

/// Time-stamped tag listing shared by every reconcile
pub struct TagCache {
    source: Arc<dyn TagSource>,
    ttl: Duration,
    state: RwLock<CacheState>,
}

impl TagCache {
    /// Cache over `source` with the standard expiry
    pub fn new(source: Arc<dyn TagSource>) -> Self {
        Self::with_ttl(source, TAG_CACHE_EXPIRY)
    }

    /// Cache over `source` with a custom expiry
    pub fn with_ttl(source: Arc<dyn TagSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            state: RwLock::new(CacheState::default()),
        }
    }

    /// Cache that always lists `tags`
    pub fn fixed(tags: Vec<String>) -> Self {
        Self::new(Arc::new(StaticTags(tags)))
    }

    /// Current listing, refreshed first if stale
    pub async fn tags(&self) -> Result<Arc<Vec<String>>> {
        {
            let state = self.state.read().await;
            if state.fetched_at.is_some_and(|at| at.elapsed() < self.ttl) {
                return Ok(state.tags.clone());
            }
        }
        self.refresh().await?;
        Ok(self.state.read().await.tags.clone())
    }

    /// Fetch a new listing; returns whether it differs from the previous one
    pub async fn refresh(&self) -> Result<bool> {
        let mut tags = self.source.list_tags().await?;
        tags.sort();
        let mut state = self.state.write().await;
        let changed = state.tags.as_slice() != tags.as_slice();
        state.tags = Arc::new(tags);
        state.fetched_at = Some(Instant::now());
        Ok(changed)
    }
}

/// Make a branch name safe for tag matching
///
/// Truncated to 48 characters, trailing non-alphanumerics become `x`, and any
/// other character outside `[A-Za-z0-9_.-]` becomes `-`.
pub fn sanitize_branch(branch: &str) -> String {
    let mut chars: Vec<char> = branch.chars().take(MAX_BRANCH_LEN).collect();
    for c in chars.iter_mut().rev() {
        if c.is_ascii_alphanumeric() {
            break;
        }
        *c = 'x';
    }
    chars
        .into_iter()
        .map(|c| match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '_' | '.' | '-' => c,
            _ => '-',
        })
        .collect()
}

/// Newest `<build>-<sha>-<branch>` tag for an already sanitised branch
pub fn select_tag(tags: &[String], branch: &str) -> Option<String> {
    let pattern = format!(r"^(\d+)-[0-9a-fA-F]+-{}$", regex::escape(branch));
    let re = Regex::new(&pattern).ok()?;
    tags.iter()
        .filter_map(|tag| {
            let build: u64 = re.captures(tag)?.get(1)?.as_str().parse().ok()?;
            Some((build, tag))
        })
        .max_by_key(|(build, _)| *build)
        .map(|(_, tag)| tag.clone())
}

/// Refresh `cache` every expiry period and wake autodeploying instances when
/// the listing changes. Returns when `shutdown` fires.
pub async fn run_refresher(
    cache: Arc<TagCache>,
    client: Arc<dyn ClusterClient>,
    triggers: mpsc::Sender<ObjectKey>,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(cache.ttl);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("tag cache refresher stopping");
                return;
            }
            _ = ticker.tick() => {}
        }
        match cache.refresh().await {
            Ok(false) => debug!("image tags unchanged"),
            Ok(true) => {
                if let Err(e) = wake_autodeployers(client.as_ref(), &triggers).await {
                    warn!(error = %e, "failed to enqueue autodeploy instances");
                }
            }
            Err(e) => warn!(error = %e, "image tag refresh failed"),
        }
    }
}

async fn wake_autodeployers(
    client: &dyn ClusterClient,
    triggers: &mpsc::Sender<ObjectKey>,
) -> Result<()> {
    let ar = api_resource::<SummonPlatform>();
    for obj in client.list(&ar, "", "").await? {
        let platform: SummonPlatform = from_dynamic(obj)?;
        if platform.spec.auto_deploy.is_empty() {
            continue;
        }
        let key = ObjectKey::of(&platform);
        debug!(instance = %key, "new image tags, waking autodeploy instance");
        if triggers.send(key).await.is_err() {
            return Err(Error::internal_with_context(
                "tag-cache",
                "platform controller trigger channel closed",
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[rstest]
    #[case("TestTag", "TestTag")]
    #[case("feature/foo", "feature-foo")]
    #[case("fix-", "fixx")]
    #[case("wip!!", "wipxx")]
    #[case("a b+c", "a-b-c")]
    fn branch_sanitising(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(sanitize_branch(input), expected);
    }

    #[test]
    fn long_branches_are_truncated() {
        let branch = "a".repeat(60);
        assert_eq!(sanitize_branch(&branch).len(), 48);
    }

    #[test]
    fn newest_build_wins_and_other_branches_are_ignored() {
        let t = tags(&["11-95ac60f-TestTag", "15-ab0f6c1-TestTag", "16-de0a8fb-TestTag2"]);
        assert_eq!(select_tag(&t, "TestTag").as_deref(), Some("15-ab0f6c1-TestTag"));
        assert_eq!(select_tag(&t, "TestTag2").as_deref(), Some("16-de0a8fb-TestTag2"));
        assert_eq!(select_tag(&t, "Other"), None);
    }

    #[test]
    fn build_numbers_compare_numerically() {
        let t = tags(&["9-aaaaaaa-main", "10-bbbbbbb-main"]);
        assert_eq!(select_tag(&t, "main").as_deref(), Some("10-bbbbbbb-main"));
    }

    #[test]
    fn branch_with_regex_characters_is_matched_literally() {
        let t = tags(&["3-abc1234-release.1", "4-abc1234-releasex1"]);
        assert_eq!(select_tag(&t, "release.1").as_deref(), Some("3-abc1234-release.1"));
    }

    #[tokio::test]
    async fn cache_serves_from_memory_until_expiry() {
        let mut source = MockTagSource::new();
        source
            .expect_list_tags()
            .times(1)
            .returning(|| Ok(vec!["1-abc-main".to_string()]));
        let cache = TagCache::with_ttl(Arc::new(source), Duration::from_secs(300));
        assert_eq!(cache.tags().await.unwrap().len(), 1);
        assert_eq!(cache.tags().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn refresh_reports_changes() {
        let mut source = MockTagSource::new();
        let mut calls = 0;
        source.expect_list_tags().times(3).returning(move || {
            calls += 1;
            Ok(if calls < 3 {
                vec!["1-abc-main".to_string()]
            } else {
                vec!["1-abc-main".to_string(), "2-def-main".to_string()]
            })
        });
        let cache = TagCache::new(Arc::new(source));
        assert!(cache.refresh().await.unwrap());
        assert!(!cache.refresh().await.unwrap());
        assert!(cache.refresh().await.unwrap());
    }

    #[tokio::test]
    async fn registry_errors_propagate() {
        let mut source = MockTagSource::new();
        source
            .expect_list_tags()
            .returning(|| Err(Error::internal_with_context("tag-cache", "unreachable")));
        let cache = TagCache::new(Arc::new(source));
        assert!(cache.tags().await.is_err());
    }
}
