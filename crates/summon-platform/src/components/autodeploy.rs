use std::sync::Arc;

use async_trait::async_trait;
use summon_common::crd::SummonPlatform;
use summon_common::Error;
use summon_engine::{Component, ReconcileResult};
use tracing::debug;

use super::{Ctx, Outcome};
use crate::tag_cache::{sanitize_branch, select_tag, TagCache};

/// Resolves `spec.autoDeploy` to the newest built tag of that branch
pub struct AutoDeploy {
    cache: Arc<TagCache>,
}

impl AutoDeploy {
    /// Resolve against `cache`
    pub fn new(cache: Arc<TagCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl Component<SummonPlatform> for AutoDeploy {
    fn name(&self) -> &'static str {
        "autodeploy"
    }

    fn is_reconcilable(&self, ctx: &Ctx) -> bool {
        !ctx.top.spec.auto_deploy.trim().is_empty()
    }

    async fn reconcile(&self, ctx: &mut Ctx) -> Outcome {
        if !ctx.top.spec.version.is_empty() {
            return Ok(ReconcileResult::done());
        }
        let branch = sanitize_branch(&ctx.top.spec.auto_deploy);
        let tags = ctx.guard(self.cache.tags()).await?;
        let tag = select_tag(&tags, &branch).ok_or_else(|| {
            Error::validation_for(
                ctx.name(),
                format!("no image tag found for autoDeploy branch {}", branch),
            )
        })?;
        debug!(instance = %ctx.name(), branch = %branch, tag = %tag, "resolved autodeploy tag");
        ctx.top.spec.version = tag;
        Ok(ReconcileResult::done())
    }
}
