//! Workload readiness aggregation

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use summon_common::crd::{PlatformPhase, SummonPlatform};
use summon_common::Result;
use summon_engine::{Component, ReconcileResult};
use tracing::debug;

use super::workloads::Role;
use super::{Ctx, Outcome};

const DEFAULT_ROLES: &[Role] = &[
    Role::Web,
    Role::Daphne,
    Role::Celeryd,
    Role::ChannelWorker,
    Role::Static,
    Role::CeleryBeat,
];

const EXTENDED_ROLES: &[Role] = &[
    Role::Dispatch,
    Role::BusinessPortal,
    Role::TripShare,
    Role::HwAux,
    Role::KafkaConsumer,
];

/// Rollout of a workload has finished: updated and ready replica counts
/// both equal the declared count. An undeclared count is never ready.
pub fn workload_ready(declared: Option<i32>, updated: Option<i32>, ready: Option<i32>) -> bool {
    match declared {
        Some(n) => updated.unwrap_or(0) == n && ready.unwrap_or(0) == n,
        None => false,
    }
}

fn deployment_ready(d: &Deployment) -> bool {
    let declared = d.spec.as_ref().and_then(|s| s.replicas);
    let status = d.status.clone().unwrap_or_default();
    workload_ready(declared, status.updated_replicas, status.ready_replicas)
        && status.unavailable_replicas.unwrap_or(0) == 0
}

fn statefulset_ready(s: &StatefulSet) -> bool {
    let declared = s.spec.as_ref().and_then(|s| s.replicas);
    let status = s.status.clone().unwrap_or_default();
    workload_ready(declared, status.updated_replicas, status.ready_replicas)
}

/// Marks the instance `Ready` once every expected workload rolled out
pub struct StatusAggregator {
    extended: bool,
}

impl StatusAggregator {
    /// `extended` adds the satellites and the kafka consumer to the
    /// expected set when they are enabled
    pub fn new(extended: bool) -> Self {
        Self { extended }
    }

    fn expected(&self, top: &SummonPlatform) -> Vec<Role> {
        let mut roles = DEFAULT_ROLES.to_vec();
        if self.extended {
            roles.extend(EXTENDED_ROLES.iter().copied().filter(|r| r.enabled(top)));
        }
        roles
    }

    async fn role_ready(&self, ctx: &Ctx, role: Role) -> Result<bool> {
        let name = role.object_name(&ctx.top);
        let ready = if role.is_stateful() {
            ctx.get::<StatefulSet>(&name).await?.is_some_and(|s| statefulset_ready(&s))
        } else {
            ctx.get::<Deployment>(&name).await?.is_some_and(|d| deployment_ready(&d))
        };
        Ok(ready)
    }
}

#[async_trait]
impl Component<SummonPlatform> for StatusAggregator {
    fn name(&self) -> &'static str {
        "status"
    }

    fn is_reconcilable(&self, ctx: &Ctx) -> bool {
        ctx.top.phase() == PlatformPhase::Deploying
    }

    async fn reconcile(&self, ctx: &mut Ctx) -> Outcome {
        for role in self.expected(&ctx.top) {
            if !self.role_ready(ctx, role).await? {
                debug!(instance = %ctx.name(), role = role.name(), "waiting for workload");
                return Ok(ReconcileResult::done());
            }
        }
        let message = format!("Cluster {} ready", ctx.name());
        Ok(ReconcileResult::modify(move |top: &mut SummonPlatform| {
            let status = top.status_mut();
            status.status = PlatformPhase::Ready;
            status.message = message.clone();
            Ok(())
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{DeploymentSpec, DeploymentStatus};
    use rstest::rstest;
    use summon_common::crd::SummonPlatformSpec;

    #[rstest]
    #[case(Some(2), Some(2), Some(2), true)]
    #[case(Some(2), Some(1), Some(2), false)]
    #[case(Some(2), Some(2), Some(1), false)]
    #[case(Some(0), None, None, true)]
    #[case(None, Some(1), Some(1), false)]
    fn readiness_rule(
        #[case] declared: Option<i32>,
        #[case] updated: Option<i32>,
        #[case] ready: Option<i32>,
        #[case] expected: bool,
    ) {
        assert_eq!(workload_ready(declared, updated, ready), expected);
    }

    #[test]
    fn deployments_also_need_zero_unavailable() {
        let mut d = Deployment {
            spec: Some(DeploymentSpec {
                replicas: Some(2),
                ..Default::default()
            }),
            status: Some(DeploymentStatus {
                updated_replicas: Some(2),
                ready_replicas: Some(2),
                unavailable_replicas: Some(1),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(!deployment_ready(&d));
        if let Some(status) = d.status.as_mut() {
            status.unavailable_replicas = None;
        }
        assert!(deployment_ready(&d));
    }

    #[test]
    fn extended_check_only_adds_enabled_roles() {
        let mut p = SummonPlatform::new("foo", SummonPlatformSpec::default());
        p.spec.dispatch.version = "1".into();
        assert_eq!(StatusAggregator::new(false).expected(&p).len(), DEFAULT_ROLES.len());
        let extended = StatusAggregator::new(true).expected(&p);
        assert_eq!(extended.len(), DEFAULT_ROLES.len() + 1);
        assert_eq!(extended.last(), Some(&Role::Dispatch));
    }
}
