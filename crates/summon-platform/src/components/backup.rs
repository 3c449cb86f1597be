//! Pre-migration database snapshot

use async_trait::async_trait;
use kube::core::ApiResource;
use summon_common::crd::{ChildPhase, PlatformPhase, RDSSnapshot, SummonPlatform};
use summon_common::template::filters::dns_label;
use summon_common::{extras, Error};
use summon_engine::{api_resource, copy_desired, Component, ReconcileResult};
use tracing::info;

use super::{postgres_ready, ChildStatus, Ctx, Outcome};
use crate::templates;

/// Snapshots the database once per version before migrations run
pub struct Backup;

/// Name of the snapshot taken before migrating to `version`
pub(crate) fn snapshot_name(instance: &str, version: &str) -> String {
    format!("{}-{}", instance, dns_label(version))
}

fn mark_backed_up(version: String) -> ReconcileResult<SummonPlatform> {
    ReconcileResult::modify(move |top: &mut SummonPlatform| {
        let status = top.status_mut();
        status.backup_version = version.clone();
        status.status = PlatformPhase::Migrating;
        status.message = "Running migrations".to_string();
        Ok(())
    })
}

#[async_trait]
impl Component<SummonPlatform> for Backup {
    fn name(&self) -> &'static str {
        "backup"
    }

    fn watch_types(&self) -> Vec<ApiResource> {
        vec![api_resource::<RDSSnapshot>()]
    }

    fn is_reconcilable(&self, ctx: &Ctx) -> bool {
        postgres_ready(&ctx.top) && ctx.top.status.is_some()
    }

    async fn reconcile(&self, ctx: &mut Ctx) -> Outcome {
        // autodeploy resolves the version during the tick, after gating
        let version = ctx.top.spec.version.clone();
        if version.is_empty() || ctx.top.status_or_default().backup_version == version {
            return Ok(ReconcileResult::done());
        }
        let instance_id = ctx
            .top
            .status
            .as_ref()
            .and_then(|s| s.postgres_connection.as_ref())
            .map(|c| c.instance_id.clone())
            .unwrap_or_default();

        if instance_id.is_empty() {
            return Ok(mark_backed_up(version));
        }

        let extra = extras! {
            "snapshot_name" => snapshot_name(&ctx.name(), &version),
            "instance_id" => instance_id,
        };
        let converged = ctx
            .create_or_update::<RDSSnapshot, _>(templates::RDS_SNAPSHOT, Some(&extra), copy_desired)
            .await?;
        if converged.created {
            info!(instance = %ctx.name(), version = %version, "requested pre-migration snapshot");
        }

        if ctx.top.spec.backup.wait_until_ready == Some(false) {
            return Ok(mark_backed_up(version));
        }
        let snapshot = converged.object;
        match snapshot.child_phase() {
            ChildPhase::Ready => Ok(mark_backed_up(version)),
            ChildPhase::Error => Err(Error::child_failed("backup", snapshot.child_message())),
            _ => Ok(ReconcileResult::modify(|top: &mut SummonPlatform| {
                let status = top.status_mut();
                status.status = PlatformPhase::CreatingBackup;
                status.message = "Creating database snapshot".to_string();
                Ok(())
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_names_are_dns_safe() {
        assert_eq!(snapshot_name("foo", "1234-abc1234-master"), "foo-1234-abc1234-master");
        assert_eq!(snapshot_name("foo", "1.2_RC"), "foo-1-2-rc");
    }
}
