//! Schema migrations and the optional pause that follows them

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::core::ApiResource;
use summon_common::config::PlatformConfig;
use summon_common::crd::{ChildPhase, MigrationJob, PlatformPhase, SummonPlatform};
use summon_common::{extras, Error};
use summon_engine::{api_resource, copy_desired, Component, ReconcileResult};
use tracing::info;

use super::workloads::summon_image;
use super::{child_name, postgres_ready, rabbitmq_ready, ChildStatus, Ctx, Outcome};
use crate::templates;

/// Shell command run by the migration job
pub(crate) fn migration_command(top: &SummonPlatform) -> String {
    let migrated = top
        .status
        .as_ref()
        .map(|s| s.migrate_version.as_str())
        .unwrap_or_default();
    let first_install = migrated.is_empty();
    let flavor = top.spec.flavor.as_str();
    let load_flavor = first_install && !flavor.is_empty();

    let mut steps = Vec::new();
    if load_flavor {
        steps.push(format!("python manage.py fetch_flavor {flavor}"));
    }
    if !first_install && !top.spec.database.migration_overrides.skip_core1540_fixup {
        steps.push("python manage.py core_1540_pre_migrate".to_string());
    }
    steps.push("python manage.py migrate --noinput".to_string());
    if load_flavor {
        steps.push(format!("python manage.py loadflavor {flavor}"));
    }
    steps.join(" && ")
}

fn set_phase(phase: PlatformPhase, message: &'static str) -> ReconcileResult<SummonPlatform> {
    ReconcileResult::modify(move |top: &mut SummonPlatform| {
        let status = top.status_mut();
        status.status = phase;
        status.message = message.to_string();
        Ok(())
    })
}

/// Phase of `job`, or `Running` while its status still describes an older version
fn job_phase_for(job: &MigrationJob, version: &str) -> ChildPhase {
    match &job.status {
        Some(status) if status.version == version => status.status,
        _ => ChildPhase::Running,
    }
}

fn post_migrate_wait(top: &SummonPlatform) -> Duration {
    top.spec.waits.post_migrate.unwrap_or_default()
}

/// Runs `manage.py migrate` for each new version
pub struct Migrations {
    config: Arc<PlatformConfig>,
}

impl Migrations {
    /// Migrations using images from the configured repository
    pub fn new(config: Arc<PlatformConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Component<SummonPlatform> for Migrations {
    fn name(&self) -> &'static str {
        "migrations"
    }

    fn watch_types(&self) -> Vec<ApiResource> {
        vec![api_resource::<MigrationJob>()]
    }

    fn is_reconcilable(&self, ctx: &Ctx) -> bool {
        let top = &ctx.top;
        let Some(status) = &top.status else {
            return false;
        };
        postgres_ready(top) && rabbitmq_ready(top) && status.status != PlatformPhase::PostMigrateWait
    }

    async fn reconcile(&self, ctx: &mut Ctx) -> Outcome {
        let version = ctx.top.spec.version.clone();
        let status = ctx.top.status_or_default();
        if version.is_empty() || status.backup_version != version {
            return Ok(ReconcileResult::done());
        }
        if status.migrate_version == version {
            if status.status.allows_workloads() {
                return Ok(ReconcileResult::done());
            }
            return Ok(set_phase(PlatformPhase::Deploying, "Deploying"));
        }

        let extra = extras! {
            "image" => summon_image(&self.config, &version),
            "command" => migration_command(&ctx.top),
        };
        let job = ctx
            .create_or_update::<MigrationJob, _>(templates::MIGRATIONS, Some(&extra), copy_desired)
            .await?
            .object;

        match job_phase_for(&job, &version) {
            ChildPhase::Error => Err(Error::child_failed("migrations", job.child_message())),
            ChildPhase::Ready => {
                ctx.delete::<MigrationJob>(&child_name(&ctx.top, '-', "migrations"))
                    .await?;
                info!(instance = %ctx.name(), version = %version, "migrations complete");
                let waiting = !post_migrate_wait(&ctx.top).is_zero();
                Ok(ReconcileResult::modify(move |top: &mut SummonPlatform| {
                    let status = top.status_mut();
                    status.migrate_version = version.clone();
                    if waiting {
                        status.status = PlatformPhase::PostMigrateWait;
                        status.message = "Waiting after migrations".to_string();
                    } else {
                        status.status = PlatformPhase::Deploying;
                        status.message = "Deploying".to_string();
                    }
                    Ok(())
                }))
            }
            _ => Ok(set_phase(PlatformPhase::Migrating, "Running migrations")),
        }
    }
}

/// Holds the rollout for `spec.waits.postMigrate` after migrations finish
pub struct MigrateWait;

#[async_trait]
impl Component<SummonPlatform> for MigrateWait {
    fn name(&self) -> &'static str {
        "migrate-wait"
    }

    fn is_reconcilable(&self, ctx: &Ctx) -> bool {
        ctx.top.phase() == PlatformPhase::PostMigrateWait
    }

    async fn reconcile(&self, ctx: &mut Ctx) -> Outcome {
        let wait = post_migrate_wait(&ctx.top);
        let now = ctx.now();
        let until = ctx.top.status.as_ref().and_then(|s| s.wait.until);
        let elapsed = match until {
            _ if wait.is_zero() => true,
            Some(until) => until <= now,
            None => {
                let until = chrono::Duration::from_std(wait)
                    .ok()
                    .and_then(|w| now.checked_add_signed(w))
                    .ok_or_else(|| Error::validation_for(ctx.name(), "spec.waits.postMigrate is out of range"))?;
                return Ok(ReconcileResult::requeue_after(wait).with_modifier(
                    move |top: &mut SummonPlatform| {
                        top.status_mut().wait.until = Some(until);
                        Ok(())
                    },
                ));
            }
        };
        if !elapsed {
            return Ok(ReconcileResult::requeue_after(wait));
        }
        Ok(ReconcileResult::modify(|top: &mut SummonPlatform| {
            let status = top.status_mut();
            status.status = PlatformPhase::Deploying;
            status.message = "Deploying".to_string();
            status.wait.until = None;
            Ok(())
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use summon_common::crd::{
        MigrationJobSpec, MigrationJobStatus, SummonPlatformSpec, SummonPlatformStatus,
    };

    fn platform(migrated: &str, flavor: &str, skip_fixup: bool) -> SummonPlatform {
        let mut spec = SummonPlatformSpec {
            version: "2".into(),
            flavor: flavor.into(),
            ..Default::default()
        };
        spec.database.migration_overrides.skip_core1540_fixup = skip_fixup;
        let mut p = SummonPlatform::new("foo", spec);
        p.status = Some(SummonPlatformStatus {
            migrate_version: migrated.into(),
            ..Default::default()
        });
        p
    }

    #[test]
    fn first_install_loads_flavor_around_migrate() {
        assert_eq!(
            migration_command(&platform("", "demo", false)),
            "python manage.py fetch_flavor demo && python manage.py migrate --noinput && python manage.py loadflavor demo"
        );
    }

    #[test]
    fn upgrades_run_fixup_unless_opted_out() {
        assert_eq!(
            migration_command(&platform("1", "demo", false)),
            "python manage.py core_1540_pre_migrate && python manage.py migrate --noinput"
        );
        assert_eq!(
            migration_command(&platform("1", "", true)),
            "python manage.py migrate --noinput"
        );
    }

    fn job_with(phase: ChildPhase, observed: &str) -> MigrationJob {
        let mut job = MigrationJob::new("foo-migrations", MigrationJobSpec::default());
        job.status = Some(MigrationJobStatus {
            status: phase,
            message: "relation does not exist".into(),
            version: observed.into(),
        });
        job
    }

    #[test]
    fn outcome_of_an_older_version_is_ignored() {
        assert_eq!(job_phase_for(&job_with(ChildPhase::Error, "1"), "2"), ChildPhase::Running);
        assert_eq!(job_phase_for(&job_with(ChildPhase::Ready, "1"), "2"), ChildPhase::Running);
        assert_eq!(job_phase_for(&job_with(ChildPhase::Error, "2"), "2"), ChildPhase::Error);
        assert_eq!(
            job_phase_for(&MigrationJob::new("foo-migrations", MigrationJobSpec::default()), "2"),
            ChildPhase::Running
        );
    }
}
