//! MigrationJob: runs the migration Job for one version
//!
//! The child Job carries the version it was created for. A version change
//! replaces the Job; Jobs are immutable once started. With finalizers on,
//! the Job is deleted before the MigrationJob is let go.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use kube::api::ObjectMeta;
use kube::core::ApiResource;
use summon_common::crd::{ChildPhase, MigrationJob};
use summon_common::{flag_set, Result, SKIP_FINALIZER_ANNOTATION};
use summon_engine::{
    api_resource, ClusterClient, Component, ComponentContext, Engine, ReconcileResult,
};
use tracing::info;

/// Finalizer guarding the child Job
pub const FINALIZER: &str = "migrationjob.summon.ridecell.io";

/// Annotation on the Job naming the version it migrates to
pub const VERSION_ANNOTATION: &str = "summon.ridecell.io/migration-version";

const RESTART_DELAY: Duration = Duration::from_secs(5);

/// Job outcome as a child phase plus message
pub fn job_phase(job: &Job) -> (ChildPhase, String) {
    let Some(status) = &job.status else {
        return (ChildPhase::Running, String::new());
    };
    if status.succeeded.unwrap_or(0) > 0 {
        return (ChildPhase::Ready, String::new());
    }
    let failed = status
        .conditions
        .iter()
        .flatten()
        .find(|c| c.type_ == "Failed" && c.status == "True");
    match failed {
        Some(c) => {
            let message = c
                .message
                .clone()
                .or_else(|| c.reason.clone())
                .unwrap_or_else(|| "migration job failed".to_string());
            (ChildPhase::Error, message)
        }
        None => (ChildPhase::Running, String::new()),
    }
}

fn desired_job(top: &MigrationJob) -> Job {
    Job {
        metadata: ObjectMeta {
            name: top.metadata.name.clone(),
            namespace: top.metadata.namespace.clone(),
            labels: top.metadata.labels.clone(),
            annotations: Some(BTreeMap::from([(
                VERSION_ANNOTATION.to_string(),
                top.spec.version.clone(),
            )])),
            ..Default::default()
        },
        spec: Some(top.spec.template.clone()),
        ..Default::default()
    }
}

fn job_version(job: &Job) -> Option<&str> {
    job.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(VERSION_ANNOTATION))
        .map(String::as_str)
}

fn with_phase(
    result: ReconcileResult<MigrationJob>,
    version: String,
    phase: ChildPhase,
    message: String,
) -> ReconcileResult<MigrationJob> {
    result.with_modifier(move |top: &mut MigrationJob| {
        let status = top.status.get_or_insert_with(Default::default);
        status.status = phase;
        status.message = message.clone();
        status.version = version.clone();
        Ok(())
    })
}

/// Owns the child Job
pub struct RunMigration;

#[async_trait]
impl Component<MigrationJob> for RunMigration {
    fn name(&self) -> &'static str {
        "job"
    }

    fn watch_types(&self) -> Vec<ApiResource> {
        vec![api_resource::<Job>()]
    }

    fn is_reconcilable(&self, _ctx: &ComponentContext<MigrationJob>) -> bool {
        true
    }

    async fn reconcile(
        &self,
        ctx: &mut ComponentContext<MigrationJob>,
    ) -> Result<ReconcileResult<MigrationJob>> {
        let name = ctx.name();
        if ctx.is_deleting() {
            if flag_set(ctx.top.metadata.annotations.as_ref(), SKIP_FINALIZER_ANNOTATION) {
                info!(migration = %name, "skip-finalizer set, leaving job");
            } else {
                ctx.delete::<Job>(&name).await?;
            }
            ctx.remove_finalizer(FINALIZER).await?;
            return Ok(ReconcileResult::done());
        }
        ctx.ensure_finalizer(FINALIZER).await?;

        let version = ctx.top.spec.version.clone();
        if let Some(existing) = ctx.get::<Job>(&name).await? {
            if existing.metadata.deletion_timestamp.is_some() {
                return Ok(ReconcileResult::requeue_after(RESTART_DELAY));
            }
            if job_version(&existing) != Some(version.as_str()) {
                info!(
                    migration = %name,
                    from = job_version(&existing).unwrap_or_default(),
                    to = %version,
                    "version changed, replacing job"
                );
                ctx.delete::<Job>(&name).await?;
                let restart = ReconcileResult::requeue_after(RESTART_DELAY);
                return Ok(with_phase(restart, version, ChildPhase::Running, String::new()));
            }
        }

        let job = ctx
            .converge(desired_job(&ctx.top), |_: &Job, _: &mut Job| Ok(()))
            .await?;
        if job.created {
            info!(migration = %name, version = %version, "started migration job");
        }
        let (phase, message) = job_phase(&job.object);
        Ok(with_phase(ReconcileResult::done(), version, phase, message))
    }
}

/// MigrationJob engine
pub fn engine(client: Arc<dyn ClusterClient>, enable_finalizers: bool) -> Engine<MigrationJob> {
    Engine::builder("migrationjob", client)
        .finalizers(enable_finalizers)
        .component(RunMigration)
        .build()
}
