//! Backing services provisioned by other controllers: image pull
//! credentials, the database and the broker vhost. Their status and
//! connection details are projected onto the instance.

use async_trait::async_trait;
use kube::core::ApiResource;
use summon_common::crd::{
    ChildPhase, PlatformPhase, PostgresDatabase, PullSecret, RabbitmqVhost, SummonPlatform,
};
use summon_common::{extras, Error};
use summon_engine::{api_resource, copy_desired, Component, ReconcileResult};

use super::{ChildStatus, Ctx, Outcome};
use crate::templates;

/// Image pull credentials for every workload
pub struct PullSecretComponent;

#[async_trait]
impl Component<SummonPlatform> for PullSecretComponent {
    fn name(&self) -> &'static str {
        "pull-secret"
    }

    fn watch_types(&self) -> Vec<ApiResource> {
        vec![api_resource::<PullSecret>()]
    }

    fn is_reconcilable(&self, _ctx: &Ctx) -> bool {
        true
    }

    async fn reconcile(&self, ctx: &mut Ctx) -> Outcome {
        let child = ctx
            .create_or_update::<PullSecret, _>(templates::PULL_SECRET, None, copy_desired)
            .await?
            .object;
        let phase = child.child_phase();
        Ok(ReconcileResult::modify(move |top: &mut SummonPlatform| {
            top.status_mut().pull_secret_status = phase;
            Ok(())
        }))
    }
}

/// The instance's database; a child failure fails the instance
pub struct Postgres;

#[async_trait]
impl Component<SummonPlatform> for Postgres {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn watch_types(&self) -> Vec<ApiResource> {
        vec![api_resource::<PostgresDatabase>()]
    }

    fn is_reconcilable(&self, _ctx: &Ctx) -> bool {
        true
    }

    async fn reconcile(&self, ctx: &mut Ctx) -> Outcome {
        let spec = &ctx.top.spec;
        let shared_name = if spec.database.exclusive {
            String::new()
        } else {
            spec.database.shared_name.clone()
        };
        let extra = extras! {
            "database_name" => ctx.name().replace('-', "_"),
            "shared_name" => shared_name,
        };
        let child = ctx
            .create_or_update::<PostgresDatabase, _>(templates::POSTGRES, Some(&extra), copy_desired)
            .await?
            .object;

        let phase = child.child_phase();
        if phase == ChildPhase::Error {
            return Err(Error::child_failed("postgres", child.child_message()));
        }
        let connection = child.status.and_then(|s| s.connection);
        Ok(ReconcileResult::modify(move |top: &mut SummonPlatform| {
            let status = top.status_mut();
            status.postgres_status = phase;
            if connection.is_some() {
                status.postgres_connection = connection.clone();
            }
            if !phase.is_ready() && status.status == PlatformPhase::Unknown {
                status.status = PlatformPhase::Initializing;
                status.message = "Waiting for database".to_string();
            }
            Ok(())
        }))
    }
}

/// The instance's broker vhost; a child failure fails the instance
pub struct Rabbitmq;

#[async_trait]
impl Component<SummonPlatform> for Rabbitmq {
    fn name(&self) -> &'static str {
        "rabbitmq"
    }

    fn watch_types(&self) -> Vec<ApiResource> {
        vec![api_resource::<RabbitmqVhost>()]
    }

    fn is_reconcilable(&self, _ctx: &Ctx) -> bool {
        true
    }

    async fn reconcile(&self, ctx: &mut Ctx) -> Outcome {
        let child = ctx
            .create_or_update::<RabbitmqVhost, _>(templates::RABBITMQ, None, copy_desired)
            .await?
            .object;
        let phase = child.child_phase();
        if phase == ChildPhase::Error {
            return Err(Error::child_failed("rabbitmq", child.child_message()));
        }
        let connection = child.status.and_then(|s| s.connection);
        Ok(ReconcileResult::modify(move |top: &mut SummonPlatform| {
            let status = top.status_mut();
            status.rabbitmq_status = phase;
            if connection.is_some() {
                status.rabbitmq_connection = connection.clone();
            }
            Ok(())
        }))
    }
}
