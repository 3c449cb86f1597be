//! Services, ingresses, disruption budgets and scrape targets

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::core::ApiResource;
use summon_common::crd::{ServiceMonitor, SummonPlatform};
use summon_common::{extras, Result};
use summon_engine::{api_resource, copy_desired, Component, ReconcileResult};

use super::config_map::hosts;
use super::workloads::Role;
use super::{Ctx, Outcome};
use crate::templates;

/// Copy the desired service but keep the addresses the API server assigned
fn keep_cluster_ip(want: &Service, have: &mut Service) -> Result<()> {
    let assigned = have
        .spec
        .as_ref()
        .map(|s| (s.cluster_ip.clone(), s.cluster_ips.clone()));
    copy_desired(want, have)?;
    if let (Some(spec), Some((ip, ips))) = (have.spec.as_mut(), assigned) {
        if ip.is_some() {
            spec.cluster_ip = ip;
            spec.cluster_ips = ips;
        }
    }
    Ok(())
}

/// A Service for every enabled role that listens on a port
pub struct Services;

#[async_trait]
impl Component<SummonPlatform> for Services {
    fn name(&self) -> &'static str {
        "services"
    }

    fn watch_types(&self) -> Vec<ApiResource> {
        vec![api_resource::<Service>()]
    }

    fn is_reconcilable(&self, _ctx: &Ctx) -> bool {
        true
    }

    async fn reconcile(&self, ctx: &mut Ctx) -> Outcome {
        for role in Role::ALL {
            let Some(port) = role.port() else {
                continue;
            };
            if !role.enabled(&ctx.top) {
                ctx.delete::<Service>(&role.object_name(&ctx.top)).await?;
                continue;
            }
            let extra = extras! {
                "role" => role.name(),
                "port" => port,
                "headless" => false,
            };
            ctx.create_or_update::<Service, _>(templates::SERVICE, Some(&extra), keep_cluster_ip)
                .await?;
        }
        Ok(ReconcileResult::done())
    }
}

/// Public entry points: role, path prefix and whether aliases are served
const INGRESS_ROUTES: &[(Role, &str, bool)] = &[
    (Role::Web, "/", true),
    (Role::Daphne, "/ws", false),
    (Role::Static, "/static", false),
];

/// TLS ingresses for web, websockets and static assets
pub struct Ingresses;

#[async_trait]
impl Component<SummonPlatform> for Ingresses {
    fn name(&self) -> &'static str {
        "ingresses"
    }

    fn watch_types(&self) -> Vec<ApiResource> {
        vec![api_resource::<Ingress>()]
    }

    fn is_reconcilable(&self, _ctx: &Ctx) -> bool {
        true
    }

    async fn reconcile(&self, ctx: &mut Ctx) -> Outcome {
        for (role, path, with_aliases) in INGRESS_ROUTES.iter().copied() {
            let hosts = if with_aliases {
                hosts(&ctx.top)
            } else {
                vec![ctx.top.spec.hostname.clone()]
            };
            let extra = extras! {
                "role" => role.name(),
                "port" => role.port(),
                "path" => path,
                "hosts" => hosts,
            };
            ctx.create_or_update::<Ingress, _>(templates::INGRESS, Some(&extra), copy_desired)
                .await?;
        }
        Ok(ReconcileResult::done())
    }
}

/// Keeps at least all but one web pod through voluntary disruptions
pub struct DisruptionBudgets;

#[async_trait]
impl Component<SummonPlatform> for DisruptionBudgets {
    fn name(&self) -> &'static str {
        "pod-disruption-budgets"
    }

    fn watch_types(&self) -> Vec<ApiResource> {
        vec![api_resource::<PodDisruptionBudget>()]
    }

    fn is_reconcilable(&self, _ctx: &Ctx) -> bool {
        true
    }

    async fn reconcile(&self, ctx: &mut Ctx) -> Outcome {
        let extra = extras! { "role" => Role::Web.name() };
        ctx.create_or_update::<PodDisruptionBudget, _>(templates::PDB, Some(&extra), copy_desired)
            .await?;
        Ok(ReconcileResult::done())
    }
}

/// Prometheus scrape target for the web role
pub struct ServiceMonitors;

#[async_trait]
impl Component<SummonPlatform> for ServiceMonitors {
    fn name(&self) -> &'static str {
        "service-monitors"
    }

    fn is_reconcilable(&self, _ctx: &Ctx) -> bool {
        true
    }

    async fn reconcile(&self, ctx: &mut Ctx) -> Outcome {
        let extra = extras! { "role" => Role::Web.name() };
        ctx.create_or_update::<ServiceMonitor, _>(templates::SERVICE_MONITOR, Some(&extra), copy_desired)
            .await?;
        Ok(ReconcileResult::done())
    }
}
