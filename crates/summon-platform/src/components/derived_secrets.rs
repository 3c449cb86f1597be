//! Secrets generated by the operator itself
//!
//! Generated material is never rotated away: the Django secret key is created
//! once, fernet keys only ever accumulate.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use chrono::{DateTime, NaiveDateTime, Utc};
use k8s_openapi::api::core::v1::Secret;
use kube::api::ObjectMeta;
use kube::core::ApiResource;
use summon_common::crd::{ChildPhase, MockCarServerTenant, SummonPlatform};
use summon_common::hash::random_bytes;
use summon_common::{Error, Result};
use summon_engine::{api_resource, copy_desired, Component, ReconcileResult};
use tracing::info;

use super::{child_name, secret_data, secret_strings, ChildStatus, Ctx, Outcome};
use crate::templates;

/// Timestamp format of fernet key entries; secret keys may not contain `:`
pub const FERNET_TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

const SECRET_KEY: &str = "SECRET_KEY";

fn generated_secret(ctx: &Ctx, name: String, data: BTreeMap<String, k8s_openapi::ByteString>) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(ctx.namespace()),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}

/// Django `SECRET_KEY`, generated once per instance
pub struct SecretKey;

#[async_trait]
impl Component<SummonPlatform> for SecretKey {
    fn name(&self) -> &'static str {
        "secret-key"
    }

    fn watch_types(&self) -> Vec<ApiResource> {
        vec![api_resource::<Secret>()]
    }

    fn is_reconcilable(&self, _ctx: &Ctx) -> bool {
        true
    }

    async fn reconcile(&self, ctx: &mut Ctx) -> Outcome {
        let name = child_name(&ctx.top, '.', "secret-key");
        let existing = ctx.get::<Secret>(&name).await?;
        let present = existing
            .as_ref()
            .map(secret_strings)
            .is_some_and(|d| d.get(SECRET_KEY).is_some_and(|v| !v.is_empty()));
        if present {
            return Ok(ReconcileResult::done());
        }

        let key = URL_SAFE.encode(random_bytes(48)?);
        let desired = generated_secret(ctx, name, secret_data([(SECRET_KEY, key)]));
        ctx.converge(desired, |want: &Secret, have: &mut Secret| {
            let data = have.data.get_or_insert_with(BTreeMap::new);
            if let Some(key) = want.data.as_ref().and_then(|d| d.get(SECRET_KEY)) {
                data.insert(SECRET_KEY.to_string(), key.clone());
            }
            Ok(())
        })
        .await?;
        info!(instance = %ctx.name(), "generated secret key");
        Ok(ReconcileResult::done())
    }
}

/// Parse a fernet entry name
pub(crate) fn parse_fernet_timestamp(key: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(key, FERNET_TIMESTAMP_FORMAT)
        .map(|t| t.and_utc())
        .map_err(|e| Error::serialization(format!("fernet key {key}: {e}")))
}

/// Fernet keys, newest first
pub(crate) fn ordered_fernet_keys(data: &BTreeMap<String, String>) -> Result<Vec<String>> {
    let mut entries = data
        .iter()
        .map(|(k, v)| Ok((parse_fernet_timestamp(k)?, v.clone())))
        .collect::<Result<Vec<_>>>()?;
    entries.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(entries.into_iter().map(|(_, v)| v).collect())
}

fn needs_rotation(data: &BTreeMap<String, String>, now: DateTime<Utc>, lifetime: Duration) -> Result<bool> {
    let newest = data
        .keys()
        .map(|k| parse_fernet_timestamp(k))
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .max();
    let Some(newest) = newest else {
        return Ok(true);
    };
    let Ok(lifetime) = chrono::Duration::from_std(lifetime) else {
        return Ok(false);
    };
    Ok(newest
        .checked_add_signed(lifetime)
        .is_some_and(|expiry| expiry <= now))
}

/// Time-stamped fernet keys; a new one is added once the newest expires
pub struct FernetRotate;

#[async_trait]
impl Component<SummonPlatform> for FernetRotate {
    fn name(&self) -> &'static str {
        "fernet-rotate"
    }

    fn watch_types(&self) -> Vec<ApiResource> {
        vec![api_resource::<Secret>()]
    }

    fn is_reconcilable(&self, _ctx: &Ctx) -> bool {
        true
    }

    async fn reconcile(&self, ctx: &mut Ctx) -> Outcome {
        let name = child_name(&ctx.top, '.', "fernet-keys");
        let current = ctx
            .get::<Secret>(&name)
            .await?
            .as_ref()
            .map(secret_strings)
            .unwrap_or_default();
        let lifetime = ctx.top.spec.fernet_key_lifetime.unwrap_or(Duration::MAX);
        let now = ctx.now();
        if !needs_rotation(&current, now, lifetime)? {
            return Ok(ReconcileResult::done());
        }

        let stamp = now.format(FERNET_TIMESTAMP_FORMAT).to_string();
        let key = URL_SAFE.encode(random_bytes(32)?);
        let desired = generated_secret(ctx, name, secret_data([(stamp.clone(), key)]));
        ctx.converge(desired, |want: &Secret, have: &mut Secret| {
            let data = have.data.get_or_insert_with(BTreeMap::new);
            for (k, v) in want.data.iter().flatten() {
                data.entry(k.clone()).or_insert_with(|| v.clone());
            }
            Ok(())
        })
        .await?;
        info!(instance = %ctx.name(), key = %stamp, "added fernet key");
        Ok(ReconcileResult::done())
    }
}

/// Tenant on the mock car server for instances that test against it
pub struct MockCarServer;

#[async_trait]
impl Component<SummonPlatform> for MockCarServer {
    fn name(&self) -> &'static str {
        "mock-car-server"
    }

    fn watch_types(&self) -> Vec<ApiResource> {
        vec![api_resource::<MockCarServerTenant>()]
    }

    fn is_reconcilable(&self, ctx: &Ctx) -> bool {
        ctx.top.spec.enable_mock_car_server == Some(true)
    }

    async fn reconcile(&self, ctx: &mut Ctx) -> Outcome {
        let tenant = ctx
            .create_or_update::<MockCarServerTenant, _>(
                templates::MOCK_CAR_SERVER_TENANT,
                None,
                copy_desired,
            )
            .await?
            .object;
        if tenant.child_phase() == ChildPhase::Error {
            return Err(Error::child_failed("mock car server", tenant.child_message()));
        }
        Ok(ReconcileResult::done())
    }
}
