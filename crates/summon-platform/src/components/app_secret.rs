//! Assembles the application's secret settings document
//!
//! Reads every credential the instance depends on, derives connection URLs,
//! overlays the user's input secrets and writes `<name>.app-secrets` (one
//! YAML document) plus `<name>.saml` (SAML material as files).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::ObjectMeta;
use kube::core::{ApiResource, DynamicObject};
use kube::ResourceExt;
use serde_yaml::Value;
use summon_common::crd::{SecretRef, SummonPlatform};
use summon_common::{Error, Result};
use summon_engine::{api_resource, copy_desired, Component, ObjectKey, ReconcileResult, WatchMapper};

use super::derived_secrets::ordered_fernet_keys;
use super::{child_name, postgres_ready, rabbitmq_ready, secret_data, secret_strings, Ctx, Outcome};

/// Key of the settings document inside `<name>.app-secrets`
pub const APP_SECRETS_KEY: &str = "summon-platform.yml";

/// SAML inputs and the file names they are mounted as
const SAML_FILES: &[(&str, &str)] = &[
    ("SAML_PRIVATE_KEY", "sp.key"),
    ("SAML_PUBLIC_KEY", "sp.crt"),
    ("SAML_IDP_METADATA", "idp.xml"),
];

/// Builds `<name>.app-secrets` once the database and broker are ready
pub struct AppSecret;

struct InputSecretMapper;

impl WatchMapper<SummonPlatform> for InputSecretMapper {
    fn map(&self, obj: &DynamicObject, tops: &[Arc<SummonPlatform>]) -> Vec<ObjectKey> {
        let namespace = obj.namespace().unwrap_or_default();
        let secret = obj.name_any();
        tops.iter()
            .filter(|top| top.namespace().as_deref() == Some(namespace.as_str()))
            .filter(|top| references_secret(top, &secret))
            .map(|top| ObjectKey::of(top.as_ref()))
            .collect()
    }
}

/// The instance reads `secret` without owning it
fn references_secret(top: &SummonPlatform, secret: &str) -> bool {
    let prefix = format!("{}.", top.name_any());
    if top.spec.secrets.iter().any(|s| s == secret) || secret.starts_with(&prefix) {
        return true;
    }
    let Some(status) = &top.status else {
        return false;
    };
    let pg = status.postgres_connection.as_ref().map(|c| &c.password_secret_ref);
    let mq = status.rabbitmq_connection.as_ref().map(|c| &c.password_secret_ref);
    [pg, mq].into_iter().flatten().any(|r| r.name == secret)
}

async fn read_secret(ctx: &Ctx, name: &str, notify: bool) -> Result<BTreeMap<String, String>> {
    ctx.get::<Secret>(name)
        .await?
        .as_ref()
        .map(secret_strings)
        .ok_or_else(|| Error::missing_input("Secret", name, notify))
}

async fn read_key(ctx: &Ctx, secret_ref: &SecretRef, default_key: &str) -> Result<String> {
    let key = if secret_ref.key.is_empty() { default_key } else { secret_ref.key.as_str() };
    let data = read_secret(ctx, &secret_ref.name, false).await?;
    data.get(key)
        .cloned()
        .ok_or_else(|| Error::missing_input("Secret key", format!("{}/{}", secret_ref.name, key), false))
}

fn required(data: &BTreeMap<String, String>, secret: &str, key: &str) -> Result<String> {
    data.get(key)
        .filter(|v| !v.is_empty())
        .cloned()
        .ok_or_else(|| Error::missing_input("Secret key", format!("{secret}/{key}"), false))
}

/// Move SAML inputs out of the settings document into file-named entries
pub(crate) fn split_saml(settings: &mut BTreeMap<String, Value>) -> BTreeMap<String, String> {
    let mut files = BTreeMap::new();
    for (key, file) in SAML_FILES {
        if let Some(value) = settings.remove(*key) {
            let text = match value {
                Value::String(s) => s,
                other => serde_yaml::to_string(&other).unwrap_or_default(),
            };
            files.insert(file.to_string(), text);
        }
    }
    files
}

#[async_trait]
impl Component<SummonPlatform> for AppSecret {
    fn name(&self) -> &'static str {
        "app-secret"
    }

    fn watch_types(&self) -> Vec<ApiResource> {
        vec![api_resource::<Secret>()]
    }

    fn watch_mapper(&self) -> Option<&dyn WatchMapper<SummonPlatform>> {
        Some(&InputSecretMapper)
    }

    fn is_reconcilable(&self, ctx: &Ctx) -> bool {
        postgres_ready(&ctx.top) && rabbitmq_ready(&ctx.top)
    }

    async fn reconcile(&self, ctx: &mut Ctx) -> Outcome {
        let status = ctx.top.status_or_default();
        let (Some(pg), Some(mq)) = (status.postgres_connection, status.rabbitmq_connection) else {
            return Err(Error::missing_input("connection", "postgres/rabbitmq", false));
        };
        let spec = ctx.top.spec.clone();

        let pg_password = read_key(ctx, &pg.password_secret_ref, "password").await?;
        let mq_password = read_key(ctx, &mq.password_secret_ref, "password").await?;

        let fernet_name = child_name(&ctx.top, '.', "fernet-keys");
        let fernet_keys = ordered_fernet_keys(&read_secret(ctx, &fernet_name, false).await?)?;

        let secret_key_name = child_name(&ctx.top, '.', "secret-key");
        let secret_key = required(
            &read_secret(ctx, &secret_key_name, false).await?,
            &secret_key_name,
            "SECRET_KEY",
        )?;

        let aws_name = child_name(&ctx.top, '.', "aws-credentials");
        let aws = read_secret(ctx, &aws_name, false).await?;
        let access_key = required(&aws, &aws_name, "AWS_ACCESS_KEY_ID")?;
        let secret_access_key = required(&aws, &aws_name, "AWS_SECRET_ACCESS_KEY")?;

        let mut settings: BTreeMap<String, Value> = BTreeMap::new();
        let mut set = |k: &str, v: Value| {
            settings.insert(k.to_string(), v);
        };
        set(
            "DATABASE_URL",
            Value::from(format!(
                "postgis://{}:{}@{}:{}/{}",
                pg.username, pg_password, pg.host, pg.port, pg.database
            )),
        );
        set(
            "OUTBOUNDSMS_URL",
            Value::from(format!("https://{}/outbound-sms", spec.hostname)),
        );
        set(
            "SMS_WEBHOOK_URL",
            Value::from(format!("https://{}/sms/receive/", spec.hostname)),
        );
        set(
            "CELERY_BROKER_URL",
            Value::from(format!(
                "pyamqp://{}:{}@{}:{}/{}?ssl=true",
                mq.username, mq_password, mq.host, mq.port, mq.vhost
            )),
        );
        set(
            "FERNET_KEYS",
            Value::Sequence(fernet_keys.into_iter().map(Value::from).collect()),
        );
        set("SECRET_KEY", Value::from(secret_key));
        set("AWS_ACCESS_KEY_ID", Value::from(access_key));
        set("AWS_SECRET_ACCESS_KEY", Value::from(secret_access_key));

        for input in &spec.secrets {
            for (k, v) in read_secret(ctx, input, true).await? {
                settings.insert(k, Value::from(v));
            }
        }

        let saml = split_saml(&mut settings);
        let document = serde_yaml::to_string(&settings)?;

        let namespace = ctx.namespace();
        let meta = |name: String| ObjectMeta {
            name: Some(name),
            namespace: Some(namespace.clone()),
            ..Default::default()
        };
        let app_secrets = Secret {
            metadata: meta(child_name(&ctx.top, '.', "app-secrets")),
            data: Some(secret_data([(APP_SECRETS_KEY, document)])),
            ..Default::default()
        };
        let saml_secret = Secret {
            metadata: meta(child_name(&ctx.top, '.', "saml")),
            data: Some(secret_data(saml)),
            ..Default::default()
        };
        ctx.converge(app_secrets, copy_desired).await?;
        ctx.converge(saml_secret, copy_desired).await?;
        Ok(ReconcileResult::done())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use summon_common::crd::{PostgresConnection, SummonPlatformSpec, SummonPlatformStatus};

    fn platform() -> SummonPlatform {
        let mut p = SummonPlatform::new(
            "foo",
            SummonPlatformSpec {
                secrets: vec!["foo-input".into()],
                ..Default::default()
            },
        );
        p.metadata.namespace = Some("summon-dev".into());
        p.status = Some(SummonPlatformStatus {
            postgres_connection: Some(PostgresConnection {
                password_secret_ref: SecretRef {
                    name: "foo.postgres-user-password".into(),
                    key: "password".into(),
                },
                ..Default::default()
            }),
            ..Default::default()
        });
        p
    }

    #[test]
    fn mapper_matches_inputs_derived_and_password_secrets() {
        let p = platform();
        assert!(references_secret(&p, "foo-input"));
        assert!(references_secret(&p, "foo.aws-credentials"));
        assert!(references_secret(&p, "foo.postgres-user-password"));
        assert!(!references_secret(&p, "foobar.app-secrets"));
        assert!(!references_secret(&p, "other"));
    }

    #[test]
    fn mapper_stays_within_namespace() {
        let tops = vec![Arc::new(platform())];
        let mut secret = DynamicObject::new("foo-input", &api_resource::<Secret>());
        secret.metadata.namespace = Some("summon-dev".into());
        assert_eq!(InputSecretMapper.map(&secret, &tops), vec![ObjectKey::new("summon-dev", "foo")]);
        secret.metadata.namespace = Some("summon-qa".into());
        assert!(InputSecretMapper.map(&secret, &tops).is_empty());
    }

    #[test]
    fn saml_material_moves_to_files() {
        let mut settings = BTreeMap::from([
            ("SAML_PRIVATE_KEY".to_string(), Value::from("-----BEGIN KEY-----")),
            ("SAML_IDP_METADATA".to_string(), Value::from("<xml/>")),
            ("OTHER".to_string(), Value::from("x")),
        ]);
        let files = split_saml(&mut settings);
        assert_eq!(files["sp.key"], "-----BEGIN KEY-----");
        assert_eq!(files["idp.xml"], "<xml/>");
        assert!(!files.contains_key("sp.crt"));
        assert_eq!(settings.keys().collect::<Vec<_>>(), vec!["OTHER"]);
    }
}
