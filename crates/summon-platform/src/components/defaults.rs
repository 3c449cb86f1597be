//! In-memory spec defaulting and validation
//!
//! Defaults are applied to the tick's copy of the top only; they are never
//! written back to the spec.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use summon_common::config::PlatformConfig;
use summon_common::crd::{ConfigValue, SummonPlatform, SummonPlatformSpec};
use summon_common::Error;
use summon_engine::{Component, ReconcileResult};

use super::{Ctx, Outcome};

const DEFAULT_BACKUP_TTL: Duration = Duration::from_secs(720 * 3600);
const DEFAULT_FERNET_KEY_LIFETIME: Duration = Duration::from_secs(8760 * 3600);
const DEFAULT_SQS_REGION: &str = "us-west-2";

/// Static Django settings every instance starts from; `spec.config` wins
pub const CONFIG_DEFAULTS: &[(&str, DefaultValue)] = &[
    ("DEBUG", DefaultValue::Bool(false)),
    ("COMPRESS_ENABLED", DefaultValue::Bool(false)),
    ("USE_X_FORWARDED_HOST", DefaultValue::Bool(true)),
    ("SECURE_SSL_REDIRECT", DefaultValue::Bool(true)),
    ("SESSION_COOKIE_SECURE", DefaultValue::Bool(true)),
    ("CSRF_COOKIE_SECURE", DefaultValue::Bool(true)),
    ("SESSION_COOKIE_AGE", DefaultValue::Float(1_209_600.0)),
    ("X_FRAME_OPTIONS", DefaultValue::Str("DENY")),
    ("TIME_ZONE", DefaultValue::Str("America/Los_Angeles")),
    ("LANGUAGE_CODE", DefaultValue::Str("en-us")),
    ("DEFAULT_FROM_EMAIL", DefaultValue::Str("noreply@ridecell.com")),
    ("EMAIL_BACKEND", DefaultValue::Str("django_ses.SESBackend")),
    ("GOOGLE_ANALYTICS_ID", DefaultValue::Str("")),
    ("FIREBASE_APP", DefaultValue::Str("ridecell")),
    ("CELERY_TASK_ALWAYS_EAGER", DefaultValue::Bool(false)),
    ("CELERY_TASK_ACKS_LATE", DefaultValue::Bool(true)),
    ("CELERY_WORKER_PREFETCH_MULTIPLIER", DefaultValue::Float(1.0)),
    ("CELERY_BEAT_SCHEDULER", DefaultValue::Str("redbeat.RedBeatScheduler")),
    ("CHANNELS_REDIS_CAPACITY", DefaultValue::Float(1000.0)),
    ("CHANNELS_REDIS_EXPIRY", DefaultValue::Float(60.0)),
    ("USE_FACEBOOK_AUTH", DefaultValue::Bool(false)),
    ("USE_GOOGLE_AUTH", DefaultValue::Bool(false)),
    ("USE_SAML", DefaultValue::Bool(false)),
    ("SMS_PROVIDER", DefaultValue::Str("twilio")),
    ("TWILIO_VERIFY_ENABLED", DefaultValue::Bool(false)),
    ("PAYMENTS_ENABLED", DefaultValue::Bool(true)),
    ("PAYMENT_GATEWAY", DefaultValue::Str("stripe")),
    ("CURRENCY", DefaultValue::Str("USD")),
    ("DISTANCE_UNIT", DefaultValue::Str("mi")),
    ("MAP_PROVIDER", DefaultValue::Str("google")),
    ("DATA_UPLOAD_MAX_MEMORY_SIZE", DefaultValue::Float(10_485_760.0)),
    ("LOG_LEVEL", DefaultValue::Str("INFO")),
    ("LOG_FORMAT", DefaultValue::Str("json")),
    ("STATSD_ENABLED", DefaultValue::Bool(false)),
    ("FEATURE_FLAGS_CACHE_TIMEOUT", DefaultValue::Float(300.0)),
    ("API_THROTTLE_RATE", DefaultValue::Str("100/min")),
    ("KAFKA_ENABLED", DefaultValue::Bool(false)),
    ("SQS_ENABLED", DefaultValue::Bool(false)),
    ("MOCK_CAR_SERVER_ENABLED", DefaultValue::Bool(false)),
    ("TRIP_SHARE_ENABLED", DefaultValue::Bool(false)),
    ("ENABLE_NEW_RELIC", DefaultValue::Bool(false)),
];

/// A `const`-friendly config value
#[derive(Clone, Copy, Debug)]
pub enum DefaultValue {
    /// Boolean flag
    Bool(bool),
    /// Number
    Float(f64),
    /// String
    Str(&'static str),
}

impl From<DefaultValue> for ConfigValue {
    fn from(v: DefaultValue) -> Self {
        match v {
            DefaultValue::Bool(b) => ConfigValue::Bool(b),
            DefaultValue::Float(f) => ConfigValue::Float(f),
            DefaultValue::Str(s) => ConfigValue::String(s.to_string()),
        }
    }
}

/// Fills unset spec fields and rejects contradictory ones
pub struct Defaults {
    config: Arc<PlatformConfig>,
}

impl Defaults {
    /// Defaults drawing the operator-wide region from `config`
    pub fn new(config: Arc<PlatformConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Component<SummonPlatform> for Defaults {
    fn name(&self) -> &'static str {
        "defaults"
    }

    fn is_reconcilable(&self, _ctx: &Ctx) -> bool {
        true
    }

    async fn reconcile(&self, ctx: &mut Ctx) -> Outcome {
        let name = ctx.name();
        let namespace = ctx.namespace();
        let spec = &mut ctx.top.spec;

        spec.version = spec.version.trim().to_string();
        spec.auto_deploy = spec.auto_deploy.trim().to_string();
        match (spec.version.is_empty(), spec.auto_deploy.is_empty()) {
            (false, false) => {
                return Err(Error::validation_for(
                    &name,
                    "spec.version and spec.autoDeploy are mutually exclusive",
                ))
            }
            (true, true) => {
                return Err(Error::validation_for(
                    &name,
                    "one of spec.version or spec.autoDeploy must be set",
                ))
            }
            _ => {}
        }

        apply_defaults(spec, &name, &namespace, &self.config);
        Ok(ReconcileResult::done())
    }
}

/// Environment from the namespace suffix: `summon-qa` is `qa`
pub(crate) fn environment_for(namespace: &str) -> String {
    match namespace.split_once('-') {
        Some((_, env)) if !env.is_empty() => env.to_string(),
        _ => namespace.to_string(),
    }
}

fn apply_defaults(spec: &mut SummonPlatformSpec, name: &str, namespace: &str, config: &PlatformConfig) {
    if spec.hostname.is_empty() {
        spec.hostname = format!("{}.ridecell.us", name);
    }
    if spec.environment.is_empty() {
        spec.environment = environment_for(namespace);
    }
    if spec.aws_region.is_empty() {
        spec.aws_region = config.aws_region.clone();
    }
    if spec.sqs_region.is_empty() {
        spec.sqs_region = DEFAULT_SQS_REGION.to_string();
    }
    if spec.pull_secret.is_empty() {
        spec.pull_secret = "pull-secret".to_string();
    }
    if !spec.database.exclusive && spec.database.shared_name.is_empty() {
        spec.database.shared_name = format!("{}-shared", spec.environment);
    }
    spec.backup.ttl.get_or_insert(DEFAULT_BACKUP_TTL);
    spec.backup.wait_until_ready.get_or_insert(true);
    spec.fernet_key_lifetime.get_or_insert(DEFAULT_FERNET_KEY_LIFETIME);
    spec.enable_new_relic.get_or_insert(false);
    spec.enable_mock_car_server.get_or_insert(false);

    let scaled = if matches!(spec.environment.as_str(), "prod" | "uat") { 2 } else { 1 };
    let r = &mut spec.replicas;
    r.web.get_or_insert(scaled);
    r.daphne.get_or_insert(scaled);
    r.celeryd.get_or_insert(scaled);
    r.channel_worker.get_or_insert(scaled);
    r.static_.get_or_insert(scaled);
    r.celery_beat.get_or_insert(1);
    r.dispatch.get_or_insert(1);
    r.business_portal.get_or_insert(1);
    r.trip_share.get_or_insert(1);
    r.hw_aux.get_or_insert(1);
    r.kafka_consumer.get_or_insert(0);

    for (key, value) in CONFIG_DEFAULTS {
        spec.config
            .entry(key.to_string())
            .or_insert_with(|| (*value).into());
    }
}
