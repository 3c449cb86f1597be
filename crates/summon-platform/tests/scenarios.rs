//! Whole-instance scenarios against the in-memory cluster
//!
//! Child controllers (database, broker, pull secret, migration runner,
//! kubelet rollout) are played by `run_child_controllers`, which marks
//! whatever children exist as converged.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus, StatefulSet, StatefulSetStatus};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use summon_common::clock::{Clock, FixedClock};
use summon_common::config::PlatformConfig;
use summon_common::crd::{
    AutoscalerSpec, MigrationJob, PlatformPhase, PostgresDatabase, PullSecret, RDSSnapshot,
    RabbitmqVhost, SummonPlatform, SummonPlatformSpec,
};
use summon_common::{Result, SKIP_RECONCILE_ANNOTATION};
use summon_engine::testing::{MemoryCluster, Verb};
use summon_engine::{Engine, ObjectKey, ReconcileResult};
use summon_platform::components::{APP_SECRETS_HASH_ANNOTATION, CONFIG_HASH_ANNOTATION};
use summon_platform::notification::{Attachment, NotificationEngine, SlackSink, COLOR_DANGER, COLOR_GOOD};
use summon_platform::tag_cache::TagCache;
use summon_platform::{platform_engine, PlatformDeps};

const NS: &str = "summon-dev";
const CHANNEL: &str = "#foo-deploys";

#[derive(Default)]
struct RecordingSlack {
    posts: Mutex<Vec<(String, Attachment)>>,
}

impl RecordingSlack {
    fn colored(&self, color: &str) -> Vec<Attachment> {
        self.posts
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, a)| a.color == color)
            .map(|(_, a)| a.clone())
            .collect()
    }
}

#[async_trait]
impl SlackSink for RecordingSlack {
    async fn post(&self, channel: &str, attachment: &Attachment) -> Result<()> {
        self.posts
            .lock()
            .unwrap()
            .push((channel.to_string(), attachment.clone()));
        Ok(())
    }
}

struct Harness {
    cluster: Arc<MemoryCluster>,
    engine: Engine<SummonPlatform>,
    slack: Arc<RecordingSlack>,
    clock: Arc<FixedClock>,
    database_instance: String,
}

impl Harness {
    fn new(tags: &[&str]) -> Self {
        let cluster = Arc::new(MemoryCluster::new());
        let slack = Arc::new(RecordingSlack::default());
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()));
        let deps = PlatformDeps {
            config: Arc::new(PlatformConfig::default()),
            tag_cache: Arc::new(TagCache::fixed(tags.iter().map(|t| t.to_string()).collect())),
            notifier: Arc::new(NotificationEngine::new().with_slack(slack.clone())),
            clock: clock.clone(),
        };
        let engine = platform_engine(cluster.clone(), deps).unwrap();
        seed_inputs(&cluster);
        Self {
            cluster,
            engine,
            slack,
            clock,
            database_instance: String::new(),
        }
    }

    /// Harness whose database reports a cloud instance, so versions are snapshotted
    fn with_database_instance(id: &str) -> Self {
        Self {
            database_instance: id.to_string(),
            ..Self::new(&[])
        }
    }

    async fn reconcile(&self) -> Result<ReconcileResult<SummonPlatform>> {
        self.engine
            .reconcile(&ObjectKey::new(NS, "foo"), CancellationToken::new())
            .await
    }

    async fn tick(&self) -> Result<()> {
        self.reconcile().await.map(|_| ())
    }

    fn converge_children(&self) {
        run_child_controllers(&self.cluster, &self.database_instance);
    }

    fn top(&self) -> SummonPlatform {
        self.cluster.fetch::<SummonPlatform>(NS, "foo").unwrap()
    }

    fn phase(&self) -> PlatformPhase {
        self.top().phase()
    }

    /// Tick with child controllers converging in between until `Ready`;
    /// returns the distinct phases observed, starting from the initial one
    async fn deploy(&self) -> Vec<PlatformPhase> {
        self.tick_until(|h| h.phase() == PlatformPhase::Ready).await
    }

    /// Tick, converging children in between, until `done` holds right after
    /// a tick; returns the distinct phases observed
    async fn tick_until(&self, done: impl Fn(&Harness) -> bool) -> Vec<PlatformPhase> {
        let mut seen = vec![self.phase()];
        for _ in 0..10 {
            self.tick().await.unwrap();
            let phase = self.phase();
            if seen.last() != Some(&phase) {
                seen.push(phase);
            }
            if done(self) {
                return seen;
            }
            self.converge_children();
        }
        panic!("condition never reached, phases: {seen:?}");
    }

    fn deployment(&self, name: &str) -> Deployment {
        self.cluster.fetch::<Deployment>(NS, name).unwrap()
    }
}

fn platform(spec: SummonPlatformSpec) -> SummonPlatform {
    let mut p = SummonPlatform::new("foo", spec);
    p.metadata.namespace = Some(NS.into());
    p.spec.notifications.slack_channel = CHANNEL.into();
    p
}

fn basic_spec() -> SummonPlatformSpec {
    SummonPlatformSpec {
        version: "1.2.3".into(),
        secrets: vec!["testsecret".into()],
        ..Default::default()
    }
}

fn secret(name: &str, entries: &[(&str, &str)]) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some(NS.into()),
            ..Default::default()
        },
        data: Some(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                .collect::<BTreeMap<_, _>>(),
        ),
        ..Default::default()
    }
}

/// Secrets other controllers or the user provide
fn seed_inputs(cluster: &MemoryCluster) {
    cluster.insert(&secret("testsecret", &[("TWILIO_AUTH_TOKEN", "abc")]));
    cluster.insert(&secret("foo.postgres-user-password", &[("password", "pgpass")]));
    cluster.insert(&secret("foo.rabbitmq-user-password", &[("password", "mqpass")]));
    cluster.insert(&secret(
        "foo.aws-credentials",
        &[("AWS_ACCESS_KEY_ID", "AKIA"), ("AWS_SECRET_ACCESS_KEY", "shh")],
    ));
}

fn run_child_controllers(cluster: &MemoryCluster, database_instance: &str) {
    if cluster.fetch::<PullSecret>(NS, "foo-pullsecret").is_some() {
        cluster.set_status::<PullSecret>(NS, "foo-pullsecret", json!({"status": "Ready"}));
    }
    if cluster.fetch::<PostgresDatabase>(NS, "foo").is_some() {
        cluster.set_status::<PostgresDatabase>(
            NS,
            "foo",
            json!({
                "status": "Ready",
                "connection": {
                    "host": "shared.postgres.local",
                    "port": 5432,
                    "username": "foo",
                    "database": "foo",
                    "passwordSecretRef": {"name": "foo.postgres-user-password", "key": "password"},
                    "instanceId": database_instance,
                },
            }),
        );
    }
    if cluster.fetch::<RabbitmqVhost>(NS, "foo").is_some() {
        cluster.set_status::<RabbitmqVhost>(
            NS,
            "foo",
            json!({
                "status": "Ready",
                "connection": {
                    "host": "rabbitmq.local",
                    "username": "foo",
                    "vhost": "foo",
                    "passwordSecretRef": {"name": "foo.rabbitmq-user-password", "key": "password"},
                },
            }),
        );
    }
    if let Some(job) = cluster.fetch::<MigrationJob>(NS, "foo-migrations") {
        cluster.set_status::<MigrationJob>(
            NS,
            "foo-migrations",
            json!({"status": "Ready", "version": job.spec.version}),
        );
    }
    for d in cluster.list_of::<Deployment>(NS) {
        let n = d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
        cluster.modify::<Deployment>(NS, &d.name_any(), move |d| {
            d.status = Some(DeploymentStatus {
                replicas: Some(n),
                updated_replicas: Some(n),
                ready_replicas: Some(n),
                available_replicas: Some(n),
                ..Default::default()
            });
        });
    }
    for s in cluster.list_of::<StatefulSet>(NS) {
        let n = s.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
        cluster.modify::<StatefulSet>(NS, &s.name_any(), move |s| {
            s.status = Some(StatefulSetStatus {
                replicas: n,
                updated_replicas: Some(n),
                ready_replicas: Some(n),
                ..Default::default()
            });
        });
    }
}

fn pod_annotations(d: &Deployment) -> BTreeMap<String, String> {
    d.spec
        .as_ref()
        .and_then(|s| s.template.metadata.as_ref())
        .and_then(|m| m.annotations.clone())
        .unwrap_or_default()
}

fn replicas(d: &Deployment) -> Option<i32> {
    d.spec.as_ref().and_then(|s| s.replicas)
}

#[tokio::test]
async fn basic_deploy_converges_to_ready() {
    let h = Harness::new(&[]);
    h.cluster.insert(&platform(basic_spec()));
    h.deploy().await;

    let top = h.top();
    let status = top.status.clone().unwrap();
    assert_eq!(status.status, PlatformPhase::Ready);
    assert_eq!(status.message, "Cluster foo ready");
    assert_eq!(status.migrate_version, "1.2.3");

    let web: Vec<_> = h
        .cluster
        .list_of::<Deployment>(NS)
        .into_iter()
        .filter(|d| d.name_any() == "foo-web")
        .collect();
    assert_eq!(web.len(), 1);
    assert!(h.cluster.fetch::<StatefulSet>(NS, "foo-celerybeat").is_some());
    assert!(h.cluster.fetch::<Deployment>(NS, "foo-celerybeat").is_none());

    let service = h.cluster.fetch::<Service>(NS, "foo-web").unwrap();
    let ports = service.spec.unwrap().ports.unwrap();
    assert_eq!(ports[0].port, 8000);

    let ingress = h.cluster.fetch::<Ingress>(NS, "foo-web").unwrap();
    let tls = ingress.spec.unwrap().tls.unwrap();
    assert_eq!(tls[0].secret_name.as_deref(), Some("foo-tls"));

    assert!(h.cluster.fetch::<MigrationJob>(NS, "foo-migrations").is_none());
}

#[tokio::test]
async fn status_progresses_through_phases() {
    let h = Harness::new(&[]);
    h.cluster.insert(&platform(basic_spec()));
    let phases = h.deploy().await;
    assert_eq!(
        phases,
        vec![
            PlatformPhase::Unknown,
            PlatformPhase::Initializing,
            PlatformPhase::Migrating,
            PlatformPhase::Deploying,
            PlatformPhase::Ready,
        ]
    );
}

#[tokio::test]
async fn ready_instance_is_idempotent_and_announced_once() {
    let h = Harness::new(&[]);
    h.cluster.insert(&platform(basic_spec()));
    h.deploy().await;

    assert_eq!(h.top().status.unwrap().notification.summon_version, "1.2.3");
    h.cluster.clear_writes();
    h.tick().await.unwrap();
    h.tick().await.unwrap();
    assert_eq!(h.cluster.writes(), vec![]);

    let deploys = h.slack.colored(COLOR_GOOD);
    assert_eq!(deploys.len(), 1);
    assert!(deploys[0].title.contains("Deployed"));
}

#[tokio::test]
async fn child_error_fails_instance_and_notifies_once() {
    let h = Harness::new(&[]);
    h.cluster.insert(&platform(basic_spec()));
    h.tick().await.unwrap();
    h.cluster.set_status::<PostgresDatabase>(
        NS,
        "foo",
        json!({"status": "Error", "message": "boom"}),
    );

    assert!(h.tick().await.is_err());
    assert!(h.tick().await.is_err());

    let status = h.top().status.unwrap();
    assert_eq!(status.status, PlatformPhase::Error);
    assert!(status.message.contains("postgres: boom"));
    let failures = h.slack.colored(COLOR_DANGER);
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].text, "postgres: boom");
}

#[tokio::test]
async fn autodeploy_picks_newest_matching_build() {
    let h = Harness::new(&["11-95ac60f-TestTag", "15-ab0f6c1-TestTag", "16-de0a8fb-TestTag2"]);
    h.cluster.insert(&platform(SummonPlatformSpec {
        auto_deploy: "TestTag".into(),
        secrets: vec!["testsecret".into()],
        ..Default::default()
    }));
    h.deploy().await;

    let web = h.deployment("foo-web");
    let image = web.spec.unwrap().template.spec.unwrap().containers[0].image.clone();
    assert_eq!(image.as_deref(), Some("us.gcr.io/ridecell-1/summon:15-ab0f6c1-TestTag"));
    assert_eq!(h.top().status.unwrap().migrate_version, "15-ab0f6c1-TestTag");
}

#[tokio::test]
async fn autodeploy_and_version_are_exclusive() {
    let h = Harness::new(&["15-ab0f6c1-TestTag"]);
    h.cluster.insert(&platform(SummonPlatformSpec {
        version: "1.2.3".into(),
        auto_deploy: "TestTag".into(),
        ..Default::default()
    }));

    assert!(h.tick().await.is_err());
    let status = h.top().status.unwrap();
    assert_eq!(status.status, PlatformPhase::Error);
    assert!(status.message.contains("mutually exclusive"));
    assert!(h.cluster.list_of::<PostgresDatabase>(NS).is_empty());
}

#[tokio::test]
async fn secret_change_rolls_workloads_once() {
    let h = Harness::new(&[]);
    h.cluster.insert(&platform(basic_spec()));
    h.deploy().await;
    let before = pod_annotations(&h.deployment("foo-web"));

    h.cluster.modify::<Secret>(NS, "testsecret", |s| {
        s.data = Some(BTreeMap::from([(
            "TWILIO_AUTH_TOKEN".to_string(),
            ByteString(b"rotated".to_vec()),
        )]));
    });
    h.cluster.clear_writes();
    h.tick().await.unwrap();

    let after = pod_annotations(&h.deployment("foo-web"));
    assert_ne!(after[APP_SECRETS_HASH_ANNOTATION], before[APP_SECRETS_HASH_ANNOTATION]);
    assert_eq!(after[CONFIG_HASH_ANNOTATION], before[CONFIG_HASH_ANNOTATION]);

    let web_writes: Vec<_> = h
        .cluster
        .writes_for("Deployment")
        .into_iter()
        .filter(|w| w.name == "foo-web")
        .collect();
    assert_eq!(web_writes.len(), 1);
    assert_eq!(web_writes[0].verb, Verb::Replace);
}

#[tokio::test]
async fn autoscaler_owns_worker_replicas_while_enabled() {
    let h = Harness::new(&[]);
    h.cluster.insert(&platform(basic_spec()));
    h.deploy().await;

    h.cluster.modify::<SummonPlatform>(NS, "foo", |p| {
        p.spec.autoscaling.celeryd = Some(AutoscalerSpec {
            min_replicas: 2,
            max_replicas: 10,
        });
    });
    h.tick().await.unwrap();
    assert!(h.cluster.fetch::<HorizontalPodAutoscaler>(NS, "foo-celeryd").is_some());

    h.cluster.modify::<Deployment>(NS, "foo-celeryd", |d| {
        if let Some(spec) = d.spec.as_mut() {
            spec.replicas = Some(7);
        }
    });
    h.tick().await.unwrap();
    assert_eq!(replicas(&h.deployment("foo-celeryd")), Some(7));

    h.cluster.modify::<SummonPlatform>(NS, "foo", |p| {
        p.spec.autoscaling.celeryd = None;
    });
    h.tick().await.unwrap();
    assert_eq!(replicas(&h.deployment("foo-celeryd")), Some(1));
    assert!(h.cluster.fetch::<HorizontalPodAutoscaler>(NS, "foo-celeryd").is_none());
}

#[tokio::test]
async fn skip_annotation_leaves_cluster_untouched() {
    let h = Harness::new(&[]);
    let mut top = platform(basic_spec());
    top.metadata.annotations = Some(BTreeMap::from([(
        SKIP_RECONCILE_ANNOTATION.to_string(),
        "true".to_string(),
    )]));
    h.cluster.insert(&top);

    h.tick().await.unwrap();
    assert_eq!(h.cluster.write_count(), 0);
    assert!(h.cluster.list_of::<PostgresDatabase>(NS).is_empty());

    h.cluster.insert(&Deployment {
        metadata: ObjectMeta {
            name: Some("foo-web".into()),
            namespace: Some(NS.into()),
            ..Default::default()
        },
        ..Default::default()
    });
    h.tick().await.unwrap();
    assert_eq!(h.cluster.write_count(), 0);
    assert!(h.top().status.is_none());
}

fn migration_job(h: &Harness) -> Option<MigrationJob> {
    h.cluster.fetch::<MigrationJob>(NS, "foo-migrations")
}

#[tokio::test]
async fn failed_migration_does_not_fail_the_next_version() {
    let h = Harness::new(&[]);
    h.cluster.insert(&platform(basic_spec()));
    h.tick_until(|h| migration_job(h).is_some()).await;

    h.cluster.set_status::<MigrationJob>(
        NS,
        "foo-migrations",
        json!({"status": "Error", "message": "relation foo_trip does not exist", "version": "1.2.3"}),
    );
    assert!(h.tick().await.is_err());
    assert_eq!(h.phase(), PlatformPhase::Error);
    assert_eq!(h.slack.colored(COLOR_DANGER).len(), 1);

    h.cluster.modify::<SummonPlatform>(NS, "foo", |p| {
        p.spec.version = "1.2.4".into();
    });
    h.tick().await.unwrap();
    assert_eq!(h.phase(), PlatformPhase::Migrating);
    assert_eq!(migration_job(&h).unwrap().spec.version, "1.2.4");
    assert_eq!(h.slack.colored(COLOR_DANGER).len(), 1);

    h.converge_children();
    h.deploy().await;
    assert_eq!(h.top().status.unwrap().migrate_version, "1.2.4");
    assert_eq!(h.slack.colored(COLOR_DANGER).len(), 1);
}

#[tokio::test]
async fn post_migrate_wait_holds_rollout_until_deadline() {
    let h = Harness::new(&[]);
    let mut spec = basic_spec();
    spec.waits.post_migrate = Some(Duration::from_secs(300));
    h.cluster.insert(&platform(spec));

    h.tick_until(|h| h.phase() == PlatformPhase::PostMigrateWait).await;
    let started = h.clock.now();

    let first = h.reconcile().await.unwrap();
    assert_eq!(first.requeue_after, Some(Duration::from_secs(300)));
    let status = h.top().status.unwrap();
    assert_eq!(status.status, PlatformPhase::PostMigrateWait);
    assert_eq!(status.wait.until, Some(started + chrono::Duration::minutes(5)));
    assert!(h.cluster.fetch::<Deployment>(NS, "foo-web").is_none());

    h.clock.advance(Duration::from_secs(120));
    let waiting = h.reconcile().await.unwrap();
    assert_eq!(waiting.requeue_after, Some(Duration::from_secs(300)));
    assert_eq!(h.phase(), PlatformPhase::PostMigrateWait);

    h.clock.advance(Duration::from_secs(180));
    h.tick().await.unwrap();
    let status = h.top().status.unwrap();
    assert_eq!(status.status, PlatformPhase::Deploying);
    assert_eq!(status.wait.until, None);

    h.deploy().await;
    assert!(h.cluster.fetch::<Deployment>(NS, "foo-web").is_some());
}

fn snapshot(h: &Harness) -> Option<RDSSnapshot> {
    h.cluster.fetch::<RDSSnapshot>(NS, "foo-1-2-3")
}

#[tokio::test]
async fn snapshot_gates_migrations_until_ready() {
    let h = Harness::with_database_instance("foo-db");
    h.cluster.insert(&platform(basic_spec()));

    let mut phases = h.tick_until(|h| snapshot(h).is_some()).await;
    assert_eq!(snapshot(&h).unwrap().spec.rds_instance_id, "foo-db");
    assert_eq!(h.phase(), PlatformPhase::CreatingBackup);

    h.converge_children();
    h.tick().await.unwrap();
    assert_eq!(h.phase(), PlatformPhase::CreatingBackup);
    assert!(migration_job(&h).is_none());
    assert_eq!(h.top().status.unwrap().backup_version, "");

    h.cluster.set_status::<RDSSnapshot>(NS, "foo-1-2-3", json!({"status": "Ready"}));
    phases.extend(h.deploy().await.into_iter().skip(1));
    assert_eq!(
        phases,
        vec![
            PlatformPhase::Unknown,
            PlatformPhase::Initializing,
            PlatformPhase::CreatingBackup,
            PlatformPhase::Migrating,
            PlatformPhase::Deploying,
            PlatformPhase::Ready,
        ]
    );
    assert_eq!(h.top().status.unwrap().backup_version, "1.2.3");
}

#[tokio::test]
async fn snapshot_without_wait_migrates_immediately() {
    let h = Harness::with_database_instance("foo-db");
    let mut spec = basic_spec();
    spec.backup.wait_until_ready = Some(false);
    h.cluster.insert(&platform(spec));

    h.tick_until(|h| snapshot(h).is_some()).await;
    let status = h.top().status.unwrap();
    assert_eq!(status.status, PlatformPhase::Migrating);
    assert_eq!(status.backup_version, "1.2.3");
    assert!(migration_job(&h).is_some());
}

#[tokio::test]
async fn failed_snapshot_fails_instance() {
    let h = Harness::with_database_instance("foo-db");
    h.cluster.insert(&platform(basic_spec()));
    h.tick_until(|h| snapshot(h).is_some()).await;

    h.cluster.set_status::<RDSSnapshot>(
        NS,
        "foo-1-2-3",
        json!({"status": "Error", "message": "snapshot foo-1-2-3 is failed"}),
    );
    assert!(h.tick().await.is_err());
    let status = h.top().status.unwrap();
    assert_eq!(status.status, PlatformPhase::Error);
    assert!(status.message.contains("backup: snapshot foo-1-2-3 is failed"));
    assert!(migration_job(&h).is_none());
}
