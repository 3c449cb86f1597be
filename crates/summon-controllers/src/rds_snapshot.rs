//! RDSSnapshot: database snapshots with a time-to-live
//!
//! The component creates the cloud snapshot, mirrors its state onto the
//! object and deletes both once `creationTimestamp + ttl` has passed. Nothing
//! in the cluster changes when a TTL lapses, so [`run_ttl_scanner`] lists
//! snapshots periodically and pushes expired ones into the controller.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use summon_common::clock::SharedClock;
use summon_common::crd::{ChildPhase, RDSSnapshot};
use summon_common::{flag_set, Error, Result, SKIP_FINALIZER_ANNOTATION};
use summon_engine::{
    api_resource, from_dynamic, ClusterClient, Component, ComponentContext, Engine, ObjectKey,
    ReconcileResult,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Finalizer guarding the cloud snapshot
pub const FINALIZER: &str = "rdssnapshot.db.ridecell.io";

const POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Snapshot operations against the cloud database service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RdsBackend: Send + Sync {
    /// Start a snapshot of `instance_id`; an existing snapshot is fine
    async fn create_snapshot(&self, instance_id: &str, snapshot_id: &str) -> Result<()>;
    /// Provider status string, `None` when no such snapshot exists
    async fn snapshot_status(&self, snapshot_id: &str) -> Result<Option<String>>;
    /// Delete a snapshot; absent is fine
    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()>;
}

/// [`RdsBackend`] backed by AWS RDS
pub struct AwsRds {
    client: aws_sdk_rds::Client,
}

impl AwsRds {
    /// Client built from a loaded SDK config
    pub fn new(config: &aws_config::SdkConfig) -> Self {
        Self {
            client: aws_sdk_rds::Client::new(config),
        }
    }
}

fn rds_error(message: String) -> Error {
    Error::internal_with_context("rds", message)
}

#[async_trait]
impl RdsBackend for AwsRds {
    async fn create_snapshot(&self, instance_id: &str, snapshot_id: &str) -> Result<()> {
        match self
            .client
            .create_db_snapshot()
            .db_instance_identifier(instance_id)
            .db_snapshot_identifier(snapshot_id)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                let err = e.into_service_error();
                if err.is_db_snapshot_already_exists_fault() {
                    Ok(())
                } else {
                    Err(rds_error(err.to_string()))
                }
            }
        }
    }

    async fn snapshot_status(&self, snapshot_id: &str) -> Result<Option<String>> {
        match self
            .client
            .describe_db_snapshots()
            .db_snapshot_identifier(snapshot_id)
            .send()
            .await
        {
            Ok(output) => Ok(output
                .db_snapshots()
                .first()
                .and_then(|s| s.status())
                .map(str::to_string)),
            Err(e) => {
                let err = e.into_service_error();
                if err.is_db_snapshot_not_found_fault() {
                    Ok(None)
                } else {
                    Err(rds_error(err.to_string()))
                }
            }
        }
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        match self
            .client
            .delete_db_snapshot()
            .db_snapshot_identifier(snapshot_id)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                let err = e.into_service_error();
                if err.is_db_snapshot_not_found_fault() {
                    Ok(())
                } else {
                    Err(rds_error(err.to_string()))
                }
            }
        }
    }
}

/// Moment the snapshot's TTL lapses, if it has one
pub fn expires_at(snapshot: &RDSSnapshot) -> Option<DateTime<Utc>> {
    let created = snapshot.metadata.creation_timestamp.as_ref()?.0;
    let ttl = chrono::Duration::from_std(snapshot.spec.ttl?).ok()?;
    created.checked_add_signed(ttl)
}

/// The snapshot has outlived its TTL
pub fn is_expired(snapshot: &RDSSnapshot, now: DateTime<Utc>) -> bool {
    expires_at(snapshot).is_some_and(|at| at <= now)
}

fn phase_of(provider_status: &str) -> ChildPhase {
    match provider_status {
        "available" => ChildPhase::Ready,
        "failed" | "incompatible-restore" => ChildPhase::Error,
        _ => ChildPhase::Creating,
    }
}

fn with_phase(
    result: ReconcileResult<RDSSnapshot>,
    phase: ChildPhase,
    message: String,
) -> ReconcileResult<RDSSnapshot> {
    result.with_modifier(move |top: &mut RDSSnapshot| {
        let status = top.status.get_or_insert_with(Default::default);
        status.status = phase;
        status.message = message.clone();
        Ok(())
    })
}

/// Drives one snapshot through create, poll and expiry
pub struct SnapshotLifecycle {
    backend: Arc<dyn RdsBackend>,
}

impl SnapshotLifecycle {
    /// Lifecycle over `backend`
    pub fn new(backend: Arc<dyn RdsBackend>) -> Self {
        Self { backend }
    }

    async fn teardown(&self, ctx: &mut ComponentContext<RDSSnapshot>) -> Result<()> {
        if flag_set(ctx.top.metadata.annotations.as_ref(), SKIP_FINALIZER_ANNOTATION) {
            info!(snapshot = %ctx.name(), "skip-finalizer set, keeping cloud snapshot");
        } else {
            let id = ctx.top.snapshot_id();
            ctx.guard(self.backend.delete_snapshot(&id)).await?;
            info!(snapshot = %id, "deleted cloud snapshot");
        }
        ctx.remove_finalizer(FINALIZER).await
    }
}

#[async_trait]
impl Component<RDSSnapshot> for SnapshotLifecycle {
    fn name(&self) -> &'static str {
        "rds-snapshot"
    }

    fn is_reconcilable(&self, _ctx: &ComponentContext<RDSSnapshot>) -> bool {
        true
    }

    async fn reconcile(
        &self,
        ctx: &mut ComponentContext<RDSSnapshot>,
    ) -> Result<ReconcileResult<RDSSnapshot>> {
        if ctx.is_deleting() {
            self.teardown(ctx).await?;
            return Ok(ReconcileResult::done());
        }
        let guarded = ctx.ensure_finalizer(FINALIZER).await?;

        let id = ctx.top.snapshot_id();
        if is_expired(&ctx.top, ctx.now()) {
            info!(snapshot = %id, "ttl expired, deleting");
            if !guarded {
                ctx.guard(self.backend.delete_snapshot(&id)).await?;
            }
            let ns = ctx.namespace();
            ctx.guard(ctx.client().delete(&api_resource::<RDSSnapshot>(), &ns, &ctx.name()))
                .await?;
            return Ok(ReconcileResult::done());
        }

        let provider_status = ctx.guard(self.backend.snapshot_status(&id)).await?;
        let Some(provider_status) = provider_status else {
            let instance = ctx.top.spec.rds_instance_id.clone();
            if instance.is_empty() {
                return Err(Error::validation_for(ctx.name(), "rdsInstanceId is required"));
            }
            ctx.guard(self.backend.create_snapshot(&instance, &id)).await?;
            info!(snapshot = %id, instance = %instance, "started snapshot");
            let poll = ReconcileResult::requeue_after(POLL_INTERVAL);
            return Ok(with_phase(poll, ChildPhase::Creating, String::new()));
        };

        match phase_of(&provider_status) {
            ChildPhase::Ready => Ok(with_phase(ReconcileResult::done(), ChildPhase::Ready, String::new())),
            ChildPhase::Error => Ok(with_phase(
                ReconcileResult::done(),
                ChildPhase::Error,
                format!("snapshot {id} is {provider_status}"),
            )),
            phase => {
                debug!(snapshot = %id, status = %provider_status, "snapshot in progress");
                let poll = ReconcileResult::requeue_after(POLL_INTERVAL);
                Ok(with_phase(poll, phase, provider_status))
            }
        }
    }
}

/// RDSSnapshot engine
pub fn engine(
    client: Arc<dyn ClusterClient>,
    backend: Arc<dyn RdsBackend>,
    clock: SharedClock,
    enable_finalizers: bool,
) -> Engine<RDSSnapshot> {
    Engine::builder("rdssnapshot", client)
        .clock(clock)
        .finalizers(enable_finalizers)
        .component(SnapshotLifecycle::new(backend))
        .build()
}

/// Keys of every snapshot whose TTL has lapsed
pub async fn expired_snapshots(client: &dyn ClusterClient, now: DateTime<Utc>) -> Result<Vec<ObjectKey>> {
    let ar = api_resource::<RDSSnapshot>();
    let mut expired = Vec::new();
    for obj in client.list(&ar, "", "").await? {
        let snapshot: RDSSnapshot = from_dynamic(obj)?;
        if snapshot.metadata.deletion_timestamp.is_none() && is_expired(&snapshot, now) {
            expired.push(ObjectKey::of(&snapshot));
        }
    }
    Ok(expired)
}

/// Periodically enqueue expired snapshots until shutdown
pub async fn run_ttl_scanner(
    client: Arc<dyn ClusterClient>,
    clock: SharedClock,
    interval: Duration,
    triggers: mpsc::Sender<ObjectKey>,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("snapshot ttl scanner stopping");
                return;
            }
            _ = ticker.tick() => {}
        }
        let keys = match expired_snapshots(client.as_ref(), clock.now()).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "snapshot ttl scan failed");
                continue;
            }
        };
        for key in keys {
            debug!(snapshot = %key, "enqueueing expired snapshot");
            if triggers.send(key).await.is_err() {
                warn!("snapshot controller trigger channel closed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::ResourceExt;
    use summon_common::clock::FixedClock;
    use summon_common::crd::RDSSnapshotSpec;
    use summon_engine::testing::MemoryCluster;

    fn created() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap()
    }

    fn snapshot(name: &str, ttl: Option<Duration>) -> RDSSnapshot {
        let mut s = RDSSnapshot::new(
            name,
            RDSSnapshotSpec {
                rds_instance_id: "summon-dev-db".into(),
                ttl,
                ..Default::default()
            },
        );
        s.metadata.namespace = Some("summon-dev".into());
        s.metadata.creation_timestamp = Some(Time(created()));
        s
    }

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new("summon-dev", name)
    }

    async fn tick(
        cluster: &Arc<MemoryCluster>,
        backend: MockRdsBackend,
        now: DateTime<Utc>,
        finalizers: bool,
        name: &str,
    ) -> Result<ReconcileResult<RDSSnapshot>> {
        engine(
            cluster.clone(),
            Arc::new(backend),
            Arc::new(FixedClock::new(now)),
            finalizers,
        )
        .reconcile(&key(name), CancellationToken::new())
        .await
    }

    fn phase(cluster: &MemoryCluster, name: &str) -> ChildPhase {
        cluster
            .fetch::<RDSSnapshot>("summon-dev", name)
            .and_then(|s| s.status)
            .map(|s| s.status)
            .unwrap_or_default()
    }

    #[test]
    fn expiry_needs_a_ttl() {
        let day = Duration::from_secs(86400);
        assert!(!is_expired(&snapshot("a", None), created() + chrono::Duration::days(365)));
        assert!(!is_expired(&snapshot("a", Some(day)), created() + chrono::Duration::hours(23)));
        assert!(is_expired(&snapshot("a", Some(day)), created() + chrono::Duration::hours(24)));
    }

    #[tokio::test]
    async fn missing_snapshot_is_created() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.insert(&snapshot("foo-15", None));

        let mut backend = MockRdsBackend::new();
        backend.expect_snapshot_status().returning(|_| Ok(None));
        backend
            .expect_create_snapshot()
            .withf(|instance, id| instance == "summon-dev-db" && id == "foo-15")
            .times(1)
            .returning(|_, _| Ok(()));

        let result = tick(&cluster, backend, created(), false, "foo-15").await.unwrap();
        assert_eq!(result.requeue_after, Some(POLL_INTERVAL));
        assert_eq!(phase(&cluster, "foo-15"), ChildPhase::Creating);
    }

    #[tokio::test]
    async fn provider_status_is_mirrored() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.insert(&snapshot("foo-15", None));

        let mut backend = MockRdsBackend::new();
        backend
            .expect_snapshot_status()
            .returning(|_| Ok(Some("available".into())));
        tick(&cluster, backend, created(), false, "foo-15").await.unwrap();
        assert_eq!(phase(&cluster, "foo-15"), ChildPhase::Ready);

        let mut backend = MockRdsBackend::new();
        backend
            .expect_snapshot_status()
            .returning(|_| Ok(Some("failed".into())));
        tick(&cluster, backend, created(), false, "foo-15").await.unwrap();
        let status = cluster
            .fetch::<RDSSnapshot>("summon-dev", "foo-15")
            .and_then(|s| s.status)
            .unwrap();
        assert_eq!(status.status, ChildPhase::Error);
        assert_eq!(status.message, "snapshot foo-15 is failed");
    }

    #[tokio::test]
    async fn expired_snapshot_is_deleted_everywhere() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.insert(&snapshot("foo-15", Some(Duration::from_secs(3600))));

        let mut backend = MockRdsBackend::new();
        backend
            .expect_delete_snapshot()
            .withf(|id| id == "foo-15")
            .times(1)
            .returning(|_| Ok(()));
        let later = created() + chrono::Duration::hours(2);
        tick(&cluster, backend, later, false, "foo-15").await.unwrap();

        assert!(cluster.fetch::<RDSSnapshot>("summon-dev", "foo-15").is_none());
    }

    #[tokio::test]
    async fn finalizer_deletes_cloud_snapshot_before_object() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.insert(&snapshot("foo-15", Some(Duration::from_secs(3600))));

        // first tick adds the finalizer then marks the object deleted
        let mut backend = MockRdsBackend::new();
        backend.expect_delete_snapshot().never();
        let later = created() + chrono::Duration::hours(2);
        tick(&cluster, backend, later, true, "foo-15").await.unwrap();
        let pending = cluster.fetch::<RDSSnapshot>("summon-dev", "foo-15").unwrap();
        assert!(pending.metadata.deletion_timestamp.is_some());
        assert_eq!(pending.finalizers(), &[FINALIZER.to_string()]);

        let mut backend = MockRdsBackend::new();
        backend.expect_delete_snapshot().times(1).returning(|_| Ok(()));
        tick(&cluster, backend, later, true, "foo-15").await.unwrap();
        assert!(cluster.fetch::<RDSSnapshot>("summon-dev", "foo-15").is_none());
    }

    #[tokio::test]
    async fn skip_finalizer_keeps_cloud_snapshot() {
        let cluster = Arc::new(MemoryCluster::new());
        let mut s = snapshot("foo-15", None);
        s.metadata.annotations = Some([(SKIP_FINALIZER_ANNOTATION.to_string(), "true".to_string())].into());
        s.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
        cluster.insert(&s);
        cluster
            .delete(&api_resource::<RDSSnapshot>(), "summon-dev", "foo-15")
            .await
            .unwrap();

        let mut backend = MockRdsBackend::new();
        backend.expect_delete_snapshot().never();
        tick(&cluster, backend, created(), true, "foo-15").await.unwrap();
        assert!(cluster.fetch::<RDSSnapshot>("summon-dev", "foo-15").is_none());
    }

    #[tokio::test]
    async fn scanner_finds_only_expired_snapshots() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.insert(&snapshot("old", Some(Duration::from_secs(3600))));
        cluster.insert(&snapshot("young", Some(Duration::from_secs(86400))));
        cluster.insert(&snapshot("forever", None));

        let now = created() + chrono::Duration::hours(2);
        let keys = expired_snapshots(&*cluster, now).await.unwrap();
        assert_eq!(keys, vec![key("old")]);
    }

    #[tokio::test]
    async fn scanner_pushes_keys_and_stops_on_shutdown() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.insert(&snapshot("old", Some(Duration::from_secs(3600))));
        let clock = Arc::new(FixedClock::new(created() + chrono::Duration::hours(2)));
        let (tx, mut rx) = mpsc::channel(4);
        let shutdown = CancellationToken::new();

        let scanner = tokio::spawn(run_ttl_scanner(
            cluster.clone(),
            clock,
            Duration::from_secs(3600),
            tx,
            shutdown.clone(),
        ));
        assert_eq!(rx.recv().await, Some(key("old")));
        shutdown.cancel();
        scanner.await.unwrap();
    }
}
