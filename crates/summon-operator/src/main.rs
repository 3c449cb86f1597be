//! Summon operator - converges SummonPlatform instances and the helper kinds they use

mod cli;

use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use kube::Client;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use summon_common::clock::{SharedClock, SystemClock};
use summon_common::crd::owned_crds;
use summon_common::telemetry::{init_tracing, TelemetryConfig};
use summon_controllers::{
    encrypted_secret, firewall, migration_job, rds_snapshot, ridecell_ingress, run_ttl_scanner,
    AwsKms, AwsRds, FirewallSink, HttpFirewall, LoggingFirewall,
};
use summon_engine::{ClusterClient, KubeClusterClient};
use summon_platform::notification::NotificationEngine;
use summon_platform::tag_cache::{run_refresher, RegistryTagSource, TagCache};
use summon_platform::{platform_engine, PlatformDeps};

use cli::{Cli, Command, RunArgs};

/// Capacity of the channels background loops use to wake controllers
const TRIGGER_BUFFER: usize = 256;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(TelemetryConfig { json: cli.log_json })?;

    match cli.command {
        Some(Command::Crd) => print_crds(),
        Some(Command::Run(args)) => run(args).await,
        None => run(RunArgs::try_parse_from(["summon-operator"])?).await,
    }
}

fn print_crds() -> anyhow::Result<()> {
    for crd in owned_crds() {
        let yaml = serde_yaml::to_string(&crd).context("failed to serialize CRD")?;
        println!("---\n{}", yaml.trim_end());
    }
    Ok(())
}

fn install_crypto_provider() -> anyhow::Result<()> {
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install the aws-lc-rs crypto provider"))
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    install_crypto_provider()?;

    let platform_config = Arc::new(args.platform_config());
    let notification_config = args.notification_config();
    let controllers_config = args.controllers_config();

    let kube = Client::try_default()
        .await
        .context("failed to create kubernetes client")?;
    let cluster: Arc<dyn ClusterClient> = Arc::new(KubeClusterClient::new(kube.clone()));
    let clock: SharedClock = Arc::new(SystemClock);
    let shutdown = CancellationToken::new();

    let tag_cache = Arc::new(TagCache::new(Arc::new(RegistryTagSource::new(
        &platform_config.registry_url,
        &platform_config.image_repository,
        &platform_config.google_service_account_key,
    ))));
    let notifier = Arc::new(
        NotificationEngine::from_config(&notification_config)
            .context("failed to configure notification sinks")?,
    );
    let platform = Arc::new(platform_engine(
        cluster.clone(),
        PlatformDeps {
            config: platform_config.clone(),
            tag_cache: tag_cache.clone(),
            notifier,
            clock: clock.clone(),
        },
    )?);
    info!(components = ?platform.component_names(), "summonplatform engine ready");

    let sdk = summon_controllers::aws_sdk_config(&controllers_config.aws_region).await;
    let encrypted_secrets = Arc::new(encrypted_secret::engine(
        cluster.clone(),
        Arc::new(AwsKms::new(&sdk)),
    ));
    let ingresses = Arc::new(ridecell_ingress::engine(cluster.clone()));
    let snapshots = Arc::new(rds_snapshot::engine(
        cluster.clone(),
        Arc::new(AwsRds::new(&sdk)),
        clock.clone(),
        controllers_config.enable_finalizers,
    ));
    let migrations = Arc::new(migration_job::engine(
        cluster.clone(),
        controllers_config.enable_finalizers,
    ));
    let firewall_sink: Arc<dyn FirewallSink> = match &controllers_config.firewall_url {
        Some(url) => Arc::new(HttpFirewall::new(url.clone())?),
        None => {
            info!("no firewall broker configured, node rules are only logged");
            Arc::new(LoggingFirewall)
        }
    };
    let nodes = Arc::new(firewall::engine(cluster.clone(), firewall_sink));

    let (platform_tx, platform_rx) = mpsc::channel(TRIGGER_BUFFER);
    let (snapshot_tx, snapshot_rx) = mpsc::channel(TRIGGER_BUFFER);

    let mut tasks = JoinSet::new();
    tasks.spawn(platform.run(kube.clone(), Some(platform_rx), shutdown.clone()));
    tasks.spawn(encrypted_secrets.run(kube.clone(), None, shutdown.clone()));
    tasks.spawn(ingresses.run(kube.clone(), None, shutdown.clone()));
    tasks.spawn(snapshots.run(kube.clone(), Some(snapshot_rx), shutdown.clone()));
    tasks.spawn(migrations.run(kube.clone(), None, shutdown.clone()));
    tasks.spawn(nodes.run(kube, None, shutdown.clone()));
    tasks.spawn(run_refresher(
        tag_cache,
        cluster.clone(),
        platform_tx,
        shutdown.clone(),
    ));
    tasks.spawn(run_ttl_scanner(
        cluster,
        clock,
        controllers_config.snapshot_scan_interval,
        snapshot_tx,
        shutdown.clone(),
    ));
    info!(tasks = tasks.len(), "summon operator started");

    tokio::select! {
        _ = shutdown_signal() => info!("shutdown signal received"),
        Some(res) = tasks.join_next() => warn!(result = ?res, "a controller exited early"),
    }
    shutdown.cancel();
    while let Some(res) = tasks.join_next().await {
        if let Err(e) = res {
            warn!(error = %e, "task ended abnormally");
        }
    }
    info!("summon operator stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
