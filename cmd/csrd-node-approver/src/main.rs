use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use pkg_approver::client::HttpClient;
use pkg_approver::controller::{ApproverController, discover_role_groups};
use pkg_approver::recognizer::{PolicyEngine, node_role_recognizers};
use pkg_approver::sync::SyncEngine;
use pkg_cloud::CloudProvider;
use pkg_cloud::config::{CloudConfig, VmKind};
use pkg_cloud::rest::RestCloudApi;
use pkg_cloud::scaleset::ScaleSetResolver;
use pkg_cloud::standalone::StandaloneResolver;

#[derive(Parser, Debug)]
#[command(
    name = "csrd-node-approver",
    about = "auto-approves node client certificate requests for master and worker roles"
)]
struct Cli {
    /// Path to the YAML cloud provider config
    #[arg(long, short, default_value = "/etc/csrd/cloud.yaml")]
    cloud_config: String,

    /// Base URL of the cloud API gateway
    #[arg(long)]
    cloud_endpoint: String,

    /// Base URL of the cluster API
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    api_endpoint: String,

    /// Seconds between full re-lists of pending signing requests
    #[arg(long, default_value_t = pkg_constants::approver::DEFAULT_RESYNC_SECS)]
    resync_secs: u64,

    /// Number of reconcile workers
    #[arg(long, default_value_t = pkg_constants::approver::DEFAULT_WORKERS)]
    workers: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let config = CloudConfig::load(&cli.cloud_config)?;
    info!("Starting csrd-node-approver");
    info!("  Cloud config:   {}", cli.cloud_config);
    info!("  VM kind:        {:?}", config.vm_kind);
    info!("  Cluster API:    {}", cli.api_endpoint);

    let transport = Arc::new(RestCloudApi::new(&cli.cloud_endpoint));
    let backoff = config.backoff();
    let cloud: Arc<dyn CloudProvider> = match config.vm_kind {
        VmKind::Standard => Arc::new(StandaloneResolver::new(
            transport,
            config.vm_cache_ttl(),
            backoff,
        )),
        VmKind::ScaleSet => {
            let fallback =
                StandaloneResolver::new(transport.clone(), config.vm_cache_ttl(), backoff);
            let resolver = Arc::new(ScaleSetResolver::new(
                transport,
                fallback,
                backoff,
                config.negative_cache_ttl(),
            ));
            resolver.spawn_periodic_refresh(config.snapshot_refresh_interval());
            resolver
        }
    };

    let client = Arc::new(HttpClient::new(&cli.api_endpoint));

    // the role allow-lists come from the instance groups of nodes that are
    // already registered; wait until both roles are represented
    let deadline = tokio::time::Instant::now() + Duration::from_secs(300);
    let (masters, workers) = loop {
        match discover_role_groups(client.as_ref(), cloud.as_ref()).await {
            Ok(groups) => break groups,
            Err(e) if tokio::time::Instant::now() < deadline => {
                warn!("role group discovery not ready: {}, retrying", e);
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            Err(e) => anyhow::bail!("couldn't complete role group discovery: {}", e),
        }
    };
    info!("  Master groups:  {:?}", masters);
    info!("  Worker groups:  {:?}", workers);

    let policy = PolicyEngine::new(
        node_role_recognizers(masters, workers),
        cloud,
        client.clone(),
    );
    let engine = SyncEngine::new(client.clone(), policy);
    let controller = ApproverController::new(
        client,
        engine,
        Duration::from_secs(cli.resync_secs),
        cli.workers,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    controller.run(shutdown_rx).await
}
