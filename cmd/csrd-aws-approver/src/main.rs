use clap::Parser;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

use pkg_approver::client::HttpClient;
use pkg_approver::controller::ApproverController;
use pkg_approver::recognizer::{PolicyEngine, aws_recognizers};
use pkg_approver::sync::SyncEngine;
use pkg_cloud::aws::{AwsCloud, region_from_zone};
use pkg_cloud::backoff::Backoff;
use pkg_cloud::rest::RestCloudApi;

#[derive(Parser, Debug)]
#[command(
    name = "csrd-aws-approver",
    about = "auto-approves node client certificate requests backed by verified scaling-group identity"
)]
struct Cli {
    /// Cloud region name
    #[arg(long)]
    region: Option<String>,

    /// Availability zone to derive the region from when --region is not set
    #[arg(long)]
    zone: Option<String>,

    /// Comma separated allow-list of auto scaling group names
    #[arg(long, value_delimiter = ',', required = true)]
    allowed_groups: Vec<String>,

    /// Base URL of the cluster API
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    api_endpoint: String,

    /// Base URL of the cloud API gateway
    #[arg(long)]
    cloud_endpoint: String,

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

    let region = match (&cli.region, &cli.zone) {
        (Some(region), _) => region.clone(),
        (None, Some(zone)) => region_from_zone(zone)?,
        (None, None) => anyhow::bail!("either --region or --zone is required"),
    };

    info!("Starting csrd-aws-approver");
    info!("  Region:          {}", region);
    info!("  Allowed groups:  {:?}", cli.allowed_groups);
    info!("  Cluster API:     {}", cli.api_endpoint);
    info!("  Cloud endpoint:  {}", cli.cloud_endpoint);

    let transport = Arc::new(RestCloudApi::new(&cli.cloud_endpoint));
    let cloud = Arc::new(AwsCloud::new(
        transport.clone(),
        transport,
        Backoff::default(),
    ));

    let client = Arc::new(HttpClient::new(&cli.api_endpoint));
    let allowed: HashSet<String> = cli.allowed_groups.into_iter().collect();
    let policy = PolicyEngine::new(aws_recognizers(allowed), cloud, client.clone());
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
