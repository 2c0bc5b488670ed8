use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

use pkg_constants::signer::DEFAULT_CERT_DURATION_HOURS;
use pkg_signer::profiles::SigningPolicy;
use pkg_signer::server::{ServerConfig, start_server};
use pkg_signer::signer::{CertSigner, SignerCaFiles};

#[derive(Parser, Debug)]
#[command(
    name = "csrd-etcd-signer",
    about = "signs certificate requests from etcd peers, servers and metrics endpoints"
)]
struct Cli {
    /// CA certificate file for the signer
    #[arg(long)]
    cacrt: Option<String>,

    /// CA private key file for the signer
    #[arg(long)]
    cakey: Option<String>,

    /// CA certificate file for the metrics signer
    #[arg(long)]
    metric_cacrt: Option<String>,

    /// CA private key file for the metrics signer
    #[arg(long)]
    metric_cakey: Option<String>,

    /// Address on which the signer listens for requests
    #[arg(long, default_value = "0.0.0.0:6443")]
    address: String,

    /// Optional address serving only the health check
    #[arg(long)]
    health_address: Option<String>,

    /// Certificate duration for etcd peer certs, in hours
    #[arg(long, default_value_t = DEFAULT_CERT_DURATION_HOURS)]
    peer_cert_dur_hours: u64,

    /// Certificate duration for etcd server certs, in hours
    #[arg(long, default_value_t = DEFAULT_CERT_DURATION_HOURS)]
    server_cert_dur_hours: u64,

    /// Certificate duration for etcd metrics certs, in hours
    #[arg(long, default_value_t = DEFAULT_CERT_DURATION_HOURS)]
    metric_cert_dur_hours: u64,

    /// Directory where the signer persists signing request results
    #[arg(long, required = true)]
    csr_dir: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let ca_files = SignerCaFiles {
        ca_cert: cli.cacrt,
        ca_key: cli.cakey,
        metric_ca_cert: cli.metric_cacrt,
        metric_ca_key: cli.metric_cakey,
    };
    let policy = SigningPolicy {
        peer_duration: Duration::from_secs(cli.peer_cert_dur_hours * 3600),
        server_duration: Duration::from_secs(cli.server_cert_dur_hours * 3600),
        metric_duration: Duration::from_secs(cli.metric_cert_dur_hours * 3600),
    };
    let signer = CertSigner::from_files(&ca_files, policy)?;

    let addr: SocketAddr = cli.address.parse()?;
    let health_addr = cli
        .health_address
        .as_deref()
        .map(str::parse::<SocketAddr>)
        .transpose()?;

    info!("Starting csrd-etcd-signer");
    info!("  Address:  {}", addr);
    info!("  CSR dir:  {}", cli.csr_dir);

    start_server(
        ServerConfig {
            addr,
            health_addr,
            csr_dir: cli.csr_dir,
        },
        signer,
    )
    .await
}
