use clap::Parser;
use std::net::IpAddr;
use tracing::info;

use pkg_agent::agent::{CertAgent, CsrConfig};

#[derive(Parser, Debug)]
#[command(
    name = "csrd-cert-agent",
    about = "requests a signed certificate from the signer and writes the assets to disk"
)]
struct Cli {
    /// Common name for the certificate subject
    #[arg(long, required = true)]
    common_name: String,

    /// Organization for the certificate subject
    #[arg(long, required = true)]
    org: String,

    /// Comma separated DNS subject alternative names
    #[arg(long, value_delimiter = ',')]
    dns_names: Vec<String>,

    /// Comma separated IP subject alternative names
    #[arg(long, value_delimiter = ',')]
    ip_addrs: Vec<IpAddr>,

    /// Directory where the private key and certificate are written
    #[arg(long, default_value = "/etc/ssl/csrd")]
    assets_dir: String,

    /// Name of the signing request; defaults to the common name
    #[arg(long)]
    csr_name: Option<String>,

    /// Base URL of the signer server
    #[arg(long, required = true)]
    signer_url: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    std::fs::create_dir_all(&cli.assets_dir)?;

    let config = CsrConfig {
        csr_name: cli
            .csr_name
            .clone()
            .unwrap_or_else(|| cli.common_name.clone()),
        common_name: cli.common_name,
        org_name: cli.org,
        dns_names: cli.dns_names,
        ip_addresses: cli.ip_addrs,
        assets_dir: cli.assets_dir,
    };

    info!("Requesting certificate for {}", config.common_name);
    let agent = CertAgent::new(config, &cli.signer_url);
    agent.request_certificate().await?;
    info!("Certificate request complete");
    Ok(())
}
