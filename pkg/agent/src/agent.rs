use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use pkg_pki::csr::CsrOptions;
use pkg_types::request::{RequestStatus, SigningRequest};

/// Configuration values required to generate a certificate signing request
/// for the agent.
#[derive(Debug, Clone)]
pub struct CsrConfig {
    pub common_name: String,
    pub org_name: String,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
    /// Directory where the private key and signed certificate are saved.
    pub assets_dir: String,
    /// Name of the signing request submitted to the signer.
    pub csr_name: String,
}

/// What the certificate poll loop should do with a fetched request.
#[derive(Debug, PartialEq, Eq)]
enum PollOutcome {
    /// Not decided yet, or approved with the certificate still pending.
    Retry,
    Ready,
    Denied(String),
}

fn poll_outcome(request: &SigningRequest) -> PollOutcome {
    let (approved, denied) = request.approval_condition();
    if denied {
        let message = request
            .status
            .conditions
            .iter()
            .map(|c| c.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        return PollOutcome::Denied(message);
    }
    if !approved {
        return PollOutcome::Retry;
    }
    match &request.status.certificate {
        Some(cert) if !cert.is_empty() => PollOutcome::Ready,
        // approved but the signed certificate has not landed yet
        _ => PollOutcome::Retry,
    }
}

/// Submits a certificate signing request to the signer and retrieves the
/// signed certificate, writing both key and certificate to the assets
/// directory.
pub struct CertAgent {
    config: CsrConfig,
    signer_url: String,
    http: reqwest::Client,
    submit_interval: Duration,
    poll_interval: Duration,
    poll_timeout: Duration,
}

impl CertAgent {
    pub fn new(config: CsrConfig, signer_url: &str) -> Self {
        Self {
            config,
            signer_url: signer_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            submit_interval: Duration::from_secs(10),
            poll_interval: Duration::from_secs(3),
            poll_timeout: Duration::from_secs(30),
        }
    }

    /// Generate a fresh key pair and signing request; the private key is
    /// written to the assets directory immediately.
    fn generate_request(&self) -> anyhow::Result<SigningRequest> {
        let generated = CsrOptions::new(&self.config.common_name, &self.config.org_name)
            .with_dns_names(self.config.dns_names.clone())
            .with_ip_addresses(self.config.ip_addresses.clone())
            .generate()?;

        let key_path =
            Path::new(&self.config.assets_dir).join(format!("{}.key", self.config.common_name));
        std::fs::write(&key_path, generated.private_key_pem.as_bytes())
            .map_err(|e| anyhow::anyhow!("unable to write to {:?}: {}", key_path, e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(SigningRequest {
            name: self.config.csr_name.clone(),
            username: self.config.common_name.clone(),
            groups: vec![],
            usages: vec![],
            request: generated.csr_der,
            status: RequestStatus::default(),
            resource_version: 0,
            created_at: Utc::now(),
        })
    }

    /// Create a signing request and send it to the signer, retrying the
    /// submission until the signer responds, then wait for the signed
    /// certificate and write it to disk.
    pub async fn request_certificate(&self) -> anyhow::Result<()> {
        let request = self.generate_request()?;
        let url = format!("{}/certificatesigningrequests", self.signer_url);

        // retry the submission until the signer is reachable
        loop {
            match self.http.post(&url).json(&request).send().await {
                Ok(_) => break,
                Err(e) => {
                    error!("error sending signing request to signer: {}", e);
                    tokio::time::sleep(self.submit_interval).await;
                }
            }
        }

        let signed = self.wait_for_certificate().await?;
        let certificate = signed
            .status
            .certificate
            .ok_or_else(|| anyhow::anyhow!("signer returned no certificate"))?;

        let cert_path =
            Path::new(&self.config.assets_dir).join(format!("{}.crt", self.config.common_name));
        std::fs::write(&cert_path, &certificate)
            .map_err(|e| anyhow::anyhow!("unable to write to {:?}: {}", cert_path, e))?;
        info!("wrote signed certificate to {:?}", cert_path);
        Ok(())
    }

    /// Poll the signer until the request is terminal or the timeout lapses.
    pub async fn wait_for_certificate(&self) -> anyhow::Result<SigningRequest> {
        let url = format!(
            "{}/certificatesigningrequests/{}",
            self.signer_url, self.config.csr_name
        );
        let deadline = tokio::time::Instant::now() + self.poll_timeout;

        loop {
            match self.fetch(&url).await {
                Ok(request) => match poll_outcome(&request) {
                    PollOutcome::Ready => return Ok(request),
                    PollOutcome::Denied(message) => {
                        anyhow::bail!("signing request denied: {}", message)
                    }
                    PollOutcome::Retry => {
                        warn!("signing request not decided yet, retrying");
                    }
                },
                Err(e) => warn!("unable to retrieve signing request: {}, retrying", e),
            }
            if tokio::time::Instant::now() + self.poll_interval > deadline {
                anyhow::bail!("timed out waiting for signed certificate");
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn fetch(&self, url: &str) -> anyhow::Result<SigningRequest> {
        let request = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json::<SigningRequest>()
            .await?;
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::request::{Condition, ConditionKind};

    fn base_request() -> SigningRequest {
        SigningRequest {
            name: "etcd-0".into(),
            username: "system:etcd-peer:0".into(),
            groups: vec![],
            usages: vec![],
            request: vec![],
            status: RequestStatus::default(),
            resource_version: 0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn undecided_request_keeps_polling() {
        assert_eq!(poll_outcome(&base_request()), PollOutcome::Retry);
    }

    #[test]
    fn approved_without_certificate_keeps_polling() {
        let mut request = base_request();
        request.status.conditions.push(Condition {
            kind: ConditionKind::Approved,
            reason: String::new(),
            message: String::new(),
        });
        assert_eq!(poll_outcome(&request), PollOutcome::Retry);
    }

    #[test]
    fn approved_with_certificate_is_ready() {
        let mut request = base_request();
        request.status.conditions.push(Condition {
            kind: ConditionKind::Approved,
            reason: String::new(),
            message: String::new(),
        });
        request.status.certificate = Some(b"cert".to_vec());
        assert_eq!(poll_outcome(&request), PollOutcome::Ready);
    }

    #[test]
    fn denied_request_reports_the_message() {
        let mut request = base_request();
        request.status.conditions.push(Condition {
            kind: ConditionKind::Denied,
            reason: String::new(),
            message: "invalid organization".into(),
        });
        assert_eq!(
            poll_outcome(&request),
            PollOutcome::Denied("invalid organization".into())
        );
    }
}
