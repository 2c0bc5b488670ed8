use std::time::Duration;

use pkg_constants::signer::{
    DEFAULT_CERT_DURATION_HOURS, ETCD_METRIC_ORG, ETCD_PEER_ORG, ETCD_SERVER_ORG,
};
use pkg_pki::parse::ParsedCertificateRequest;
use pkg_types::request::KeyUsage;

/// Signing profile for one workload class. Each profile fixes the allowed
/// key usages and the certificate validity duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    EtcdPeer,
    EtcdServer,
    EtcdMetric,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProfileError {
    #[error("invalid organization")]
    InvalidOrganization,
    #[error("invalid subject common name")]
    InvalidCommonName,
}

/// Select the profile for a verified request. The organization must be
/// exactly one recognized value, and the common name must carry the prefix
/// derived from it (`system:etcd-peers` -> `system:etcd-peer:`).
pub fn profile_for(parsed: &ParsedCertificateRequest) -> Result<Profile, ProfileError> {
    let [org] = parsed.organizations.as_slice() else {
        return Err(ProfileError::InvalidOrganization);
    };

    let profile = match org.as_str() {
        ETCD_PEER_ORG => Profile::EtcdPeer,
        ETCD_SERVER_ORG => Profile::EtcdServer,
        ETCD_METRIC_ORG => Profile::EtcdMetric,
        _ => return Err(ProfileError::InvalidOrganization),
    };

    // drop the plural 's' from the org to get the common name prefix
    let prefix = format!("{}:", &org[..org.len() - 1]);
    if !parsed.common_name.starts_with(&prefix) {
        return Err(ProfileError::InvalidCommonName);
    }

    Ok(profile)
}

/// Per-profile certificate durations.
#[derive(Debug, Clone, Copy)]
pub struct SigningPolicy {
    pub peer_duration: Duration,
    pub server_duration: Duration,
    pub metric_duration: Duration,
}

impl Default for SigningPolicy {
    fn default() -> Self {
        let year = Duration::from_secs(DEFAULT_CERT_DURATION_HOURS * 3600);
        Self {
            peer_duration: year,
            server_duration: year,
            metric_duration: year,
        }
    }
}

impl SigningPolicy {
    pub fn usages(profile: Profile) -> &'static [KeyUsage] {
        match profile {
            Profile::EtcdPeer | Profile::EtcdMetric => &[
                KeyUsage::KeyEncipherment,
                KeyUsage::DigitalSignature,
                KeyUsage::ClientAuth,
                KeyUsage::ServerAuth,
            ],
            Profile::EtcdServer => &[
                KeyUsage::KeyEncipherment,
                KeyUsage::DigitalSignature,
                KeyUsage::ServerAuth,
            ],
        }
    }

    pub fn duration(&self, profile: Profile) -> Duration {
        match profile {
            Profile::EtcdPeer => self.peer_duration,
            Profile::EtcdServer => self.server_duration,
            Profile::EtcdMetric => self.metric_duration,
        }
    }
}
