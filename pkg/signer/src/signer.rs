use tracing::{info, warn};

use crate::profiles::{Profile, ProfileError, SigningPolicy, profile_for};
use pkg_pki::ca::SigningAuthority;
use pkg_pki::parse::{ParseError, parse_and_verify};
use pkg_types::request::{Condition, ConditionKind, SigningRequest};

#[derive(Debug, thiserror::Error)]
pub enum SignError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Profile(#[from] ProfileError),
    /// The selected profile's CA pair was not configured.
    #[error("csr profile is not currently supported")]
    ProfileUnsupported,
    #[error("certificate signing error: {0}")]
    Issue(String),
}

/// File locations of the signer CA assets. The peer and server profiles
/// share the main pair; the metrics profile uses its own.
#[derive(Debug, Clone, Default)]
pub struct SignerCaFiles {
    pub ca_cert: Option<String>,
    pub ca_key: Option<String>,
    pub metric_ca_cert: Option<String>,
    pub metric_ca_key: Option<String>,
}

/// Signs certificate requests from etcd nodes. Requests from any other
/// workload class are denied outright.
pub struct CertSigner {
    ca: Option<SigningAuthority>,
    metric_ca: Option<SigningAuthority>,
    policy: SigningPolicy,
}

impl CertSigner {
    pub fn new(
        ca: Option<SigningAuthority>,
        metric_ca: Option<SigningAuthority>,
        policy: SigningPolicy,
    ) -> anyhow::Result<Self> {
        if ca.is_none() && metric_ca.is_none() {
            anyhow::bail!("at least one signer CA cert/key pair is required");
        }
        Ok(Self {
            ca,
            metric_ca,
            policy,
        })
    }

    /// Load the configured CA pairs from disk.
    pub fn from_files(files: &SignerCaFiles, policy: SigningPolicy) -> anyhow::Result<Self> {
        let ca = match (&files.ca_cert, &files.ca_key) {
            (Some(cert), Some(key)) => Some(SigningAuthority::from_files(cert, key)?),
            _ => None,
        };
        let metric_ca = match (&files.metric_ca_cert, &files.metric_ca_key) {
            (Some(cert), Some(key)) => Some(SigningAuthority::from_files(cert, key)?),
            _ => None,
        };
        Self::new(ca, metric_ca, policy)
    }

    fn authority(&self, profile: Profile) -> Result<&SigningAuthority, SignError> {
        let authority = match profile {
            Profile::EtcdPeer | Profile::EtcdServer => self.ca.as_ref(),
            Profile::EtcdMetric => self.metric_ca.as_ref(),
        };
        authority.ok_or(SignError::ProfileUnsupported)
    }

    /// Sign the request in place. On success the certificate field is
    /// populated and the Approved condition set; on any failure the request
    /// is explicitly Denied with a message. Failed signing is terminal, not
    /// retried.
    pub fn sign(&self, request: &mut SigningRequest) -> Result<(), SignError> {
        let result = self.try_sign(request);
        match &result {
            Ok(()) => {
                request.status.conditions = vec![Condition {
                    kind: ConditionKind::Approved,
                    reason: "Signed".to_string(),
                    message: String::new(),
                }];
                info!("signed certificate request {}", request.name);
            }
            Err(e) => {
                request.status.conditions = vec![Condition {
                    kind: ConditionKind::Denied,
                    reason: String::new(),
                    message: format!("certificate signing error: {}", e),
                }];
                warn!("denied certificate request {}: {}", request.name, e);
            }
        }
        result
    }

    fn try_sign(&self, request: &mut SigningRequest) -> Result<(), SignError> {
        let parsed = parse_and_verify(&request.request)?;
        let profile = profile_for(&parsed)?;
        let authority = self.authority(profile)?;

        let cert_pem = authority
            .issue(
                &request.request,
                SigningPolicy::usages(profile),
                self.policy.duration(profile),
            )
            .map_err(|e| SignError::Issue(e.to_string()))?;

        request.status.certificate = Some(cert_pem.into_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pkg_pki::ca::certificate_verifies_against;
    use pkg_pki::csr::CsrOptions;
    use pkg_types::request::RequestStatus;

    fn request_for(cn: &str, org: &str) -> SigningRequest {
        let generated = CsrOptions::new(cn, org).generate().unwrap();
        SigningRequest {
            name: "etcd-csr".into(),
            username: cn.to_string(),
            groups: vec![],
            usages: vec![],
            request: generated.csr_der,
            status: RequestStatus::default(),
            resource_version: 0,
            created_at: Utc::now(),
        }
    }

    fn signer_with_main_ca() -> (CertSigner, String) {
        let ca = SigningAuthority::generate("etcd-signer-ca").unwrap();
        let ca_pem = ca.ca_cert_pem().to_string();
        (
            CertSigner::new(Some(ca), None, SigningPolicy::default()).unwrap(),
            ca_pem,
        )
    }

    #[test]
    fn peer_request_is_signed_against_the_main_ca() {
        let (signer, ca_pem) = signer_with_main_ca();
        let mut request = request_for("system:etcd-peer:1", "system:etcd-peers");

        signer.sign(&mut request).unwrap();

        assert!(request.is_approved());
        let cert_pem = String::from_utf8(request.status.certificate.unwrap()).unwrap();
        assert!(certificate_verifies_against(&cert_pem, &ca_pem).unwrap());

        // and is rejected by an unrelated root
        let other = SigningAuthority::generate("unrelated-ca").unwrap();
        assert!(!certificate_verifies_against(&cert_pem, other.ca_cert_pem()).unwrap());
    }

    #[test]
    fn unrecognized_org_is_denied() {
        let (signer, _) = signer_with_main_ca();
        let mut request = request_for("system:node:foo", "system:nodes");

        let err = signer.sign(&mut request).unwrap_err();
        assert!(matches!(
            err,
            SignError::Profile(ProfileError::InvalidOrganization)
        ));
        let (approved, denied) = request.approval_condition();
        assert!(!approved);
        assert!(denied);
        assert!(request.status.certificate.is_none());
    }

    #[test]
    fn common_name_prefix_mismatch_is_denied() {
        let (signer, _) = signer_with_main_ca();
        let mut request = request_for("system:etcd-server:1", "system:etcd-peers");

        let err = signer.sign(&mut request).unwrap_err();
        assert!(matches!(
            err,
            SignError::Profile(ProfileError::InvalidCommonName)
        ));
    }

    #[test]
    fn metric_profile_without_metric_ca_is_unsupported() {
        let (signer, _) = signer_with_main_ca();
        let mut request = request_for("system:etcd-metric:1", "system:etcd-metrics");

        let err = signer.sign(&mut request).unwrap_err();
        assert!(matches!(err, SignError::ProfileUnsupported));
        let (_, denied) = request.approval_condition();
        assert!(denied);
    }

    #[test]
    fn metric_profile_uses_the_metric_ca() {
        let main = SigningAuthority::generate("etcd-signer-ca").unwrap();
        let metric = SigningAuthority::generate("etcd-metric-ca").unwrap();
        let main_pem = main.ca_cert_pem().to_string();
        let metric_pem = metric.ca_cert_pem().to_string();
        let signer = CertSigner::new(Some(main), Some(metric), SigningPolicy::default()).unwrap();

        let mut request = request_for("system:etcd-metric:1", "system:etcd-metrics");
        signer.sign(&mut request).unwrap();

        let cert_pem = String::from_utf8(request.status.certificate.unwrap()).unwrap();
        assert!(certificate_verifies_against(&cert_pem, &metric_pem).unwrap());
        assert!(!certificate_verifies_against(&cert_pem, &main_pem).unwrap());
    }

    #[test]
    fn malformed_embedded_request_is_denied() {
        let (signer, _) = signer_with_main_ca();
        let mut request = request_for("system:etcd-peer:1", "system:etcd-peers");
        request.request = b"garbage".to_vec();

        assert!(matches!(
            signer.sign(&mut request).unwrap_err(),
            SignError::Parse(_)
        ));
        let (_, denied) = request.approval_condition();
        assert!(denied);
    }

    #[test]
    fn no_configured_ca_is_rejected_at_construction() {
        assert!(CertSigner::new(None, None, SigningPolicy::default()).is_err());
    }
}
