use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use std::time::Duration;
use tracing::info;

use pkg_types::request::KeyUsage;

/// A certificate authority loaded from a PEM cert/key pair, able to issue
/// leaf certificates from externally submitted PKCS#10 requests.
pub struct SigningAuthority {
    ca_cert_pem: String,
    ca_key_pair: KeyPair,
    ca_cert: rcgen::Certificate,
}

impl SigningAuthority {
    /// Load a CA from PEM encoded certificate and private key strings.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> anyhow::Result<Self> {
        let ca_key_pair = KeyPair::from_pem(key_pem)?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem)?;
        // Re-derive the issuing certificate from the stored parameters; the
        // issuer name and key are what children are verified against.
        let ca_cert = params.self_signed(&ca_key_pair)?;

        Ok(Self {
            ca_cert_pem: cert_pem.to_string(),
            ca_key_pair,
            ca_cert,
        })
    }

    /// Load a CA from certificate and private key files on disk.
    pub fn from_files(cert_path: &str, key_path: &str) -> anyhow::Result<Self> {
        let cert_pem = std::fs::read_to_string(cert_path)
            .map_err(|e| anyhow::anyhow!("error reading CA cert file {:?}: {}", cert_path, e))?;
        let key_pem = std::fs::read_to_string(key_path)
            .map_err(|e| anyhow::anyhow!("error reading CA key file {:?}: {}", key_path, e))?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Create a fresh self-signed CA.
    pub fn generate(common_name: &str) -> anyhow::Result<Self> {
        info!("Generating self-signed CA: {}", common_name);

        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, common_name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let key_pair = KeyPair::generate()?;
        let ca_cert = params.self_signed(&key_pair)?;
        let ca_cert_pem = ca_cert.pem();

        Ok(Self {
            ca_cert_pem,
            ca_key_pair: key_pair,
            ca_cert,
        })
    }

    /// Issue a leaf certificate for the given DER encoded PKCS#10 request,
    /// restricted to the given usages and validity window.
    /// Returns the certificate PEM.
    pub fn issue(
        &self,
        csr_der: &[u8],
        usages: &[KeyUsage],
        valid_for: Duration,
    ) -> anyhow::Result<String> {
        let csr_pem = pem::encode(&pem::Pem::new("CERTIFICATE REQUEST", csr_der.to_vec()));
        let mut csr_params = CertificateSigningRequestParams::from_pem(&csr_pem)?;

        let now = time::OffsetDateTime::now_utc();
        csr_params.params.not_before = now;
        csr_params.params.not_after = now + valid_for;
        csr_params.params.is_ca = IsCa::NoCa;
        csr_params.params.key_usages = usages
            .iter()
            .filter_map(|u| match u {
                KeyUsage::DigitalSignature => Some(KeyUsagePurpose::DigitalSignature),
                KeyUsage::KeyEncipherment => Some(KeyUsagePurpose::KeyEncipherment),
                _ => None,
            })
            .collect();
        csr_params.params.extended_key_usages = usages
            .iter()
            .filter_map(|u| match u {
                KeyUsage::ClientAuth => Some(ExtendedKeyUsagePurpose::ClientAuth),
                KeyUsage::ServerAuth => Some(ExtendedKeyUsagePurpose::ServerAuth),
                _ => None,
            })
            .collect();

        let cert = csr_params.signed_by(&self.ca_cert, &self.ca_key_pair)?;
        Ok(cert.pem())
    }

    /// Return the CA certificate PEM.
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Serialize the CA private key as PEM.
    pub fn ca_key_pem(&self) -> String {
        self.ca_key_pair.serialize_pem()
    }
}

/// True iff `cert_pem` carries a signature made by the CA in `ca_pem`.
pub fn certificate_verifies_against(cert_pem: &str, ca_pem: &str) -> anyhow::Result<bool> {
    let (_, cert_der) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
        .map_err(|e| anyhow::anyhow!("error parsing certificate PEM: {}", e))?;
    let cert = cert_der.parse_x509()?;

    let (_, ca_der) = x509_parser::pem::parse_x509_pem(ca_pem.as_bytes())
        .map_err(|e| anyhow::anyhow!("error parsing CA PEM: {}", e))?;
    let ca = ca_der.parse_x509()?;

    Ok(cert.verify_signature(Some(ca.public_key())).is_ok())
}
