use rcgen::{CertificateParams, DnType, KeyPair, SanType};
use std::net::IpAddr;

/// Subject and SAN fields for a certificate request generated by the agent.
#[derive(Debug, Clone)]
pub struct CsrOptions {
    common_name: String,
    org_name: String,
    dns_names: Vec<String>,
    ip_addresses: Vec<IpAddr>,
}

/// A generated request plus the private key it was signed with.
pub struct GeneratedRequest {
    /// DER encoded PKCS#10 structure.
    pub csr_der: Vec<u8>,
    pub private_key_pem: String,
}

impl CsrOptions {
    pub fn new(common_name: impl Into<String>, org_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            org_name: org_name.into(),
            dns_names: Vec::new(),
            ip_addresses: Vec::new(),
        }
    }

    pub fn with_dns_names(mut self, dns_names: Vec<String>) -> Self {
        self.dns_names = dns_names;
        self
    }

    pub fn with_ip_addresses(mut self, ip_addresses: Vec<IpAddr>) -> Self {
        self.ip_addresses = ip_addresses;
        self
    }

    /// Generate a fresh key pair and a PKCS#10 request signed with it.
    pub fn generate(&self) -> anyhow::Result<GeneratedRequest> {
        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, self.common_name.clone());
        params
            .distinguished_name
            .push(DnType::OrganizationName, self.org_name.clone());
        for dns in &self.dns_names {
            params
                .subject_alt_names
                .push(SanType::DnsName(dns.as_str().try_into()?));
        }
        for ip in &self.ip_addresses {
            params.subject_alt_names.push(SanType::IpAddress(*ip));
        }

        let key_pair = KeyPair::generate()?;
        let csr = params.serialize_request(&key_pair)?;

        Ok(GeneratedRequest {
            csr_der: csr.der().to_vec(),
            private_key_pem: key_pair.serialize_pem(),
        })
    }
}
