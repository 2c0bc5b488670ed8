use std::net::IpAddr;

use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::{FromDer, X509CertificationRequest};

/// Why an embedded PKCS#10 request was rejected before policy evaluation.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// The request bytes are not a well formed PKCS#10 structure.
    #[error("malformed certificate request: {0}")]
    Malformed(String),
    /// The request's self-signature does not verify against its public key.
    #[error("certificate request signature did not verify: {0}")]
    BadSignature(String),
}

/// Subject and SAN fields extracted from a verified PKCS#10 request.
#[derive(Debug, Clone, Default)]
pub struct ParsedCertificateRequest {
    pub common_name: String,
    pub organizations: Vec<String>,
    pub dns_names: Vec<String>,
    pub email_addresses: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
}

impl ParsedCertificateRequest {
    /// True when the request carries no subject alternative names at all.
    pub fn has_no_sans(&self) -> bool {
        self.dns_names.is_empty() && self.email_addresses.is_empty() && self.ip_addresses.is_empty()
    }
}

/// Parses a DER encoded PKCS#10 request and verifies its self-signature.
/// Both must succeed before any policy predicate runs.
pub fn parse_and_verify(der: &[u8]) -> Result<ParsedCertificateRequest, ParseError> {
    let (rest, csr) = X509CertificationRequest::from_der(der)
        .map_err(|e| ParseError::Malformed(e.to_string()))?;
    if !rest.is_empty() {
        return Err(ParseError::Malformed(format!(
            "{} trailing bytes after request",
            rest.len()
        )));
    }

    csr.verify_signature()
        .map_err(|e| ParseError::BadSignature(e.to_string()))?;

    let subject = &csr.certification_request_info.subject;
    let common_name = subject
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or_default()
        .to_string();
    let organizations = subject
        .iter_organization()
        .filter_map(|o| o.as_str().ok())
        .map(str::to_string)
        .collect();

    let mut parsed = ParsedCertificateRequest {
        common_name,
        organizations,
        ..Default::default()
    };

    if let Some(extensions) = csr.requested_extensions() {
        for extension in extensions {
            if let ParsedExtension::SubjectAlternativeName(san) = extension {
                for name in &san.general_names {
                    match name {
                        GeneralName::DNSName(dns) => parsed.dns_names.push(dns.to_string()),
                        GeneralName::RFC822Name(email) => {
                            parsed.email_addresses.push(email.to_string())
                        }
                        GeneralName::IPAddress(bytes) => {
                            if let Some(ip) = ip_from_bytes(bytes) {
                                parsed.ip_addresses.push(ip);
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    Ok(parsed)
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        _ => None,
    }
}
