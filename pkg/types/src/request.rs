use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use pkg_constants::identity::{BOOTSTRAPPER_USERNAME_PREFIX, NODE_NAME_PREFIX};

// --- Key usages ---

/// Key usage requested for the issued certificate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum KeyUsage {
    #[serde(rename = "digital signature")]
    DigitalSignature,
    #[serde(rename = "key encipherment")]
    KeyEncipherment,
    #[serde(rename = "client auth")]
    ClientAuth,
    #[serde(rename = "server auth")]
    ServerAuth,
}

/// Usage set presented by a kubelet requesting a client certificate.
pub const KUBELET_CLIENT_USAGES: [KeyUsage; 3] = [
    KeyUsage::KeyEncipherment,
    KeyUsage::DigitalSignature,
    KeyUsage::ClientAuth,
];

/// True iff `usages` and `expected` are equal as sets, regardless of order
/// or duplicates. A superset or subset of the expected usages does not match.
pub fn has_exact_usages(usages: &[KeyUsage], expected: &[KeyUsage]) -> bool {
    let got: HashSet<KeyUsage> = usages.iter().copied().collect();
    let want: HashSet<KeyUsage> = expected.iter().copied().collect();
    got == want
}

// --- Status conditions ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConditionKind {
    Approved,
    Denied,
}

/// A terminal marker on a signing request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub kind: ConditionKind,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// PEM certificate, populated only after approval and signing.
    #[serde(default)]
    pub certificate: Option<Vec<u8>>,
}

// --- Signing request ---

/// One certificate signing request and its outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningRequest {
    pub name: String,
    /// Requester identity supplied by the authentication layer that accepted
    /// the original submission.
    pub username: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub usages: Vec<KeyUsage>,
    /// DER encoded PKCS#10 certificate request.
    pub request: Vec<u8>,
    #[serde(default)]
    pub status: RequestStatus,
    /// Compare-and-swap token; bumped by the API on every status write.
    #[serde(default)]
    pub resource_version: u64,
    pub created_at: DateTime<Utc>,
}

impl SigningRequest {
    /// Returns the approved and denied flags from the status conditions.
    pub fn approval_condition(&self) -> (bool, bool) {
        let mut approved = false;
        let mut denied = false;
        for c in &self.status.conditions {
            match c.kind {
                ConditionKind::Approved => approved = true,
                ConditionKind::Denied => denied = true,
            }
        }
        (approved, denied)
    }

    /// True if the request has the Approved condition and no Denied condition.
    pub fn is_approved(&self) -> bool {
        let (approved, denied) = self.approval_condition();
        approved && !denied
    }

    /// A request is terminal once it carries any condition or a certificate;
    /// the approval engine never mutates a terminal request.
    pub fn is_terminal(&self) -> bool {
        self.status.certificate.is_some() || !self.status.conditions.is_empty()
    }
}

// --- Identity string helpers ---

/// Extracts the node name from a common name of the form
/// `system:node:<nodename>`.
pub fn node_name_from_common_name(cn: &str) -> anyhow::Result<&str> {
    cn.strip_prefix(NODE_NAME_PREFIX)
        .ok_or_else(|| anyhow::anyhow!("common name {:?} lacks {} prefix", cn, NODE_NAME_PREFIX))
}

/// Extracts the instance id from a username of the form
/// `system:bootstrappers:<instance-id>`.
pub fn instance_id_from_username(username: &str) -> anyhow::Result<&str> {
    username.strip_prefix(BOOTSTRAPPER_USERNAME_PREFIX).ok_or_else(|| {
        anyhow::anyhow!(
            "username {:?} lacks {} prefix",
            username,
            BOOTSTRAPPER_USERNAME_PREFIX
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_usages_is_set_equality() {
        let expected = KUBELET_CLIENT_USAGES;
        let cases: Vec<(Vec<KeyUsage>, bool)> = vec![
            (vec![], false),
            (
                vec![KeyUsage::KeyEncipherment, KeyUsage::DigitalSignature],
                false,
            ),
            (
                vec![
                    KeyUsage::KeyEncipherment,
                    KeyUsage::DigitalSignature,
                    KeyUsage::ServerAuth,
                ],
                false,
            ),
            (
                vec![
                    KeyUsage::KeyEncipherment,
                    KeyUsage::DigitalSignature,
                    KeyUsage::ClientAuth,
                ],
                true,
            ),
            // order independent
            (
                vec![
                    KeyUsage::ClientAuth,
                    KeyUsage::KeyEncipherment,
                    KeyUsage::DigitalSignature,
                ],
                true,
            ),
            // duplicates do not change the set
            (
                vec![
                    KeyUsage::ClientAuth,
                    KeyUsage::ClientAuth,
                    KeyUsage::KeyEncipherment,
                    KeyUsage::DigitalSignature,
                ],
                true,
            ),
            (
                vec![
                    KeyUsage::KeyEncipherment,
                    KeyUsage::DigitalSignature,
                    KeyUsage::ClientAuth,
                    KeyUsage::ServerAuth,
                ],
                false,
            ),
        ];
        for (usages, want) in cases {
            assert_eq!(
                has_exact_usages(&usages, &expected),
                want,
                "usages: {:?}",
                usages
            );
        }
    }

    #[test]
    fn terminal_on_condition_or_certificate() {
        let mut req = SigningRequest {
            name: "csr-1".into(),
            username: "system:node:foo".into(),
            groups: vec![],
            usages: vec![],
            request: vec![],
            status: RequestStatus::default(),
            resource_version: 0,
            created_at: Utc::now(),
        };
        assert!(!req.is_terminal());

        req.status.conditions.push(Condition {
            kind: ConditionKind::Approved,
            reason: "AutoApproved".into(),
            message: String::new(),
        });
        assert!(req.is_terminal());
        assert!(req.is_approved());

        req.status.conditions.clear();
        req.status.certificate = Some(b"cert".to_vec());
        assert!(req.is_terminal());
        assert!(!req.is_approved());
    }

    #[test]
    fn identity_prefix_extraction() {
        assert_eq!(
            node_name_from_common_name("system:node:worker-1").unwrap(),
            "worker-1"
        );
        assert!(node_name_from_common_name("worker-1").is_err());
        assert_eq!(
            instance_id_from_username("system:bootstrappers:id-1").unwrap(),
            "id-1"
        );
        assert!(instance_id_from_username("system:node:worker-1").is_err());
    }
}
