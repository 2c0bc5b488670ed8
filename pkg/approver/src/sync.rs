use std::sync::Arc;

use tracing::{debug, info};

use crate::client::{ClientError, RequestClient};
use crate::recognizer::{PolicyEngine, TransientEval};
use pkg_pki::parse::{ParseError, parse_and_verify};
use pkg_types::request::{Condition, ConditionKind};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The embedded request is malformed or its self-signature is bad;
    /// fatal for this request, not worth active retry.
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// Resolver hiccup; retry with backoff.
    #[error("{0}")]
    Transient(String),
    /// Cluster API failure, including stale-write conflicts; retry with a
    /// fresh read.
    #[error(transparent)]
    Client(#[from] ClientError),
}

impl SyncError {
    /// Whether the queue should re-enqueue the key with backoff. Malformed
    /// requests are surfaced but not retried; redelivery on the next event
    /// or resync re-checks them anyway.
    pub fn is_retriable(&self) -> bool {
        !matches!(self, SyncError::Parse(_))
    }
}

impl From<TransientEval> for SyncError {
    fn from(e: TransientEval) -> Self {
        SyncError::Transient(e.0)
    }
}

/// Idempotent per-request decision procedure: skip terminal requests, parse
/// and verify the embedded request, run the policy engine, and apply the
/// approval as the only externally visible effect.
pub struct SyncEngine {
    requests: Arc<dyn RequestClient>,
    policy: PolicyEngine,
}

impl SyncEngine {
    pub fn new(requests: Arc<dyn RequestClient>, policy: PolicyEngine) -> Self {
        Self { requests, policy }
    }

    pub async fn sync(&self, name: &str) -> Result<(), SyncError> {
        // the client hands out an owned copy; mutations below never touch
        // shared or cached state
        let Some(mut request) = self.requests.get(name).await? else {
            debug!("signing request {} deleted, nothing to do", name);
            return Ok(());
        };

        if request.is_terminal() {
            debug!("signing request {} already decided, skipping", name);
            return Ok(());
        }

        let parsed = parse_and_verify(&request.request)?;

        let Some(message) = self.policy.evaluate(&request, &parsed).await? else {
            debug!("no recognizer matched {}; leaving pending", name);
            return Ok(());
        };
        let message = message.to_string();

        request.status.conditions.push(Condition {
            kind: ConditionKind::Approved,
            reason: "AutoApproved".to_string(),
            message: message.clone(),
        });
        self.requests.update_approval(&request).await?;
        info!("approved signing request {}: {}", name, message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashSet;

    use crate::client::MemoryClient;
    use crate::recognizer::aws_recognizers;
    use pkg_cloud::fake::FakeCloud;
    use pkg_constants::identity::BOOTSTRAPPER_GROUP;
    use pkg_pki::csr::CsrOptions;
    use pkg_types::node::Node;
    use pkg_types::request::{
        KUBELET_CLIENT_USAGES, KeyUsage, RequestStatus, SigningRequest,
    };

    fn node_request(name: &str, cn: &str, requestor: &str, groups: &[&str]) -> SigningRequest {
        let generated = CsrOptions::new(cn, "system:nodes").generate().unwrap();
        SigningRequest {
            name: name.to_string(),
            username: requestor.to_string(),
            groups: groups.iter().map(|g| g.to_string()).collect(),
            usages: KUBELET_CLIENT_USAGES.to_vec(),
            request: generated.csr_der,
            status: RequestStatus::default(),
            resource_version: 0,
            created_at: Utc::now(),
        }
    }

    fn harness(cloud: FakeCloud) -> (SyncEngine, Arc<MemoryClient>, Arc<FakeCloud>) {
        let client = Arc::new(MemoryClient::new());
        let cloud = Arc::new(cloud);
        let policy = PolicyEngine::new(
            aws_recognizers(HashSet::from(["allowed-asg".to_string()])),
            cloud.clone(),
            client.clone(),
        );
        (SyncEngine::new(client.clone(), policy), client, cloud)
    }

    #[tokio::test]
    async fn terminal_request_short_circuits_without_external_calls() {
        let cloud = FakeCloud::new();
        let (engine, client, cloud) = harness(cloud);

        let mut request = node_request(
            "csr-1",
            "system:node:worker-1",
            "system:node:worker-1",
            &["system:nodes"],
        );
        request.status.certificate = Some(b"already signed".to_vec());
        client.put_request(request);

        engine.sync("csr-1").await.unwrap();
        assert_eq!(client.update_calls(), 0);
        assert_eq!(client.node_get_calls(), 0);
        assert_eq!(cloud.instance_id_calls(), 0);
        assert_eq!(cloud.instance_group_calls(), 0);
    }

    #[tokio::test]
    async fn deleted_request_is_a_no_op() {
        let (engine, _, _) = harness(FakeCloud::new());
        engine.sync("gone").await.unwrap();
    }

    #[tokio::test]
    async fn malformed_request_is_fatal_not_retriable() {
        let (engine, client, _) = harness(FakeCloud::new());
        let mut request = node_request(
            "csr-1",
            "system:node:worker-1",
            "system:node:worker-1",
            &["system:nodes"],
        );
        request.request = b"garbage".to_vec();
        client.put_request(request);

        let err = engine.sync("csr-1").await.unwrap_err();
        assert!(matches!(err, SyncError::Parse(_)));
        assert!(!err.is_retriable());
    }

    // End-to-end scenario: ready cluster member presenting its own client
    // cert, instance and group known to the cloud.
    #[tokio::test]
    async fn ready_member_self_request_is_approved_via_self_chain() {
        let cloud = FakeCloud::new()
            .with_instance("worker-1", "i-1")
            .with_group("worker-1", "allowed-asg");
        let (engine, client, _) = harness(cloud);
        client.put_node(Node::new("worker-1", true));
        client.put_request(node_request(
            "csr-1",
            "system:node:worker-1",
            "system:node:worker-1",
            &["system:nodes"],
        ));

        engine.sync("csr-1").await.unwrap();

        let stored = client.request("csr-1").unwrap();
        assert!(stored.is_approved());
        assert_eq!(stored.status.conditions.len(), 1);
        assert_eq!(stored.status.conditions[0].reason, "AutoApproved");
        assert!(stored.status.conditions[0].message.contains("self node"));
    }

    // Same request, but the node is not ready: nothing matches and nothing
    // is written.
    #[tokio::test]
    async fn unready_member_stays_pending() {
        let cloud = FakeCloud::new()
            .with_instance("worker-1", "i-1")
            .with_group("worker-1", "allowed-asg");
        let (engine, client, _) = harness(cloud);
        client.put_node(Node::new("worker-1", false));
        client.put_request(node_request(
            "csr-1",
            "system:node:worker-1",
            "system:node:worker-1",
            &["system:nodes"],
        ));

        engine.sync("csr-1").await.unwrap();

        let stored = client.request("csr-1").unwrap();
        assert!(!stored.is_terminal());
        assert_eq!(client.update_calls(), 0);
    }

    // Bootstrapping node whose claimed instance id matches the resolver and
    // whose group is allow-listed.
    #[tokio::test]
    async fn new_node_request_is_approved_via_new_node_chain() {
        let cloud = FakeCloud::new()
            .with_instance("valid-node", "id-1")
            .with_group("valid-node", "allowed-asg");
        let (engine, client, _) = harness(cloud);
        client.put_request(node_request(
            "csr-1",
            "system:node:valid-node",
            "system:bootstrappers:id-1",
            &[BOOTSTRAPPER_GROUP],
        ));

        engine.sync("csr-1").await.unwrap();

        let stored = client.request("csr-1").unwrap();
        assert!(stored.is_approved());
        assert!(stored.status.conditions[0].message.contains("new node"));
    }

    // Same as above but the resolver disagrees about the instance id.
    #[tokio::test]
    async fn instance_id_mismatch_stays_pending() {
        let cloud = FakeCloud::new()
            .with_instance("valid-node", "id-2")
            .with_group("valid-node", "allowed-asg");
        let (engine, client, _) = harness(cloud);
        client.put_request(node_request(
            "csr-1",
            "system:node:valid-node",
            "system:bootstrappers:id-1",
            &[BOOTSTRAPPER_GROUP],
        ));

        engine.sync("csr-1").await.unwrap();

        let stored = client.request("csr-1").unwrap();
        assert!(!stored.is_terminal());
        assert_eq!(client.update_calls(), 0);
    }

    #[tokio::test]
    async fn transient_resolver_failure_is_retriable() {
        let (engine, client, _) = harness(FakeCloud::new().with_transient_failure());
        client.put_node(Node::new("worker-1", true));
        client.put_request(node_request(
            "csr-1",
            "system:node:worker-1",
            "system:node:worker-1",
            &["system:nodes"],
        ));

        let err = engine.sync("csr-1").await.unwrap_err();
        assert!(matches!(err, SyncError::Transient(_)));
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn reconciling_an_approved_request_again_is_idempotent() {
        let cloud = FakeCloud::new()
            .with_instance("worker-1", "i-1")
            .with_group("worker-1", "allowed-asg");
        let (engine, client, _) = harness(cloud);
        client.put_node(Node::new("worker-1", true));
        client.put_request(node_request(
            "csr-1",
            "system:node:worker-1",
            "system:node:worker-1",
            &["system:nodes"],
        ));

        engine.sync("csr-1").await.unwrap();
        engine.sync("csr-1").await.unwrap();

        let stored = client.request("csr-1").unwrap();
        assert_eq!(stored.status.conditions.len(), 1);
        assert_eq!(client.update_calls(), 1);
    }
}
