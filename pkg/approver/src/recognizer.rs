use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use crate::client::NodeClient;
use pkg_cloud::{CloudError, CloudProvider};
use pkg_constants::identity::{
    BOOTSTRAPPER_GROUP, MASTER_ROLE_GROUP, NODE_NAME_PREFIX, NODE_ORG, WORKER_ROLE_GROUP,
};
use pkg_pki::parse::ParsedCertificateRequest;
use pkg_types::request::{
    KUBELET_CLIENT_USAGES, SigningRequest, has_exact_usages, instance_id_from_username,
    node_name_from_common_name,
};

/// A single policy check against a parsed signing request. Pure except for
/// the variants that consult the cloud resolver or the membership lookup.
#[derive(Debug, Clone)]
pub enum Predicate {
    /// Organization is exactly the node org, no SANs, exact kubelet client
    /// usages, common name carries the node prefix.
    NodeClientCert,
    /// `NodeClientCert` and the requester username equals the common name:
    /// the node vouches for itself with its own prior credential.
    SelfNodeClientCert,
    /// Requester carries the given authentication group.
    HasGroup(String),
    /// Requester is a registered, ready cluster member backed by a real
    /// cloud instance.
    ValidNode,
    /// Requester is a bootstrapper whose claimed instance id matches the
    /// resolved one, for a node not yet in the cluster.
    ValidNewNode,
    /// The node's resolved instance group is on the allow-list.
    InAllowedGroup(Arc<HashSet<String>>),
}

/// An ordered chain of predicates authorizing automatic approval under a
/// named policy.
#[derive(Debug, Clone)]
pub struct Recognizer {
    pub predicates: Vec<Predicate>,
    pub success_message: String,
}

/// A transient resolver failure aborts the whole evaluation; the request is
/// retried with backoff instead of being judged on partial information.
#[derive(Debug, thiserror::Error)]
#[error("transient resolver failure: {0}")]
pub struct TransientEval(pub String);

/// Evaluates recognizer chains in declared order. The first chain whose
/// every predicate passes wins; a chain is abandoned at its first failing
/// predicate. Evaluation itself has no side effects.
pub struct PolicyEngine {
    recognizers: Vec<Recognizer>,
    cloud: Arc<dyn CloudProvider>,
    nodes: Arc<dyn NodeClient>,
}

impl PolicyEngine {
    pub fn new(
        recognizers: Vec<Recognizer>,
        cloud: Arc<dyn CloudProvider>,
        nodes: Arc<dyn NodeClient>,
    ) -> Self {
        Self {
            recognizers,
            cloud,
            nodes,
        }
    }

    /// Returns the success message of the first fully matched chain, or
    /// `None` when no chain matched (the request stays pending; denial is
    /// never automatic).
    pub async fn evaluate(
        &self,
        request: &SigningRequest,
        parsed: &ParsedCertificateRequest,
    ) -> Result<Option<&str>, TransientEval> {
        for recognizer in &self.recognizers {
            let mut matched = true;
            for predicate in &recognizer.predicates {
                if !self.check(predicate, request, parsed).await? {
                    debug!(
                        "request {}: predicate {:?} failed, skipping chain",
                        request.name, predicate
                    );
                    matched = false;
                    break;
                }
            }
            if matched {
                return Ok(Some(&recognizer.success_message));
            }
        }
        Ok(None)
    }

    async fn check(
        &self,
        predicate: &Predicate,
        request: &SigningRequest,
        parsed: &ParsedCertificateRequest,
    ) -> Result<bool, TransientEval> {
        match predicate {
            Predicate::NodeClientCert => Ok(is_node_client_cert(request, parsed)),
            Predicate::SelfNodeClientCert => {
                Ok(is_node_client_cert(request, parsed) && request.username == parsed.common_name)
            }
            Predicate::HasGroup(group) => Ok(request.groups.iter().any(|g| g == group)),
            Predicate::ValidNode => self.is_valid_node(request, parsed).await,
            Predicate::ValidNewNode => self.is_valid_new_node(request, parsed).await,
            Predicate::InAllowedGroup(allowed) => {
                let Ok(node_name) = node_name_from_common_name(&parsed.common_name) else {
                    return Ok(false);
                };
                match self.cloud.instance_group(node_name).await {
                    Ok(group) => Ok(allowed.contains(&group)),
                    Err(e) => transient_or_false(e),
                }
            }
        }
    }

    async fn is_valid_node(
        &self,
        request: &SigningRequest,
        parsed: &ParsedCertificateRequest,
    ) -> Result<bool, TransientEval> {
        if !request.groups.iter().any(|g| g == NODE_ORG) {
            return Ok(false);
        }
        let Ok(node_name) = node_name_from_common_name(&parsed.common_name) else {
            return Ok(false);
        };
        if let Err(e) = self.cloud.instance_id(node_name).await {
            return transient_or_false(e);
        }
        match self.nodes.get_node(node_name).await {
            Ok(Some(node)) => Ok(node.ready),
            // not registered, not ready, or membership lookup failed
            _ => Ok(false),
        }
    }

    async fn is_valid_new_node(
        &self,
        request: &SigningRequest,
        parsed: &ParsedCertificateRequest,
    ) -> Result<bool, TransientEval> {
        if !request.groups.iter().any(|g| g == BOOTSTRAPPER_GROUP) {
            return Ok(false);
        }
        let Ok(claimed_id) = instance_id_from_username(&request.username) else {
            return Ok(false);
        };
        let Ok(node_name) = node_name_from_common_name(&parsed.common_name) else {
            return Ok(false);
        };
        let resolved_id = match self.cloud.instance_id(node_name).await {
            Ok(id) => id,
            Err(e) => return transient_or_false(e),
        };
        if resolved_id != claimed_id {
            debug!(
                "request {}: claimed instance id {} does not match resolved {}",
                request.name, claimed_id, resolved_id
            );
            return Ok(false);
        }
        // the node must not already be a cluster member
        match self.nodes.get_node(node_name).await {
            Ok(None) => Ok(true),
            _ => Ok(false),
        }
    }
}

fn transient_or_false(err: CloudError) -> Result<bool, TransientEval> {
    if err.is_transient() {
        Err(TransientEval(err.to_string()))
    } else {
        // NotFound and Ambiguous are policy failures, not system faults
        Ok(false)
    }
}

fn is_node_client_cert(request: &SigningRequest, parsed: &ParsedCertificateRequest) -> bool {
    if parsed.organizations != [NODE_ORG] {
        return false;
    }
    if !parsed.has_no_sans() {
        return false;
    }
    if !has_exact_usages(&request.usages, &KUBELET_CLIENT_USAGES) {
        return false;
    }
    parsed.common_name.starts_with(NODE_NAME_PREFIX)
}

/// Chains for the elastic-scaling-group approver: a known node presenting
/// its own client cert, then a bootstrapping node joining for the first
/// time. Both require membership in an allowed group.
pub fn aws_recognizers(allowed_groups: HashSet<String>) -> Vec<Recognizer> {
    let allowed = Arc::new(allowed_groups);
    vec![
        Recognizer {
            predicates: vec![
                Predicate::SelfNodeClientCert,
                Predicate::ValidNode,
                Predicate::InAllowedGroup(allowed.clone()),
            ],
            success_message: "csrd-aws-approver approved self node client cert".to_string(),
        },
        Recognizer {
            predicates: vec![
                Predicate::NodeClientCert,
                Predicate::ValidNewNode,
                Predicate::InAllowedGroup(allowed),
            ],
            success_message: "csrd-aws-approver approved new node client cert".to_string(),
        },
    ]
}

/// Chains for the role-based node approver: self and bootstrap requests for
/// master and worker roles, gated on the role's instance groups.
pub fn node_role_recognizers(
    master_groups: HashSet<String>,
    worker_groups: HashSet<String>,
) -> Vec<Recognizer> {
    let masters = Arc::new(master_groups);
    let workers = Arc::new(worker_groups);
    vec![
        Recognizer {
            predicates: vec![
                Predicate::SelfNodeClientCert,
                Predicate::HasGroup(MASTER_ROLE_GROUP.to_string()),
                Predicate::InAllowedGroup(masters.clone()),
            ],
            success_message: "csrd-node-approver auto approved self client cert for master"
                .to_string(),
        },
        Recognizer {
            predicates: vec![
                Predicate::SelfNodeClientCert,
                Predicate::HasGroup(WORKER_ROLE_GROUP.to_string()),
                Predicate::InAllowedGroup(workers.clone()),
            ],
            success_message: "csrd-node-approver auto approved self client cert for worker"
                .to_string(),
        },
        Recognizer {
            predicates: vec![
                Predicate::NodeClientCert,
                Predicate::HasGroup(MASTER_ROLE_GROUP.to_string()),
                Predicate::InAllowedGroup(masters),
            ],
            success_message: "csrd-node-approver auto approved client cert for master".to_string(),
        },
        Recognizer {
            predicates: vec![
                Predicate::NodeClientCert,
                Predicate::HasGroup(WORKER_ROLE_GROUP.to_string()),
                Predicate::InAllowedGroup(workers),
            ],
            success_message: "csrd-node-approver auto approved client cert for worker".to_string(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pkg_cloud::fake::FakeCloud;
    use pkg_pki::csr::CsrOptions;
    use pkg_pki::parse::parse_and_verify;
    use pkg_types::node::Node;
    use pkg_types::request::{KeyUsage, RequestStatus};

    use crate::client::MemoryClient;

    pub(crate) struct RequestBuilder {
        pub cn: String,
        pub orgs: Vec<String>,
        pub requestor: String,
        pub groups: Vec<String>,
        pub usages: Vec<KeyUsage>,
        pub dns: Vec<String>,
    }

    impl Default for RequestBuilder {
        fn default() -> Self {
            Self {
                cn: "system:node:foo".into(),
                orgs: vec!["system:nodes".into()],
                requestor: "system:node:foo".into(),
                groups: vec!["system:nodes".into()],
                usages: KUBELET_CLIENT_USAGES.to_vec(),
                dns: vec![],
            }
        }
    }

    impl RequestBuilder {
        pub fn build(&self) -> (SigningRequest, ParsedCertificateRequest) {
            let org = self.orgs.first().cloned().unwrap_or_default();
            let generated = CsrOptions::new(&self.cn, &org)
                .with_dns_names(self.dns.clone())
                .generate()
                .unwrap();
            let request = SigningRequest {
                name: "test-csr".into(),
                username: self.requestor.clone(),
                groups: self.groups.clone(),
                usages: self.usages.clone(),
                request: generated.csr_der.clone(),
                status: RequestStatus::default(),
                resource_version: 0,
                created_at: Utc::now(),
            };
            let parsed = parse_and_verify(&generated.csr_der).unwrap();
            (request, parsed)
        }
    }

    fn engine(
        recognizers: Vec<Recognizer>,
        cloud: FakeCloud,
        nodes: MemoryClient,
    ) -> (PolicyEngine, Arc<FakeCloud>, Arc<MemoryClient>) {
        let cloud = Arc::new(cloud);
        let nodes = Arc::new(nodes);
        (
            PolicyEngine::new(recognizers, cloud.clone(), nodes.clone()),
            cloud,
            nodes,
        )
    }

    #[tokio::test]
    async fn node_client_cert_shape_checks() {
        let cases: Vec<(fn(&mut RequestBuilder), bool)> = vec![
            (|_| {}, true),
            (|b| b.orgs = vec!["system:master".into()], false),
            (|b| b.dns = vec!["test-dns".into()], false),
            (|b| b.cn = "test".into(), false),
            (|b| b.usages.push(KeyUsage::ServerAuth), false),
            (
                |b| b.usages = vec![KeyUsage::KeyEncipherment, KeyUsage::DigitalSignature],
                false,
            ),
        ];
        for (mutate, want) in cases {
            let mut builder = RequestBuilder::default();
            mutate(&mut builder);
            let (request, parsed) = builder.build();
            assert_eq!(
                is_node_client_cert(&request, &parsed),
                want,
                "cn={} orgs={:?} dns={:?} usages={:?}",
                builder.cn,
                builder.orgs,
                builder.dns,
                builder.usages
            );
        }
    }

    #[tokio::test]
    async fn self_cert_requires_matching_username() {
        let (request, parsed) = RequestBuilder {
            requestor: "system:random-user".into(),
            ..Default::default()
        }
        .build();
        let (engine, _, _) = engine(vec![], FakeCloud::new(), MemoryClient::new());
        assert!(
            !engine
                .check(&Predicate::SelfNodeClientCert, &request, &parsed)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn first_matching_chain_wins_in_declared_order() {
        // only the second chain can match: the first requires a group the
        // requester does not carry
        let recognizers = vec![
            Recognizer {
                predicates: vec![
                    Predicate::HasGroup("absent:group".into()),
                    Predicate::InAllowedGroup(Arc::new(HashSet::from(["asg-1".to_string()]))),
                ],
                success_message: "first".into(),
            },
            Recognizer {
                predicates: vec![Predicate::NodeClientCert],
                success_message: "second".into(),
            },
        ];
        let cloud = FakeCloud::new().with_group("foo", "asg-1");
        let (engine, cloud, _) = engine(recognizers, cloud, MemoryClient::new());

        let (request, parsed) = RequestBuilder::default().build();
        let matched = engine.evaluate(&request, &parsed).await.unwrap();
        assert_eq!(matched, Some("second"));
        // the first chain short-circuited before its resolver predicate
        assert_eq!(cloud.instance_group_calls(), 0);
    }

    #[tokio::test]
    async fn transient_resolver_failure_aborts_evaluation() {
        let recognizers = aws_recognizers(HashSet::from(["asg-1".to_string()]));
        let nodes = MemoryClient::new();
        nodes.put_node(Node::new("foo", true));
        let (engine, _, _) = engine(
            recognizers,
            FakeCloud::new().with_transient_failure(),
            nodes,
        );

        let (request, parsed) = RequestBuilder::default().build();
        assert!(engine.evaluate(&request, &parsed).await.is_err());
    }

    #[tokio::test]
    async fn resolver_not_found_is_policy_failure_not_error() {
        let recognizers = aws_recognizers(HashSet::from(["asg-1".to_string()]));
        let nodes = MemoryClient::new();
        nodes.put_node(Node::new("foo", true));
        let (engine, _, _) = engine(recognizers, FakeCloud::new(), nodes);

        let (request, parsed) = RequestBuilder::default().build();
        let matched = engine.evaluate(&request, &parsed).await.unwrap();
        assert_eq!(matched, None);
    }

    #[tokio::test]
    async fn new_node_instance_id_must_match_claim() {
        let nodes = MemoryClient::new();
        let cloud = FakeCloud::new().with_instance("valid-node", "id-2");
        let (engine, _, _) = engine(vec![], cloud, nodes);

        let (request, parsed) = RequestBuilder {
            cn: "system:node:valid-node".into(),
            requestor: "system:bootstrappers:id-1".into(),
            groups: vec![BOOTSTRAPPER_GROUP.into()],
            ..Default::default()
        }
        .build();
        assert!(
            !engine
                .check(&Predicate::ValidNewNode, &request, &parsed)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn new_node_must_not_be_registered() {
        let nodes = MemoryClient::new();
        nodes.put_node(Node::new("valid-node", true));
        let cloud = FakeCloud::new().with_instance("valid-node", "id-1");
        let (engine, _, _) = engine(vec![], cloud, nodes);

        let (request, parsed) = RequestBuilder {
            cn: "system:node:valid-node".into(),
            requestor: "system:bootstrappers:id-1".into(),
            groups: vec![BOOTSTRAPPER_GROUP.into()],
            ..Default::default()
        }
        .build();
        assert!(
            !engine
                .check(&Predicate::ValidNewNode, &request, &parsed)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn existing_node_must_be_ready() {
        let nodes = MemoryClient::new();
        nodes.put_node(Node::new("foo", false));
        let cloud = FakeCloud::new().with_instance("foo", "id-1");
        let (engine, _, _) = engine(vec![], cloud, nodes);

        let (request, parsed) = RequestBuilder::default().build();
        assert!(
            !engine
                .check(&Predicate::ValidNode, &request, &parsed)
                .await
                .unwrap()
        );
    }
}
