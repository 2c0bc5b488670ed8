use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use reqwest::StatusCode;

use pkg_types::node::Node;
use pkg_types::request::SigningRequest;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Status update rejected because the stored resource changed since it
    /// was read; retry with a fresh read.
    #[error("stale write conflict for {0}")]
    StaleWrite(String),
    #[error("cluster API error: {0}")]
    Api(String),
}

/// Access to stored signing requests. `update_approval` has
/// compare-and-swap semantics: implementations must reject writes whose
/// `resource_version` is stale.
#[async_trait]
pub trait RequestClient: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<SigningRequest>, ClientError>;
    async fn list_names(&self) -> Result<Vec<String>, ClientError>;
    async fn update_approval(&self, request: &SigningRequest) -> Result<(), ClientError>;
}

/// Cluster membership lookup used by the node identity predicates.
#[async_trait]
pub trait NodeClient: Send + Sync {
    async fn get_node(&self, name: &str) -> Result<Option<Node>, ClientError>;
    async fn list_nodes(&self) -> Result<Vec<Node>, ClientError>;
}

// --- In-memory implementation ---

/// In-memory cluster state for tests and local wiring. Counts API calls so
/// tests can assert the skip-fast invariant.
#[derive(Default)]
pub struct MemoryClient {
    requests: Mutex<HashMap<String, SigningRequest>>,
    nodes: Mutex<HashMap<String, Node>>,
    get_calls: AtomicUsize,
    update_calls: AtomicUsize,
    node_get_calls: AtomicUsize,
}

impl MemoryClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_request(&self, request: SigningRequest) {
        self.requests
            .lock()
            .unwrap()
            .insert(request.name.clone(), request);
    }

    pub fn put_node(&self, node: Node) {
        self.nodes.lock().unwrap().insert(node.name.clone(), node);
    }

    pub fn request(&self, name: &str) -> Option<SigningRequest> {
        self.requests.lock().unwrap().get(name).cloned()
    }

    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    pub fn node_get_calls(&self) -> usize {
        self.node_get_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RequestClient for MemoryClient {
    async fn get(&self, name: &str) -> Result<Option<SigningRequest>, ClientError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.requests.lock().unwrap().get(name).cloned())
    }

    async fn list_names(&self) -> Result<Vec<String>, ClientError> {
        Ok(self.requests.lock().unwrap().keys().cloned().collect())
    }

    async fn update_approval(&self, request: &SigningRequest) -> Result<(), ClientError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let mut requests = self.requests.lock().unwrap();
        let stored = requests
            .get(&request.name)
            .ok_or_else(|| ClientError::Api(format!("no such request {}", request.name)))?;
        if stored.resource_version != request.resource_version {
            return Err(ClientError::StaleWrite(request.name.clone()));
        }
        let mut updated = request.clone();
        updated.resource_version += 1;
        requests.insert(updated.name.clone(), updated);
        Ok(())
    }
}

#[async_trait]
impl NodeClient for MemoryClient {
    async fn get_node(&self, name: &str) -> Result<Option<Node>, ClientError> {
        self.node_get_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.nodes.lock().unwrap().get(name).cloned())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, ClientError> {
        Ok(self.nodes.lock().unwrap().values().cloned().collect())
    }
}

// --- HTTP implementation ---

/// Thin reqwest client for a cluster API exposing signing requests and
/// nodes as JSON resources.
pub struct HttpClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl RequestClient for HttpClient {
    async fn get(&self, name: &str) -> Result<Option<SigningRequest>, ClientError> {
        let response = self
            .http
            .get(self.url(&format!("/certificatesigningrequests/{}", name)))
            .send()
            .await
            .map_err(|e| ClientError::Api(e.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let request = response
            .error_for_status()
            .map_err(|e| ClientError::Api(e.to_string()))?
            .json::<SigningRequest>()
            .await
            .map_err(|e| ClientError::Api(e.to_string()))?;
        Ok(Some(request))
    }

    async fn list_names(&self) -> Result<Vec<String>, ClientError> {
        let requests = self
            .http
            .get(self.url("/certificatesigningrequests"))
            .send()
            .await
            .map_err(|e| ClientError::Api(e.to_string()))?
            .error_for_status()
            .map_err(|e| ClientError::Api(e.to_string()))?
            .json::<Vec<SigningRequest>>()
            .await
            .map_err(|e| ClientError::Api(e.to_string()))?;
        Ok(requests.into_iter().map(|r| r.name).collect())
    }

    async fn update_approval(&self, request: &SigningRequest) -> Result<(), ClientError> {
        let response = self
            .http
            .put(self.url(&format!(
                "/certificatesigningrequests/{}/approval",
                request.name
            )))
            .json(request)
            .send()
            .await
            .map_err(|e| ClientError::Api(e.to_string()))?;
        if response.status() == StatusCode::CONFLICT {
            return Err(ClientError::StaleWrite(request.name.clone()));
        }
        response
            .error_for_status()
            .map_err(|e| ClientError::Api(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl NodeClient for HttpClient {
    async fn get_node(&self, name: &str) -> Result<Option<Node>, ClientError> {
        let response = self
            .http
            .get(self.url(&format!("/nodes/{}", name)))
            .send()
            .await
            .map_err(|e| ClientError::Api(e.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let node = response
            .error_for_status()
            .map_err(|e| ClientError::Api(e.to_string()))?
            .json::<Node>()
            .await
            .map_err(|e| ClientError::Api(e.to_string()))?;
        Ok(Some(node))
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, ClientError> {
        self.http
            .get(self.url("/nodes"))
            .send()
            .await
            .map_err(|e| ClientError::Api(e.to_string()))?
            .error_for_status()
            .map_err(|e| ClientError::Api(e.to_string()))?
            .json::<Vec<Node>>()
            .await
            .map_err(|e| ClientError::Api(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pkg_types::request::RequestStatus;

    fn request(name: &str, version: u64) -> SigningRequest {
        SigningRequest {
            name: name.to_string(),
            username: "system:node:foo".into(),
            groups: vec![],
            usages: vec![],
            request: vec![],
            status: RequestStatus::default(),
            resource_version: version,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn memory_client_rejects_stale_writes() {
        let client = MemoryClient::new();
        client.put_request(request("csr-1", 0));

        let fresh = client.get("csr-1").await.unwrap().unwrap();
        client.update_approval(&fresh).await.unwrap();

        // a write based on the old read must be rejected
        let err = client.update_approval(&fresh).await.unwrap_err();
        assert!(matches!(err, ClientError::StaleWrite(_)));

        // and succeed again after a fresh read
        let reread = client.get("csr-1").await.unwrap().unwrap();
        assert_eq!(reread.resource_version, 1);
        client.update_approval(&reread).await.unwrap();
    }
}
