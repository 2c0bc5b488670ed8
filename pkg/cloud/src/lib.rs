pub mod aws;
pub mod backoff;
pub mod cache;
pub mod config;
pub mod fake;
pub mod rest;
pub mod scaleset;
pub mod standalone;

use async_trait::async_trait;

/// Resolver failure kinds. Only `Transient` is eligible for backoff retry;
/// everything else must abort immediately.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CloudError {
    #[error("no instance found for node {0}")]
    InstanceNotFound(String),
    #[error("no instance group found for node {0}")]
    GroupNotFound(String),
    #[error("multiple matches found for node {0}")]
    Ambiguous(String),
    #[error("transient cloud API error: {0}")]
    Transient(String),
}

impl CloudError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CloudError::Transient(_))
    }
}

/// Maps a node name to its cloud instance identity and membership group.
/// A node name resolves to at most one instance and at most one group at
/// any cache generation.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    async fn instance_id(&self, node_name: &str) -> Result<String, CloudError>;
    async fn instance_group(&self, node_name: &str) -> Result<String, CloudError>;
}
