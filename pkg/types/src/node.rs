use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Cluster membership record for a registered node, as reported by the
/// cluster API. The approval policy only cares about existence and
/// readiness; everything else stays with the cluster API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    /// Externally reported readiness condition.
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub registered_at: DateTime<Utc>,
}

impl Node {
    pub fn new(name: &str, ready: bool) -> Self {
        Self {
            name: name.to_string(),
            ready,
            labels: HashMap::new(),
            registered_at: Utc::now(),
        }
    }
}
