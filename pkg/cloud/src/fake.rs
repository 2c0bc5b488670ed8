use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::{CloudError, CloudProvider};

/// Table-driven provider for tests and local wiring. Records how many
/// lookups of each kind were made so callers can assert on evaluation order.
#[derive(Default)]
pub struct FakeCloud {
    instances: HashMap<String, String>,
    groups: HashMap<String, String>,
    transient: bool,
    id_calls: AtomicUsize,
    group_calls: AtomicUsize,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a node name to its instance id.
    pub fn with_instance(mut self, node_name: &str, instance_id: &str) -> Self {
        self.instances
            .insert(node_name.to_string(), instance_id.to_string());
        self
    }

    /// Map a node name to its instance group.
    pub fn with_group(mut self, node_name: &str, group: &str) -> Self {
        self.groups.insert(node_name.to_string(), group.to_string());
        self
    }

    /// Make every lookup fail with a transient error.
    pub fn with_transient_failure(mut self) -> Self {
        self.transient = true;
        self
    }

    pub fn instance_id_calls(&self) -> usize {
        self.id_calls.load(Ordering::SeqCst)
    }

    pub fn instance_group_calls(&self) -> usize {
        self.group_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CloudProvider for FakeCloud {
    async fn instance_id(&self, node_name: &str) -> Result<String, CloudError> {
        self.id_calls.fetch_add(1, Ordering::SeqCst);
        if self.transient {
            return Err(CloudError::Transient("fake outage".to_string()));
        }
        self.instances
            .get(node_name)
            .cloned()
            .ok_or_else(|| CloudError::InstanceNotFound(node_name.to_string()))
    }

    async fn instance_group(&self, node_name: &str) -> Result<String, CloudError> {
        self.group_calls.fetch_add(1, Ordering::SeqCst);
        if self.transient {
            return Err(CloudError::Transient("fake outage".to_string()));
        }
        self.groups
            .get(node_name)
            .cloned()
            .ok_or_else(|| CloudError::GroupNotFound(node_name.to_string()))
    }
}
