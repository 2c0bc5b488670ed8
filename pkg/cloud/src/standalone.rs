use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backoff::{Backoff, retry};
use crate::cache::{Clock, TimedCache, system_clock};
use crate::{CloudError, CloudProvider};

/// A virtual machine not managed by any scale set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualMachine {
    pub instance_id: String,
    /// Availability-set id, if the machine belongs to one.
    pub group_id: Option<String>,
}

/// Point lookup of a single virtual machine by node name.
/// `Ok(None)` means the machine does not exist.
#[async_trait]
pub trait VirtualMachineApi: Send + Sync {
    async fn get_virtual_machine(&self, name: &str) -> Result<Option<VirtualMachine>, CloudError>;
}

/// Resolver for standalone machines: per-node lookups served through a
/// short-TTL cache, with backoff retry around the upstream call.
pub struct StandaloneResolver {
    api: Arc<dyn VirtualMachineApi>,
    cache: TimedCache<VirtualMachine>,
    backoff: Backoff,
}

impl StandaloneResolver {
    pub fn new(api: Arc<dyn VirtualMachineApi>, cache_ttl: Duration, backoff: Backoff) -> Self {
        Self::with_clock(api, cache_ttl, backoff, system_clock())
    }

    pub fn with_clock(
        api: Arc<dyn VirtualMachineApi>,
        cache_ttl: Duration,
        backoff: Backoff,
        clock: Clock,
    ) -> Self {
        Self {
            api,
            cache: TimedCache::with_clock(cache_ttl, clock),
            backoff,
        }
    }

    async fn get(&self, node_name: &str) -> Result<VirtualMachine, CloudError> {
        let result = retry(&self.backoff, || async move {
            self.cache
                .get_or_create(node_name, || async move {
                    match self.api.get_virtual_machine(node_name).await? {
                        Some(vm) => Ok(vm),
                        None => Err(CloudError::InstanceNotFound(node_name.to_string())),
                    }
                })
                .await
        })
        .await;

        if let Err(CloudError::InstanceNotFound(_)) = &result {
            // drop any entry proven stale by the upstream miss
            self.cache.delete(node_name);
            debug!("machine {} not found upstream, cache evicted", node_name);
        }
        result
    }
}

#[async_trait]
impl CloudProvider for StandaloneResolver {
    async fn instance_id(&self, node_name: &str) -> Result<String, CloudError> {
        Ok(self.get(node_name).await?.instance_id)
    }

    async fn instance_group(&self, node_name: &str) -> Result<String, CloudError> {
        self.get(node_name)
            .await?
            .group_id
            .ok_or_else(|| CloudError::GroupNotFound(node_name.to_string()))
    }
}
