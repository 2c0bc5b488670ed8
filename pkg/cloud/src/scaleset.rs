use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backoff::{Backoff, retry};
use crate::cache::{Clock, system_clock};
use crate::standalone::StandaloneResolver;
use crate::{CloudError, CloudProvider};

/// A virtual machine inside a scale set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleSetVm {
    pub instance_id: String,
    pub node_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScaleSetPage {
    pub names: Vec<String>,
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemberPage {
    pub members: Vec<ScaleSetVm>,
    pub next_token: Option<String>,
}

/// Paginated scale-set listing endpoints. The concrete transport is an
/// external collaborator; the resolver owns pagination, retry and caching.
#[async_trait]
pub trait ScaleSetApi: Send + Sync {
    async fn list_scale_sets(&self, next_token: Option<&str>)
    -> Result<ScaleSetPage, CloudError>;
    async fn list_members(
        &self,
        scale_set: &str,
        next_token: Option<&str>,
    ) -> Result<MemberPage, CloudError>;
}

#[derive(Debug, Clone)]
struct Member {
    instance_id: String,
    node_name: String,
    group_name: String,
}

#[derive(Default)]
struct SnapshotState {
    /// Scale set name to its member machines; replaced wholesale on refresh.
    groups: HashMap<String, Vec<Member>>,
    /// Node names confirmed absent from every scale set, with the time of
    /// the confirming refresh.
    negative: HashMap<String, Instant>,
}

/// Resolver for scale-set managed machines. Holds a full snapshot of all
/// scale sets, refreshed periodically or synchronously on a miss; nodes
/// confirmed absent are remembered in a negative set so external machines do
/// not force repeated full refreshes. Misses fall through to a standalone
/// resolver before concluding the instance does not exist.
pub struct ScaleSetResolver {
    api: Arc<dyn ScaleSetApi>,
    fallback: StandaloneResolver,
    backoff: Backoff,
    /// None keeps negative entries for the lifetime of the process.
    negative_ttl: Option<Duration>,
    clock: Clock,
    state: Mutex<SnapshotState>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl ScaleSetResolver {
    pub fn new(
        api: Arc<dyn ScaleSetApi>,
        fallback: StandaloneResolver,
        backoff: Backoff,
        negative_ttl: Option<Duration>,
    ) -> Self {
        Self::with_clock(api, fallback, backoff, negative_ttl, system_clock())
    }

    pub fn with_clock(
        api: Arc<dyn ScaleSetApi>,
        fallback: StandaloneResolver,
        backoff: Backoff,
        negative_ttl: Option<Duration>,
        clock: Clock,
    ) -> Self {
        Self {
            api,
            fallback,
            backoff,
            negative_ttl,
            clock,
            state: Mutex::new(SnapshotState::default()),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Refresh the snapshot on a fixed interval, independent of lookups.
    pub fn spawn_periodic_refresh(
        self: &Arc<Self>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let resolver = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = resolver.refresh().await {
                    warn!("scale set snapshot refresh failed: {}", e);
                }
            }
        })
    }

    /// Rebuild the full snapshot and swap it in. The state mutex is held
    /// only to replace the snapshot, never across the network calls.
    pub async fn refresh(&self) -> Result<(), CloudError> {
        let _guard = self.refresh_lock.lock().await;

        let names = self.list_all_scale_sets().await?;
        let mut groups: HashMap<String, Vec<Member>> = HashMap::new();
        for name in names {
            let members = self.list_all_members(&name).await?;
            groups.insert(
                name.clone(),
                members
                    .into_iter()
                    .map(|vm| Member {
                        instance_id: vm.instance_id,
                        node_name: vm.node_name,
                        group_name: name.clone(),
                    })
                    .collect(),
            );
        }
        debug!("scale set snapshot refreshed: {} sets", groups.len());

        self.state.lock().unwrap().groups = groups;
        Ok(())
    }

    async fn list_all_scale_sets(&self) -> Result<Vec<String>, CloudError> {
        let mut names = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = retry(&self.backoff, || {
                let token = token.clone();
                async move { self.api.list_scale_sets(token.as_deref()).await }
            })
            .await?;
            names.extend(page.names);
            match page.next_token {
                Some(next) if !next.is_empty() => token = Some(next),
                _ => break,
            }
        }
        Ok(names)
    }

    async fn list_all_members(&self, scale_set: &str) -> Result<Vec<ScaleSetVm>, CloudError> {
        let mut members = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = retry(&self.backoff, || {
                let token = token.clone();
                async move { self.api.list_members(scale_set, token.as_deref()).await }
            })
            .await?;
            members.extend(page.members);
            match page.next_token {
                Some(next) if !next.is_empty() => token = Some(next),
                _ => break,
            }
        }
        Ok(members)
    }

    fn snapshot_lookup(&self, node_name: &str) -> Option<Member> {
        let state = self.state.lock().unwrap();
        state
            .groups
            .values()
            .flatten()
            .find(|m| m.node_name == node_name)
            .cloned()
    }

    fn is_negative(&self, node_name: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.negative.get(node_name) {
            None => false,
            Some(confirmed_at) => match self.negative_ttl {
                None => true,
                Some(ttl) if (self.clock)().duration_since(*confirmed_at) < ttl => true,
                Some(_) => {
                    state.negative.remove(node_name);
                    false
                }
            },
        }
    }

    /// Locate a node in the snapshot. `None` means the node is confirmed
    /// absent from every scale set (and is now in the negative set).
    async fn find(&self, node_name: &str) -> Result<Option<Member>, CloudError> {
        if let Some(member) = self.snapshot_lookup(node_name) {
            return Ok(Some(member));
        }
        if self.is_negative(node_name) {
            return Ok(None);
        }

        // Miss on a node we have not ruled out: refresh and try again.
        self.refresh().await?;
        if let Some(member) = self.snapshot_lookup(node_name) {
            return Ok(Some(member));
        }

        debug!(
            "node {} absent from all scale sets, adding to negative set",
            node_name
        );
        self.state
            .lock()
            .unwrap()
            .negative
            .insert(node_name.to_string(), (self.clock)());
        Ok(None)
    }
}

#[async_trait]
impl CloudProvider for ScaleSetResolver {
    async fn instance_id(&self, node_name: &str) -> Result<String, CloudError> {
        match self.find(node_name).await? {
            Some(member) => Ok(member.instance_id),
            // not managed by any scale set; try the standalone machines
            None => self.fallback.instance_id(node_name).await,
        }
    }

    async fn instance_group(&self, node_name: &str) -> Result<String, CloudError> {
        match self.find(node_name).await? {
            Some(member) => Ok(member.group_name),
            None => self.fallback.instance_group(node_name).await,
        }
    }
}
