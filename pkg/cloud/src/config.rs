use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::backoff::Backoff;
use pkg_constants::cloud::{
    BACKOFF_BASE_SECS, BACKOFF_FACTOR, BACKOFF_JITTER, BACKOFF_STEPS, SNAPSHOT_REFRESH_SECS,
    VM_CACHE_TTL_SECS,
};

/// How a backend's machines are organized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VmKind {
    /// Machines managed individually (availability sets).
    #[default]
    Standard,
    /// Machines managed by scale sets, with a standalone fall-through.
    ScaleSet,
}

/// Cloud resolver configuration, loaded from a YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CloudConfig {
    pub resource_group: String,
    pub region: String,
    pub vm_kind: VmKind,

    pub backoff_retries: u32,
    pub backoff_exponent: f64,
    pub backoff_duration_secs: u64,
    pub backoff_jitter: f64,

    /// TTL for cached standalone machine lookups, in seconds.
    pub vm_cache_ttl_secs: u64,
    /// Interval between full scale-set snapshot refreshes, in seconds.
    pub snapshot_refresh_secs: u64,
    /// When set, nodes confirmed absent from all scale sets are re-checked
    /// after this many seconds. Unset keeps them negative until restart.
    pub negative_cache_ttl_secs: Option<u64>,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            resource_group: String::new(),
            region: String::new(),
            vm_kind: VmKind::default(),
            backoff_retries: BACKOFF_STEPS,
            backoff_exponent: BACKOFF_FACTOR,
            backoff_duration_secs: BACKOFF_BASE_SECS,
            backoff_jitter: BACKOFF_JITTER,
            vm_cache_ttl_secs: VM_CACHE_TTL_SECS,
            snapshot_refresh_secs: SNAPSHOT_REFRESH_SECS,
            negative_cache_ttl_secs: None,
        }
    }
}

impl CloudConfig {
    /// Load from a YAML file; missing fields take the defaults.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("error reading cloud config {:?}: {}", path, e))?;
        let config: CloudConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            steps: self.backoff_retries.max(1),
            base: Duration::from_secs(self.backoff_duration_secs),
            factor: self.backoff_exponent,
            jitter: self.backoff_jitter,
        }
    }

    pub fn vm_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.vm_cache_ttl_secs)
    }

    pub fn snapshot_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_refresh_secs)
    }

    pub fn negative_cache_ttl(&self) -> Option<Duration> {
        self.negative_cache_ttl_secs.map(Duration::from_secs)
    }
}
