use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::CloudError;

/// Injected clock so TTL expiry is deterministic under test.
pub type Clock = Arc<dyn Fn() -> Instant + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Instant::now)
}

struct Entry<V> {
    value: V,
    created_at: Instant,
}

/// Keyed cache with absolute TTL and single-flight population.
///
/// A miss invokes the factory exactly once even under concurrent callers:
/// optimistic lookup without the creation lock, then take the lock, re-check,
/// and only then populate. Expired entries are treated as absent on the next
/// lookup; there is no background sweeper.
pub struct TimedCache<V> {
    ttl: Duration,
    clock: Clock,
    entries: Mutex<HashMap<String, Entry<V>>>,
    create_lock: tokio::sync::Mutex<()>,
}

impl<V: Clone> TimedCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, system_clock())
    }

    pub fn with_clock(ttl: Duration, clock: Clock) -> Self {
        Self {
            ttl,
            clock,
            entries: Mutex::new(HashMap::new()),
            create_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Return the cached value for `key`, or invoke `factory` to create it.
    /// A factory error leaves the cache unpopulated.
    pub async fn get_or_create<F, Fut>(&self, key: &str, factory: F) -> Result<V, CloudError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, CloudError>>,
    {
        if let Some(value) = self.lookup(key) {
            return Ok(value);
        }

        let _guard = self.create_lock.lock().await;
        if let Some(value) = self.lookup(key) {
            return Ok(value);
        }

        let value = factory().await?;
        self.entries.lock().unwrap().insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                created_at: (self.clock)(),
            },
        );
        Ok(value)
    }

    /// Evict an entry proven stale by a downstream error.
    pub fn delete(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }

    fn lookup(&self, key: &str) -> Option<V> {
        let entries = self.entries.lock().unwrap();
        let entry = entries.get(key)?;
        if (self.clock)().duration_since(entry.created_at) >= self.ttl {
            return None;
        }
        Some(entry.value.clone())
    }
}
