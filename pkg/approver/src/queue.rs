use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tracing::debug;

use pkg_constants::approver::{
    QUEUE_BASE_DELAY_MS, QUEUE_MAX_DELAY_SECS, QUEUE_RATE_BURST, QUEUE_RATE_PER_SEC,
};

struct Inner {
    queue: VecDeque<String>,
    /// Keys currently in `queue` (or waiting on a backoff timer).
    queued: HashSet<String>,
    /// Keys handed to a worker and not yet marked done.
    processing: HashSet<String>,
    /// Keys re-added while processing; queued again after `done`.
    redo: HashSet<String>,
    /// Consecutive failures per key, for the exponential backoff.
    failures: HashMap<String, u32>,
    bucket: TokenBucket,
    shutdown: bool,
}

struct TokenBucket {
    tokens: f64,
    last: Instant,
    rate: f64,
    burst: f64,
}

impl TokenBucket {
    /// Time to wait before one token is available; taking is immediate when
    /// the bucket is non-empty.
    fn take(&mut self) -> Duration {
        let now = Instant::now();
        self.tokens =
            (self.tokens + now.duration_since(self.last).as_secs_f64() * self.rate).min(self.burst);
        self.last = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Duration::ZERO
        } else {
            let wait = (1.0 - self.tokens) / self.rate;
            self.tokens -= 1.0;
            Duration::from_secs_f64(wait)
        }
    }
}

/// Deduplicating work queue with per-key exponential failure backoff and a
/// global rate limit.
///
/// A key is owned by at most one worker between `get` and `done`; a key
/// re-added while it is being processed is queued again only after `done`.
pub struct RetryQueue {
    inner: Mutex<Inner>,
    /// One permit per queued item; workers block on it in `get`.
    items: Semaphore,
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for RetryQueue {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(QUEUE_BASE_DELAY_MS),
            Duration::from_secs(QUEUE_MAX_DELAY_SECS),
            QUEUE_RATE_PER_SEC,
            QUEUE_RATE_BURST,
        )
    }
}

impl RetryQueue {
    pub fn new(base_delay: Duration, max_delay: Duration, rate: f64, burst: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                queued: HashSet::new(),
                processing: HashSet::new(),
                redo: HashSet::new(),
                failures: HashMap::new(),
                bucket: TokenBucket {
                    tokens: burst as f64,
                    last: Instant::now(),
                    rate,
                    burst: burst as f64,
                },
                shutdown: false,
            }),
            items: Semaphore::new(0),
            base_delay,
            max_delay,
        }
    }

    /// Enqueue a key. No-op if the key is already queued; deferred if it is
    /// currently being processed.
    pub fn add(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        if inner.shutdown {
            return;
        }
        if inner.processing.contains(key) {
            inner.redo.insert(key.to_string());
            return;
        }
        if !inner.queued.insert(key.to_string()) {
            return;
        }
        inner.queue.push_back(key.to_string());
        self.items.add_permits(1);
    }

    /// Re-enqueue a failed key after its per-key exponential backoff delay.
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let delay = {
            let mut inner = self.inner.lock().unwrap();
            if inner.shutdown {
                return;
            }
            let failures = inner.failures.entry(key.to_string()).or_insert(0);
            let delay = self.backoff_delay(*failures);
            *failures += 1;
            delay
        };
        debug!("requeueing {} after {:?}", key, delay);

        let queue = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Delay for the given consecutive failure count, doubling from the base
    /// and capped at the maximum.
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        let exp = failures.min(32);
        let delay = self.base_delay.saturating_mul(1u32.checked_shl(exp).unwrap_or(u32::MAX));
        delay.min(self.max_delay)
    }

    /// Mark a key finished; if it was re-added while processing it is queued
    /// again immediately.
    pub fn done(&self, key: &str) {
        let requeue = {
            let mut inner = self.inner.lock().unwrap();
            inner.processing.remove(key);
            inner.redo.remove(key)
        };
        if requeue {
            self.add(key);
        }
    }

    /// Clear the failure history of a key that synced successfully.
    pub fn forget(&self, key: &str) {
        self.inner.lock().unwrap().failures.remove(key);
    }

    /// Await the next key. Returns `None` once the queue is shut down and
    /// drained. Applies the global rate limit before handing out the key.
    pub async fn get(&self) -> Option<String> {
        loop {
            let permit = self.items.acquire().await.expect("queue semaphore closed");
            permit.forget();

            let (key, wait) = {
                let mut inner = self.inner.lock().unwrap();
                match inner.queue.pop_front() {
                    Some(key) => {
                        inner.queued.remove(&key);
                        inner.processing.insert(key.clone());
                        let wait = inner.bucket.take();
                        (key, wait)
                    }
                    None => {
                        if inner.shutdown {
                            return None;
                        }
                        continue;
                    }
                }
            };

            if wait > Duration::ZERO {
                tokio::time::sleep(wait).await;
            }
            return Some(key);
        }
    }

    /// Stop accepting work and wake every waiting worker. Keys already
    /// queued are still handed out so workers drain before exiting.
    pub fn shutdown(&self) {
        let already = {
            let mut inner = self.inner.lock().unwrap();
            std::mem::replace(&mut inner.shutdown, true)
        };
        if !already {
            // enough permits to wake any number of parked workers
            self.items.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }
}
