//! Retry queue and controller tuning.

/// Base delay for per-key failure backoff, in milliseconds.
pub const QUEUE_BASE_DELAY_MS: u64 = 200;

/// Upper bound on per-key failure backoff, in seconds.
pub const QUEUE_MAX_DELAY_SECS: u64 = 100;

/// Sustained rate of the global queue token bucket, items per second.
pub const QUEUE_RATE_PER_SEC: f64 = 10.0;

/// Burst capacity of the global queue token bucket.
pub const QUEUE_RATE_BURST: u64 = 100;

/// How often the controller re-lists all signing requests, in seconds.
pub const DEFAULT_RESYNC_SECS: u64 = 180;

/// Default number of reconcile workers.
pub const DEFAULT_WORKERS: usize = 2;
