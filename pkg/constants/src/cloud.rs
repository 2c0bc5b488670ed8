//! Cloud resolver defaults.

/// Retry attempts for a cloud API call, including the first.
pub const BACKOFF_STEPS: u32 = 6;

/// Base delay between retries, in seconds.
pub const BACKOFF_BASE_SECS: u64 = 5;

/// Multiplicative factor applied to the delay after each attempt.
pub const BACKOFF_FACTOR: f64 = 1.5;

/// Jitter as a fraction of the current delay.
pub const BACKOFF_JITTER: f64 = 1.0;

/// TTL for cached standalone virtual machine lookups, in seconds.
pub const VM_CACHE_TTL_SECS: u64 = 15;

/// Interval between full scale-set snapshot refreshes, in seconds.
pub const SNAPSHOT_REFRESH_SECS: u64 = 300;
