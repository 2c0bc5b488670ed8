use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::CloudError;
use pkg_constants::cloud::{BACKOFF_BASE_SECS, BACKOFF_FACTOR, BACKOFF_JITTER, BACKOFF_STEPS};

/// Bounded exponential backoff parameters for cloud API calls.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    /// Total attempts, including the first.
    pub steps: u32,
    pub base: Duration,
    pub factor: f64,
    /// Jitter as a fraction of the current delay.
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            steps: BACKOFF_STEPS,
            base: Duration::from_secs(BACKOFF_BASE_SECS),
            factor: BACKOFF_FACTOR,
            jitter: BACKOFF_JITTER,
        }
    }
}

impl Backoff {
    /// A single attempt, no retry.
    pub fn none() -> Self {
        Self {
            steps: 1,
            ..Self::default()
        }
    }
}

/// Run `op`, retrying only on `CloudError::Transient` up to the configured
/// step count. Any other error aborts immediately. Returns the last
/// transient error when all attempts are exhausted.
pub async fn retry<T, F, Fut>(backoff: &Backoff, mut op: F) -> Result<T, CloudError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CloudError>>,
{
    let steps = backoff.steps.max(1);
    let mut delay = backoff.base;
    let mut last = CloudError::Transient("no attempts made".to_string());

    for attempt in 1..=steps {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() => {
                debug!("attempt {}/{} failed: {}", attempt, steps, err);
                last = err;
            }
            Err(err) => return Err(err),
        }
        if attempt < steps {
            tokio::time::sleep(jittered(delay, backoff.jitter)).await;
            delay = delay.mul_f64(backoff.factor);
        }
    }

    Err(last)
}

fn jittered(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }
    delay + delay.mul_f64(jitter * rand::rng().random::<f64>())
}
