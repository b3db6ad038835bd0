//! Per load test exponential backoff applied when a reconcile fails.
use std::time::Duration;

use dashmap::DashMap;

use super::owners::Key;

/// Failure counts by load test, reset once a reconcile succeeds.
#[derive(Debug)]
pub struct RetryBackoff {
    base: Duration,
    max: Duration,
    failures: DashMap<Key, u32>,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_secs(1000))
    }
}

impl RetryBackoff {
    /// Backoff doubling from `base` up to `max`.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: DashMap::new(),
        }
    }

    /// Delay before the retry following `failures` previous failures.
    pub fn delay(&self, failures: u32) -> Duration {
        let factor = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
        self.base.checked_mul(factor).unwrap_or(self.max).min(self.max)
    }

    /// Record a failure of the load test and return the delay before its retry.
    pub fn next_delay(&self, key: &Key) -> Duration {
        let mut failures = self.failures.entry(key.clone()).or_insert(0);
        let delay = self.delay(*failures);
        *failures = failures.saturating_add(1);
        delay
    }

    /// Number of consecutive failures of the load test.
    pub fn failures(&self, key: &Key) -> u32 {
        self.failures.get(key).map(|f| *f).unwrap_or_default()
    }

    /// Forget the failures of the load test.
    pub fn reset(&self, key: &Key) {
        self.failures.remove(key);
    }

    /// Number of load tests waiting for a retry.
    pub fn pending(&self) -> usize {
        self.failures.len()
    }
}
