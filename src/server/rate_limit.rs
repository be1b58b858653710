//! Per-principal sliding window rate limiting

use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Checked by every authenticated handler. `Err` carries the seconds the
/// caller should wait before retrying.
pub trait RateLimit: Send + Sync {
    fn check(&self, principal: &str, endpoint: &'static str) -> Result<(), u64>;

    /// Drop bookkeeping older than `max_age`
    fn cleanup(&self, _max_age: Duration) {}
}

/// A composite key: (user_id, endpoint tag)
type Key = (String, &'static str);

pub struct SlidingWindowLimiter {
    windows: DashMap<Key, Vec<Instant>>,
    limit: usize,
    window: Duration,
}

impl SlidingWindowLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            limit: limit.max(1),
            window,
        }
    }

    pub fn per_minute(limit: usize) -> Self {
        Self::new(limit, Duration::from_secs(60))
    }
}

impl RateLimit for SlidingWindowLimiter {
    fn check(&self, principal: &str, endpoint: &'static str) -> Result<(), u64> {
        let now = Instant::now();
        let mut entry = self
            .windows
            .entry((principal.to_string(), endpoint))
            .or_default();
        let timestamps = entry.value_mut();

        timestamps.retain(|t| now.duration_since(*t) < self.window);

        if timestamps.len() >= self.limit {
            let oldest = timestamps.first().copied().unwrap_or(now);
            let retry_after = (oldest + self.window).saturating_duration_since(now);
            return Err(retry_after.as_secs().max(1));
        }

        timestamps.push(now);
        Ok(())
    }

    fn cleanup(&self, max_age: Duration) {
        let now = Instant::now();
        self.windows.retain(|_, timestamps| {
            timestamps.retain(|t| now.duration_since(*t) < max_age);
            !timestamps.is_empty()
        });
    }
}

/// Never limits; for tests and trusted deployments
pub struct Unlimited;

impl RateLimit for Unlimited {
    fn check(&self, _principal: &str, _endpoint: &'static str) -> Result<(), u64> {
        Ok(())
    }
}
