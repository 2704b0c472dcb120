use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Rolling-window limiter keyed by caller identity
///
/// Each caller may make `max_requests` within any `window`. Timestamps
/// older than the window are pruned on every check.
pub struct SlidingWindowLimiter {
    max_requests: usize,
    window: Duration,
    buckets: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl SlidingWindowLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Record a request for `caller` if it is within its allowance
    ///
    /// On rejection nothing is recorded and the time until the oldest
    /// request leaves the window is returned.
    pub fn check(&self, caller: &str) -> Result<(), Duration> {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap_or_else(|p| p.into_inner());
        let bucket = buckets.entry(caller.to_string()).or_default();

        while bucket
            .front()
            .is_some_and(|&t| now.duration_since(t) >= self.window)
        {
            bucket.pop_front();
        }

        if bucket.len() >= self.max_requests {
            let retry_after = bucket
                .front()
                .map(|&oldest| self.window.saturating_sub(now.duration_since(oldest)))
                .unwrap_or(self.window);
            return Err(retry_after);
        }

        bucket.push_back(now);
        Ok(())
    }

    /// Requests `caller` may still make in the current window
    pub fn remaining(&self, caller: &str) -> usize {
        let now = Instant::now();
        let buckets = self.buckets.lock().unwrap_or_else(|p| p.into_inner());
        let used = buckets
            .get(caller)
            .map(|b| {
                b.iter()
                    .filter(|&&t| now.duration_since(t) < self.window)
                    .count()
            })
            .unwrap_or(0);
        self.max_requests.saturating_sub(used)
    }

    /// Drop buckets with no request inside the window
    pub fn prune(&self) {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap_or_else(|p| p.into_inner());
        buckets.retain(|_, bucket| {
            bucket
                .back()
                .is_some_and(|&t| now.duration_since(t) < self.window)
        });
    }

    pub fn tracked_callers(&self) -> usize {
        self.buckets.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}
