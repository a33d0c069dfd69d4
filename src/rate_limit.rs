//! Argus Rate Limiting - Sliding window per client key

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

/// In-memory sliding window limiter keyed by client IP.
pub struct SlidingWindowLimiter {
    max_requests: usize,
    window: Duration,
    hits: RwLock<HashMap<String, VecDeque<Instant>>>,
}

impl SlidingWindowLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            hits: RwLock::new(HashMap::new()),
        }
    }

    /// Record one request for `key`. Returns false when the window is full.
    pub async fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut hits = self.hits.write().await;
        let queue = hits.entry(key.to_string()).or_default();

        while queue
            .front()
            .map(|at| now.duration_since(*at) >= self.window)
            .unwrap_or(false)
        {
            queue.pop_front();
        }

        if queue.len() >= self.max_requests {
            debug!(key, "Rate limit exceeded");
            return false;
        }
        queue.push_back(now);
        true
    }

    /// Drop keys whose entire window has expired. Called from a periodic
    /// sweep so idle clients do not accumulate.
    pub async fn prune(&self) {
        let now = Instant::now();
        let mut hits = self.hits.write().await;
        hits.retain(|_, queue| {
            queue
                .back()
                .map(|at| now.duration_since(*at) < self.window)
                .unwrap_or(false)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_limit_enforced_per_key() {
        let limiter = SlidingWindowLimiter::new(3, Duration::from_secs(60));

        for _ in 0..3 {
            assert!(limiter.check("10.0.0.1").await);
        }
        assert!(!limiter.check("10.0.0.1").await);
        // Other clients are unaffected.
        assert!(limiter.check("10.0.0.2").await);
    }

    #[tokio::test]
    async fn test_window_slides() {
        let limiter = SlidingWindowLimiter::new(2, Duration::from_millis(40));

        assert!(limiter.check("ip").await);
        assert!(limiter.check("ip").await);
        assert!(!limiter.check("ip").await);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(limiter.check("ip").await);
    }

    #[tokio::test]
    async fn test_prune_drops_idle_keys() {
        let limiter = SlidingWindowLimiter::new(5, Duration::from_millis(20));
        limiter.check("idle").await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        limiter.prune().await;
        assert!(limiter.hits.read().await.is_empty());
    }
}
