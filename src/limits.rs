use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

const PRUNE_INTERVAL: Duration = Duration::from_secs(300);

/// Fixed-window per-client request limiter.
#[derive(Clone)]
pub struct RequestRateLimiter {
    limit: u64,
    window: Duration,
    buckets: Arc<DashMap<String, RateWindow>>,
}

struct RateWindow {
    start: Instant,
    count: u64,
}

impl RequestRateLimiter {
    pub fn new(limit: u64, window: Duration) -> Self {
        let buckets = Arc::new(DashMap::new());
        let buckets_clone = Arc::clone(&buckets);

        // Background pruning task: removes expired entries every 5 minutes
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PRUNE_INTERVAL);
            loop {
                interval.tick().await;
                if let Some(prune_before) = Instant::now().checked_sub(window * 2) {
                    buckets_clone.retain(|_, state: &mut RateWindow| state.start > prune_before);
                }
            }
        });

        Self {
            limit,
            window,
            buckets,
        }
    }

    pub fn try_acquire(&self, key: &str) -> bool {
        let now = Instant::now();

        let mut state = self.buckets.entry(key.to_string()).or_insert(RateWindow {
            start: now,
            count: 0,
        });

        if now.duration_since(state.start) >= self.window {
            state.start = now;
            state.count = 0;
        }

        if state.count < self.limit {
            state.count += 1;
            true
        } else {
            false
        }
    }
}
