use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Sliding-window request counter keyed by caller.
///
/// Process-local and advisory: a restart or a second replica resets it.
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    hits: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Records a request for `key`; false when the window is already full.
    pub fn check(&self, key: &str) -> bool {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> bool {
        if self.max_requests == 0 {
            return false;
        }
        let Ok(mut hits) = self.hits.lock() else {
            return true;
        };
        // Idle callers are dropped so the map only holds live windows
        hits.retain(|_, window| {
            while window
                .front()
                .is_some_and(|t| now.duration_since(*t) >= self.window)
            {
                window.pop_front();
            }
            !window.is_empty()
        });
        let window = hits.entry(key.to_string()).or_default();
        if window.len() >= self.max_requests {
            return false;
        }
        window.push_back(now);
        true
    }
}
