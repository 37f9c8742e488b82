//! Fixed-window event rate limiting, keyed by user.
//!
//! Windows are shared by every connection of the same user and are dropped
//! when the user's last connection closes.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::error::GatewayError;

struct Window {
    count: u32,
    reset_at: Instant,
}

pub struct RateLimiter {
    windows: DashMap<String, Window>,
    window: Duration,
    max_events: u32,
}

impl RateLimiter {
    pub fn new(window: Duration, max_events: u32) -> Self {
        Self {
            windows: DashMap::new(),
            window,
            max_events,
        }
    }

    /// Count one event for `user_id` at the current instant.
    pub fn check(&self, user_id: &str) -> Result<(), GatewayError> {
        self.check_at(user_id, Instant::now())
    }

    /// Count one event for `user_id` at `now`. The entry is locked for the
    /// whole read-modify-write, so concurrent connections of one user cannot
    /// both slip past the limit.
    pub fn check_at(&self, user_id: &str, now: Instant) -> Result<(), GatewayError> {
        let mut window = self
            .windows
            .entry(user_id.to_string())
            .or_insert_with(|| Window {
                count: 0,
                reset_at: now + self.window,
            });

        if now > window.reset_at {
            window.count = 0;
            window.reset_at = now + self.window;
        }

        window.count = window.count.saturating_add(1);
        if window.count > self.max_events {
            return Err(GatewayError::RateLimitExceeded);
        }
        Ok(())
    }

    /// Forget a user's window.
    pub fn remove(&self, user_id: &str) {
        self.windows.remove(user_id);
    }

    pub fn tracked_users(&self) -> usize {
        self.windows.len()
    }
}
