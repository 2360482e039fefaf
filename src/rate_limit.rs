//! Rate Limiting
//!
//! Per-user leaky-bucket meter for preventing event floods.
//!
//! Each allowed event adds a fixed cost to the user's meter; the meter drains
//! in real time. A full meter (one minute of budget) rejects the event, so a
//! user can burst up to the per-minute limit and then sustains exactly that
//! rate.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Budget window: one minute, in milliseconds.
const CAPACITY_MS: u64 = 60_000;

#[derive(Debug)]
struct Meter {
    /// Consumed budget in milliseconds; drains as wall time passes.
    level_ms: u64,
    /// Last time the meter was drained.
    last_update: Instant,
}

impl Meter {
    fn drain(&mut self, now: Instant) {
        let elapsed_ms = now.duration_since(self.last_update).as_millis() as u64;
        self.level_ms = self.level_ms.saturating_sub(elapsed_ms);
        self.last_update = now;
    }
}

/// Rate limiter tracking one meter per user.
pub struct RateLimiter {
    meters: RwLock<HashMap<String, Meter>>,
    /// Cost of one event in milliseconds of budget.
    cost_ms: u64,
}

impl RateLimiter {
    /// Creates a new rate limiter.
    ///
    /// `max_per_minute` is the number of events allowed per minute per user.
    /// Zero blocks everything.
    pub fn new(max_per_minute: u32) -> Self {
        let cost_ms = if max_per_minute == 0 {
            CAPACITY_MS + 1
        } else {
            (CAPACITY_MS / max_per_minute as u64).max(1)
        };
        RateLimiter {
            meters: RwLock::new(HashMap::new()),
            cost_ms,
        }
    }

    /// Charges one event against this user's meter.
    ///
    /// Returns true if allowed, false if rate limited.
    pub fn consume(&self, user_id: &str) -> bool {
        let now = Instant::now();
        let mut meters = self.meters.write().unwrap();
        let meter = meters.entry(user_id.to_string()).or_insert(Meter {
            level_ms: 0,
            last_update: now,
        });
        meter.drain(now);

        if meter.level_ms + self.cost_ms <= CAPACITY_MS {
            meter.level_ms += self.cost_ms;
            true
        } else {
            false
        }
    }

    /// Removes meters idle for longer than `max_idle`. Returns the number
    /// removed.
    pub fn cleanup_inactive(&self, max_idle: Duration) -> usize {
        let mut meters = self.meters.write().unwrap();
        let now = Instant::now();
        let initial_count = meters.len();

        meters.retain(|_, meter| now.duration_since(meter.last_update) < max_idle);

        initial_count - meters.len()
    }

    /// Returns the number of users currently tracked.
    pub fn tracked_users(&self) -> usize {
        let meters = self.meters.read().unwrap();
        meters.len()
    }
}
