use dashmap::DashMap;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

/// Limit for one kind of action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateRule {
    pub max: u32,
    pub window: Duration,
}

/// 20 login attempts per IP every 5 minutes.
pub const LOGIN: RateRule = RateRule {
    max: 20,
    window: Duration::from_secs(5 * 60),
};

/// 20 new short URLs per user every hour.
pub const CREATE_URL: RateRule = RateRule {
    max: 20,
    window: Duration::from_secs(60 * 60),
};

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Fixed-window counters keyed by identifier (`login:{ip}`,
/// `create-url:{user}`). Process-local; a restart forgets everything.
#[derive(Clone, Debug, Default)]
pub struct RateLimiter {
    windows: Arc<DashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one attempt for `key`. Returns `false` once more than
    /// `rule.max` attempts fall into the current window.
    pub fn check(&self, key: &str, rule: RateRule) -> bool {
        self.check_at(key, rule, Instant::now())
    }

    fn check_at(&self, key: &str, rule: RateRule, now: Instant) -> bool {
        let mut entry = self.windows.entry(key.to_owned()).or_insert(Window {
            started: now,
            count: 0,
        });

        if now.saturating_duration_since(entry.started) >= rule.window {
            *entry = Window {
                started: now,
                count: 0,
            };
        }

        if entry.count >= rule.max {
            return false;
        }
        entry.count += 1;
        true
    }

    /// Forget `key`, e.g. after a successful login.
    pub fn reset(&self, key: &str) {
        self.windows.remove(key);
    }

    /// Drop windows older than `max_age`.
    pub fn prune(&self, max_age: Duration) {
        let now = Instant::now();
        self.windows
            .retain(|_, w| now.saturating_duration_since(w.started) < max_age);
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}
