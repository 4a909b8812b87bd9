//! Rate limiting of data-path log lines
//!
//! A failing write path can produce the same error for every row. The
//! limiter lets one line per cause through per window and reports how many
//! were suppressed in between.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug)]
struct Slot {
    window_start: Instant,
    suppressed: u64,
}

/// Per cause key log gate
#[derive(Debug)]
pub struct LogLimiter {
    window: Duration,
    slots: Mutex<HashMap<String, Slot>>,
}

impl Default for LogLimiter {
    fn default() -> Self {
        Self::new(crate::config::LOG_LIMIT_WINDOW)
    }
}

impl LogLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// `Some(suppressed)` when a line for `key` may be logged now, with the
    /// number of lines dropped since the last one
    pub fn check(&self, key: &str) -> Option<u64> {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> Option<u64> {
        let mut slots = self.slots.lock();
        match slots.get_mut(key) {
            Some(slot) if now.duration_since(slot.window_start) < self.window => {
                slot.suppressed += 1;
                None
            }
            Some(slot) => {
                let suppressed = slot.suppressed;
                slot.window_start = now;
                slot.suppressed = 0;
                Some(suppressed)
            }
            None => {
                slots.insert(
                    key.to_string(),
                    Slot {
                        window_start: now,
                        suppressed: 0,
                    },
                );
                Some(0)
            }
        }
    }
}

/// Log through a [`LogLimiter`]: `limited!(limiter, "key", warn, field = x, "message")`
#[macro_export]
macro_rules! limited {
    ($limiter:expr, $key:expr, $level:ident, $($arg:tt)+) => {
        if let Some(suppressed) = $limiter.check($key) {
            tracing::$level!(suppressed, $($arg)+);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_line_per_window() {
        let limiter = LogLimiter::new(Duration::from_secs(10));
        let t0 = Instant::now();
        assert_eq!(limiter.check_at("a", t0), Some(0));
        assert_eq!(limiter.check_at("a", t0 + Duration::from_secs(1)), None);
        assert_eq!(limiter.check_at("a", t0 + Duration::from_secs(2)), None);
        assert_eq!(limiter.check_at("b", t0 + Duration::from_secs(2)), Some(0));
        assert_eq!(limiter.check_at("a", t0 + Duration::from_secs(11)), Some(2));
        assert_eq!(limiter.check_at("a", t0 + Duration::from_secs(12)), None);
    }
}
