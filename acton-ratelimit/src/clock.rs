//! Wall-clock abstraction so limiter timing can be faked in tests.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of unix time in fractional seconds
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Seconds since the unix epoch, with sub-second precision
    fn now(&self) -> f64;

    /// Whole seconds since the unix epoch
    fn now_secs(&self) -> i64 {
        self.now().floor() as i64
    }
}

/// Clock backed by `SystemTime::now()`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

/// Manually advanced clock for deterministic tests
///
/// Clones share the same underlying time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<f64>>,
}

impl ManualClock {
    /// Create a clock frozen at `start` unix seconds
    pub fn new(start: f64) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Move the clock forward by `secs`
    pub fn advance(&self, secs: f64) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += secs;
    }

    /// Jump the clock to an absolute time
    pub fn set(&self, at: f64) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}
