//! Time sources for the scheduler.
//!
//! All times are absolute epoch milliseconds as `i64`, so targets before the
//! epoch (or simply in the past) are representable and clamp to "due now".

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

/// A wall-clock source for the scheduler.
pub trait Clock: Send + Sync + 'static {
    /// Get the current time in milliseconds since epoch.
    fn now_ms(&self) -> i64;
}

impl<C: Clock> Clock for Arc<C> {
    fn now_ms(&self) -> i64 {
        self.as_ref().now_ms()
    }
}

/// Real wall clock implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct WallClock;

impl Clock for WallClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// A deterministic clock for testing.
#[derive(Debug)]
pub struct DeterministicClock {
    current_ms: AtomicI64,
}

impl DeterministicClock {
    /// Create a new deterministic clock starting at the given time.
    #[must_use]
    pub const fn new(start_ms: i64) -> Self {
        Self {
            current_ms: AtomicI64::new(start_ms),
        }
    }

    /// Advance the clock by the given duration.
    pub fn advance(&self, ms: i64) {
        self.current_ms.fetch_add(ms, Ordering::SeqCst);
    }

    /// Set the clock to a specific time.
    pub fn set(&self, ms: i64) {
        self.current_ms.store(ms, Ordering::SeqCst);
    }
}

impl Clock for DeterministicClock {
    fn now_ms(&self) -> i64 {
        self.current_ms.load(Ordering::SeqCst)
    }
}

/// Remaining delay until `target_ms`, clamped at zero.
#[must_use]
pub const fn delay_ms(target_ms: i64, now_ms: i64) -> u64 {
    let remaining = target_ms.saturating_sub(now_ms);
    if remaining > 0 {
        remaining.unsigned_abs()
    } else {
        0
    }
}

/// Convert a `DateTime` to epoch millis.
#[must_use]
pub fn to_epoch_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}
