//! Wall-clock sources for expiry decisions.
//!
//! Validation takes `now` as an argument; the session manager reads it from a
//! `Clock` so tests can run against tokio's paused timer.

use chrono::Utc;
use tokio::time::Instant;

/// Source of the current time in epoch seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

/// Reads the system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        Utc::now().timestamp()
    }
}

/// Epoch anchored at construction and advanced by tokio's monotonic clock.
///
/// Under `tokio::time::pause` this clock moves exactly as far as the runtime's
/// timers do, keeping claim expiry and scheduled callbacks in agreement.
#[derive(Debug, Clone, Copy)]
pub struct InstantClock {
    epoch: i64,
    anchor: Instant,
}

impl InstantClock {
    pub fn starting_at(epoch: i64) -> Self {
        Self {
            epoch,
            anchor: Instant::now(),
        }
    }

    pub fn from_system() -> Self {
        Self::starting_at(Utc::now().timestamp())
    }
}

impl Clock for InstantClock {
    fn now(&self) -> i64 {
        self.epoch + self.anchor.elapsed().as_secs() as i64
    }
}
