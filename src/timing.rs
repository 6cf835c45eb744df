//! Virtual time.
//!
//! Nothing in the client sleeps or reads the wall clock. Time only moves when
//! whoever drives the service loop calls [`VirtualClock::advance`], which keeps
//! timeouts deterministic under test.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared, monotonic source of virtual time measured in seconds.
///
/// Clones share the same underlying time, so a clock handed to a
/// [`Client`](crate::client::Client) and the one kept by the caller agree.
#[derive(Debug, Clone)]
pub struct VirtualClock {
    tyme: Arc<AtomicU64>,
}

impl VirtualClock {
    /// Creates a clock starting at `start` seconds.
    pub fn new(start: f64) -> Self {
        Self {
            tyme: Arc::new(AtomicU64::new(start.to_bits())),
        }
    }

    /// Current virtual time in seconds.
    pub fn now(&self) -> f64 {
        f64::from_bits(self.tyme.load(Ordering::Acquire))
    }

    /// Moves time forward by `amount` seconds.
    ///
    /// Negative or non-finite amounts are ignored: the clock never runs
    /// backwards.
    pub fn advance(&self, amount: f64) {
        if !amount.is_finite() || amount < 0.0 {
            tracing::warn!(amount, "ignoring invalid clock advance");
            return;
        }
        let _ = self
            .tyme
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                Some((f64::from_bits(bits) + amount).to_bits())
            });
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new(0.0)
    }
}

/// Expiry check against a [`VirtualClock`].
///
/// A timer is just a start time and a duration; it has no callbacks.
#[derive(Debug, Clone)]
pub struct Timer {
    clock: VirtualClock,
    start: f64,
    duration: f64,
}

impl Timer {
    /// Starts a timer of `duration` seconds at the clock's current time.
    pub fn new(clock: &VirtualClock, duration: f64) -> Self {
        Self {
            clock: clock.clone(),
            start: clock.now(),
            duration,
        }
    }

    pub fn start(&self) -> f64 {
        self.start
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    /// Seconds since the timer was (re)started.
    pub fn elapsed(&self) -> f64 {
        self.clock.now() - self.start
    }

    /// Seconds left before expiry; negative once expired.
    pub fn remaining(&self) -> f64 {
        self.duration - self.elapsed()
    }

    pub fn expired(&self) -> bool {
        self.elapsed() >= self.duration
    }

    /// Restarts from the current time, optionally with a new duration.
    pub fn restart(&mut self, duration: Option<f64>) {
        if let Some(duration) = duration {
            self.duration = duration;
        }
        self.start = self.clock.now();
    }
}
