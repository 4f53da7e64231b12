//! Time source used by every sampling loop, pulse timer and switch settle delay.
//!
//! Controllers never call [`std::thread::sleep`] or [`std::time::Instant`] directly: they go
//! through a [`Clock`] so a test can substitute [`SimClock`] and step through hours of cycling
//! deterministically.

use std::time::{Duration, Instant};

pub trait Clock {
    /// Monotonic time since an arbitrary, fixed origin.
    fn now(&self) -> Duration;
    /// Blocks for `duration`. This is the only suspension point of a running test.
    fn sleep(&mut self, duration: Duration);
}

/// Wall clock backed by [`Instant`] and [`std::thread::sleep`].
///
/// `time_scale` divides every sleep (and multiplies reported time accordingly), which lets a
/// simulated bench run faster than real time without changing the configured intervals.
pub struct SystemClock {
    origin: Instant,
    time_scale: f64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::scaled(1.0)
    }

    /// A clock whose sleeps are `time_scale` times shorter than requested.
    pub fn scaled(time_scale: f64) -> Self {
        let time_scale = if time_scale.is_finite() && time_scale > 0.0 {
            time_scale
        } else {
            1.0
        };
        Self {
            origin: Instant::now(),
            time_scale,
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed().mul_f64(self.time_scale)
    }

    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration.div_f64(self.time_scale));
    }
}

/// Simulated clock: `sleep` advances time instantly and is recorded.
#[derive(Clone, Debug, Default)]
pub struct SimClock {
    now: Duration,
    sleeps: Vec<Duration>,
}

impl SimClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every sleep requested so far, in order.
    pub fn sleeps(&self) -> &[Duration] {
        &self.sleeps
    }

    /// Moves time forward without recording a sleep (e.g. to model slow I/O).
    pub fn advance(&mut self, by: Duration) {
        self.now += by;
    }
}

impl Clock for SimClock {
    fn now(&self) -> Duration {
        self.now
    }

    fn sleep(&mut self, duration: Duration) {
        self.sleeps.push(duration);
        self.now += duration;
    }
}
