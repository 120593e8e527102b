//! # Clock Abstraction
//!
//! A [`Clock`] hands out [`Timer`]s. A timer is armed on creation, fires once
//! per arm, and can be re-armed with [`Timer::reset`] or disarmed with
//! [`Timer::stop`]. Waiting is done through [`Timer::fired`], which is
//! cancel-safe and therefore fits inside `tokio::select!` next to a shutdown
//! signal.
//!
//! Two implementations exist:
//!
//! - [`RealClock`]: wraps `tokio::time::Sleep`.
//! - [`FakeClock`](super::fake_clock::FakeClock): virtual time for tests.

use std::future::pending;
use std::pin::Pin;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{Instant, Sleep};

use super::fake_clock::FakeTimer;

/// A source of resettable, stoppable timers.
pub trait Clock: Send + Sync + 'static {
    /// Returns a timer armed to fire `duration` from the clock's current time.
    fn timer(&self, duration: Duration) -> Timer;
}

/// # Timer
///
/// A one-shot timer produced by a [`Clock`]. The variant depends on which clock
/// created it; callers only use the methods below.
pub enum Timer {
    /// Backed by the tokio timer wheel.
    Real(RealTimer),
    /// Backed by a [`FakeClock`](super::fake_clock::FakeClock) scheduler.
    Fake(FakeTimer),
}

impl Timer {
    /// Re-arms the timer to fire `duration` from now and clears any stop.
    ///
    /// Returns whether the timer was still active, mirroring the host timer
    /// API. Virtual timers always report `true`.
    pub fn reset(&mut self, duration: Duration) -> bool {
        match self {
            Timer::Real(timer) => timer.reset(duration),
            Timer::Fake(timer) => timer.reset(duration),
        }
    }

    /// Disarms the timer. Returns `true` only if this call moved it from
    /// armed to stopped.
    pub fn stop(&mut self) -> bool {
        match self {
            Timer::Real(timer) => timer.stop(),
            Timer::Fake(timer) => timer.stop(),
        }
    }

    /// Waits until the timer fires and returns the clock's time at that moment.
    ///
    /// Never resolves while the timer is stopped.
    pub async fn fired(&mut self) -> DateTime<Utc> {
        match self {
            Timer::Real(timer) => timer.fired().await,
            Timer::Fake(timer) => timer.fired().await,
        }
    }
}

/// # Real Clock
///
/// Hands out timers backed by `tokio::time`. Timers must be created and
/// awaited inside a tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new `RealClock`.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn timer(&self, duration: Duration) -> Timer {
        Timer::Real(RealTimer::new(duration))
    }
}

/// A timer on the tokio timer wheel.
#[derive(Debug)]
pub struct RealTimer {
    sleep: Pin<Box<Sleep>>,
    armed: bool,
}

impl RealTimer {
    fn new(duration: Duration) -> Self {
        Self {
            sleep: Box::pin(tokio::time::sleep(duration)),
            armed: true,
        }
    }

    /// Armed and not yet elapsed.
    fn active(&self) -> bool {
        self.armed && !self.sleep.is_elapsed()
    }

    /// See [`Timer::reset`].
    pub fn reset(&mut self, duration: Duration) -> bool {
        let was_active = self.active();
        self.sleep.as_mut().reset(deadline(duration));
        self.armed = true;
        was_active
    }

    /// See [`Timer::stop`].
    pub fn stop(&mut self) -> bool {
        let was_active = self.active();
        self.armed = false;
        was_active
    }

    /// See [`Timer::fired`].
    pub async fn fired(&mut self) -> DateTime<Utc> {
        if !self.armed {
            pending::<()>().await;
        }
        self.sleep.as_mut().await;
        self.armed = false;
        Utc::now()
    }
}

// Saturates like `tokio::time::sleep` instead of panicking on overflow.
fn deadline(duration: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(duration)
        .unwrap_or_else(|| now + Duration::from_secs(86400 * 365 * 30))
}
