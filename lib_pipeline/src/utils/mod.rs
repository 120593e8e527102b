//! # Utilities Module
//!
//! Time sources shared by the rest of the crate. Everything that waits on a
//! timer (the interval producer, the reconnect loop) asks a [`Clock`] for it
//! instead of calling `tokio::time` directly, so tests can swap in a
//! [`FakeClock`] and drive time by hand.
//!
//! ## Contained Modules:
//!
//! - **`clock`**: the `Clock` trait, the `Timer` handle and the tokio-backed
//!   `RealClock`.
//! - **`fake_clock`**: the virtual-time `FakeClock` used by tests.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// The clock trait, the timer handle and the real-time implementation.
pub mod clock;
/// A virtual-time clock whose "now" only moves when advanced.
pub mod fake_clock;

// --- Public API Re-exports ---
pub use clock::{Clock, RealClock, RealTimer, Timer};
pub use fake_clock::{FakeClock, FakeTimer, FakeTimerHandle};
