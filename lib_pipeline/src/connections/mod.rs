//! # Connections Module
//!
//! Keeps one logical connection to a remote peer alive across transport
//! failures. The wire protocol is supplied by the embedding application
//! through the [`Dialer`] and [`Connection`] traits.
//!
//! ## Contained Modules:
//!
//! - **`backoff`**: the bounded sawtooth delay used between reconnect attempts.
//! - **`resilient`**: `ResilientClient`, its configuration, its state machine
//!   and its error type.

/// Reconnect delay policy.
pub mod backoff;
/// The self-healing connection client.
pub mod resilient;

// --- Public API Re-exports ---
pub use backoff::{BackoffPolicy, ReconnectBackoff};
pub use resilient::{
    BoxError, ClientConfig, ClientError, Connection, ConnectionState, Dialer, ResilientClient,
};
