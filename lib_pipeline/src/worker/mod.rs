//! # Worker Module
//!
//! A producer/consumer pipeline built around one [`HandoffQueue`].
//!
//! ## Contained Modules:
//!
//! - **`queue`**: the unbounded FIFO rendezvous point. Items go straight to a
//!   waiting consumer when there is one and into an overflow buffer otherwise.
//! - **`consumer`**: a fixed number of worker tasks that pull items and run a
//!   user handler on each.
//! - **`producer`**: forwards items emitted by a pluggable handler into the
//!   queue. `IntervalProducerHandler` is the timer-driven handler.
//! - **`pool`**: the `Worker` orchestrator that owns a queue, a producer and a
//!   consumer and stops them in the right order.

use thiserror::Error;

/// The handoff queue and its consumer endpoint.
pub mod queue;
/// Concurrent consumers draining a queue.
pub mod consumer;
/// Relay-based producers and the interval-driven handler.
pub mod producer;
/// The orchestrator tying a producer and a consumer to one queue.
pub mod pool;

// --- Public API Re-exports ---
pub use consumer::Consumer;
pub use pool::{Worker, WorkerConsumer, WorkerProducer};
pub use producer::{IntervalProducerHandler, Producer, ProducerHandler};
pub use queue::{HandoffQueue, QueueReceiver};

/// Errors surfaced by the worker pipeline.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkerError {
    /// `put` was called after the queue was closed.
    #[error("handoff queue is closed")]
    QueueClosed,
}
