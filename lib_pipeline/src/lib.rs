//! # lib_pipeline
//!
//! Building blocks for a resilient asynchronous pipeline:
//!
//! - **`utils`**: a `Clock` abstraction with a tokio-backed `RealClock` and a
//!   deterministic `FakeClock` whose time only moves when a test advances it.
//! - **`worker`**: the `HandoffQueue` rendezvous point plus the producer,
//!   consumer and orchestrator that run around it.
//! - **`connections`**: `ResilientClient`, which owns one logical connection
//!   and re-dials with a bounded backoff whenever the transport drops it.
//! - **`loggers`**: the leveled logging collaborator the client reports to.
//!
//! Each folder is gated behind a cargo feature of the same name; `full`
//! (the default) enables all of them.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

#[cfg(feature = "utils")]
pub mod utils;

#[cfg(feature = "loggers")]
pub mod loggers;

#[cfg(feature = "worker")]
pub mod worker;

#[cfg(feature = "connections")]
pub mod connections;

// --- Public API Re-exports ---
#[cfg(feature = "utils")]
pub use utils::{Clock, FakeClock, RealClock, Timer};

#[cfg(feature = "loggers")]
pub use loggers::{EventLogger, FacadeLogger, NoopLogger};

#[cfg(feature = "worker")]
pub use worker::{
    Consumer, HandoffQueue, IntervalProducerHandler, Producer, ProducerHandler, QueueReceiver,
    Worker, WorkerConsumer, WorkerError, WorkerProducer,
};

#[cfg(feature = "connections")]
pub use connections::{
    BackoffPolicy, ClientConfig, ClientError, Connection, ConnectionState, Dialer,
    ResilientClient,
};
