/// The leveled logging collaborator and its stock implementations.
pub mod event_logger;

pub use event_logger::{EventLogger, FacadeLogger, NoopLogger};
