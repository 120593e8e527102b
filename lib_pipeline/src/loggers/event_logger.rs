//! # Event Logger
//!
//! The connection client reports reconnect and disconnect events to an
//! [`EventLogger`] instead of a concrete backend, so embedding applications
//! decide where those lines go. Whether a logger is installed never changes
//! client behavior.

use std::fmt;

use log::Level;

/// Accepts leveled, preformatted messages.
pub trait EventLogger: Send + Sync + 'static {
    /// Records one message at `level`.
    fn log(&self, level: Level, message: &str);

    /// Records a message at `Level::Debug`.
    fn debug(&self, message: &str) {
        self.log(Level::Debug, message);
    }

    /// Records a message at `Level::Info`.
    fn info(&self, message: &str) {
        self.log(Level::Info, message);
    }

    /// Records a message at `Level::Warn`.
    fn warn(&self, message: &str) {
        self.log(Level::Warn, message);
    }

    /// Records a message at `Level::Error`.
    fn error(&self, message: &str) {
        self.log(Level::Error, message);
    }
}

/// # Facade Logger
///
/// Forwards every message to the `log` facade under a fixed target. With no
/// logger installed in the process this costs a level check and nothing else.
#[derive(Clone)]
pub struct FacadeLogger {
    target: &'static str,
}

impl FacadeLogger {
    /// Target used by [`FacadeLogger::default`].
    pub const DEFAULT_TARGET: &'static str = "lib_pipeline::connections";

    /// Creates a logger that writes under `target`.
    pub fn new(target: &'static str) -> Self {
        Self { target }
    }

    /// The `log` target this logger writes under.
    pub fn target(&self) -> &'static str {
        self.target
    }
}

impl Default for FacadeLogger {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TARGET)
    }
}

impl fmt::Debug for FacadeLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FacadeLogger")
            .field("target", &self.target)
            .finish()
    }
}

impl EventLogger for FacadeLogger {
    fn log(&self, level: Level, message: &str) {
        log::log!(target: self.target, level, "{}", message);
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLogger;

impl EventLogger for NoopLogger {
    fn log(&self, _level: Level, _message: &str) {}
}
