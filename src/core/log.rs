//! Per-webhook capture log.
//!
//! Every message logged through a [`DinghyLog`] is emitted through `tracing`
//! and also appended to an in-memory buffer. When the webhook finishes, the
//! buffer becomes the `message` of the persisted log event, so operators can
//! see exactly what happened for one push without searching the process logs.

use std::fmt::Write as _;
use std::sync::Arc;

use parking_lot::Mutex;

/// Severity of a captured line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    fn label(self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }
}

/// Cloneable capture log shared by everything handling one webhook.
#[derive(Debug, Clone, Default)]
pub struct DinghyLog {
    buffer: Arc<Mutex<String>>,
}

impl DinghyLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        tracing::debug!("{}", message.as_ref());
        self.capture(Level::Debug, message.as_ref());
    }

    pub fn info(&self, message: impl AsRef<str>) {
        tracing::info!("{}", message.as_ref());
        self.capture(Level::Info, message.as_ref());
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        tracing::warn!("{}", message.as_ref());
        self.capture(Level::Warn, message.as_ref());
    }

    pub fn error(&self, message: impl AsRef<str>) {
        tracing::error!("{}", message.as_ref());
        self.capture(Level::Error, message.as_ref());
    }

    fn capture(&self, level: Level, message: &str) {
        let mut buffer = self.buffer.lock();
        let _ = writeln!(buffer, "[{}] {}", level.label(), message);
    }

    /// Everything captured so far.
    pub fn contents(&self) -> String {
        self.buffer.lock().clone()
    }

    /// Whether anything was captured at `Error` level.
    pub fn has_errors(&self) -> bool {
        self.buffer.lock().lines().any(|line| line.starts_with("[ERROR]"))
    }
}
