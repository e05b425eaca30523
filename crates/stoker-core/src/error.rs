//! Error types for the daemon core.

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Failure modes of the scheduler, process table, and log channel.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Configuration rejected at validation time. Fatal, no restart.
    #[error("configuration error: {0}")]
    Config(String),

    /// Initialization (signal install, log open, daemonize) failed.
    #[error("initialization failed: {0}")]
    Init(String),

    /// An intentional abort: logged without a stack trace, never
    /// triggers an auto-restart.
    #[error("{0}")]
    Clean(String),

    /// A runtime failure inside the loop or a plugin.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// `fork(2)` failed after the silent retries were exhausted.
    #[error("fork failed: {0}")]
    Fork(String),

    /// Installing or manipulating signal handlers failed.
    #[error("signal error: {0}")]
    Signal(String),

    /// The log channel could not be opened or written.
    #[error("log error: {0}")]
    Log(String),

    /// Rebuilding or exec'ing the restart command failed.
    #[error("restart failed: {0}")]
    Restart(String),

    /// An unrecoverable error; tears the daemon down.
    #[error("fatal: {0}")]
    Fatal(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Creates a configuration error.
    #[must_use]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates an initialization error.
    #[must_use]
    pub fn init(msg: impl Into<String>) -> Self {
        Self::Init(msg.into())
    }

    /// Creates a clean (intentional-abort) error.
    #[must_use]
    pub fn clean(msg: impl Into<String>) -> Self {
        Self::Clean(msg.into())
    }

    /// Creates a runtime error.
    #[must_use]
    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::Runtime(msg.into())
    }

    /// Creates a fatal error.
    #[must_use]
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// True when the daemon must tear down rather than continue.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Init(_) | Self::Fatal(_))
    }

    /// True for intentional aborts that suppress restart and stack
    /// traces.
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        matches!(self, Self::Clean(_))
    }
}
