//! The worker-side error taxonomy.
//!
//! One discriminant drives everything: retry decisions, threshold
//! counting, and whether a failure may restart the daemon. The seven
//! kinds map one-to-one onto how the mediator reacts.

use stoker_ipc::IpcError;

/// Result type alias for mediator operations.
pub type Result<T> = std::result::Result<T, WorkerError>;

/// Failure modes of calls, workers, and the mediator itself.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkerError {
    /// Rejected at registration or configuration time. Fatal, no
    /// restart.
    #[error("validation error: {0}")]
    Validation(String),

    /// An intentional abort (or a worker method's own failure):
    /// logged without a stack trace, never restarts anything.
    #[error("{0}")]
    Clean(String),

    /// "No message" / "temporarily unavailable" / interrupted; retried
    /// with back-off.
    #[error("transient error: {0}")]
    Transient(String),

    /// The queue or segment was destroyed; reattach and continue.
    #[error("identity error: {0}")]
    Identity(String),

    /// A payload failed to round-trip.
    #[error("corruption: {0}")]
    Corruption(String),

    /// The servicing child died before returning.
    #[error("call died: {0}")]
    Died(String),

    /// Unrecoverable for this mediator.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl WorkerError {
    /// Creates a validation error.
    #[must_use]
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Creates a clean error.
    #[must_use]
    pub fn clean(msg: impl Into<String>) -> Self {
        Self::Clean(msg.into())
    }

    /// Creates a transient error.
    #[must_use]
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Creates a "call died" error.
    #[must_use]
    pub fn died(msg: impl Into<String>) -> Self {
        Self::Died(msg.into())
    }

    /// Creates a fatal error.
    #[must_use]
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// The bare discriminant.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Clean(_) => ErrorKind::Clean,
            Self::Transient(_) => ErrorKind::Transient,
            Self::Identity(_) => ErrorKind::Identity,
            Self::Corruption(_) => ErrorKind::Corruption,
            Self::Died(_) => ErrorKind::Died,
            Self::Fatal(_) => ErrorKind::Fatal,
        }
    }

    /// True when this mediator must stop taking calls.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::Fatal(_))
    }

    /// The threshold bucket this error counts against, if any.
    #[must_use]
    pub const fn category(&self) -> Option<ErrorCategory> {
        match self {
            Self::Transient(_) | Self::Identity(_) => Some(ErrorCategory::Communication),
            Self::Corruption(_) => Some(ErrorCategory::Corruption),
            Self::Died(_) => Some(ErrorCategory::Timeout),
            _ => None,
        }
    }
}

impl From<IpcError> for WorkerError {
    fn from(e: IpcError) -> Self {
        match &e {
            IpcError::Transient(_)
            | IpcError::StoreFull { .. }
            | IpcError::DirectoryFull(_) => Self::Transient(e.to_string()),
            IpcError::Identity(_) => Self::Identity(e.to_string()),
            IpcError::Corrupt(_) | IpcError::MissingSlot(_) => Self::Corruption(e.to_string()),
            IpcError::Invalid(_) => Self::Validation(e.to_string()),
            IpcError::Setup(_) | IpcError::Io(_) => Self::Fatal(e.to_string()),
        }
    }
}

/// Discriminants of [`WorkerError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// `validation`
    Validation,
    /// `clean`
    Clean,
    /// `transient`
    Transient,
    /// `identity`
    Identity,
    /// `corruption`
    Corruption,
    /// `died`
    Died,
    /// `fatal`
    Fatal,
}

/// Buckets whose counts are bounded per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Queue/segment trouble: transient and identity errors.
    Communication,
    /// Payload round-trip failures.
    Corruption,
    /// Calls lost to dead children.
    Timeout,
}

const CATEGORIES: usize = 3;

/// Bounded per-category error accounting.
///
/// Workers run with a bound of 10, the parent with 25; crossing the
/// bound turns the next count into a fatal error for this mediator.
#[derive(Debug, Clone)]
pub struct ErrorCounters {
    bound: u32,
    counts: [u32; CATEGORIES],
}

impl ErrorCounters {
    /// Creates counters with the given per-category bound.
    #[must_use]
    pub const fn new(bound: u32) -> Self {
        Self {
            bound,
            counts: [0; CATEGORIES],
        }
    }

    /// Records one error in `category`.
    ///
    /// # Errors
    /// Fatal once the category's count exceeds the bound.
    pub fn count(&mut self, category: ErrorCategory) -> Result<()> {
        let slot = &mut self.counts[category as usize];
        *slot += 1;
        if *slot > self.bound {
            return Err(WorkerError::fatal(format!(
                "{category:?} error count {} exceeded bound {}",
                *slot, self.bound
            )));
        }
        Ok(())
    }

    /// Current count for `category`.
    #[must_use]
    pub const fn get(&self, category: ErrorCategory) -> u32 {
        self.counts[category as usize]
    }

    /// Zeroes every category.
    pub fn reset(&mut self) {
        self.counts = [0; CATEGORIES];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_map_per_taxonomy() {
        assert_eq!(
            WorkerError::transient("x").category(),
            Some(ErrorCategory::Communication)
        );
        assert_eq!(
            WorkerError::Identity("x".into()).category(),
            Some(ErrorCategory::Communication)
        );
        assert_eq!(
            WorkerError::Corruption("x".into()).category(),
            Some(ErrorCategory::Corruption)
        );
        assert_eq!(
            WorkerError::died("x").category(),
            Some(ErrorCategory::Timeout)
        );
        assert_eq!(WorkerError::clean("x").category(), None);
        assert_eq!(WorkerError::fatal("x").category(), None);
    }

    #[test]
    fn counters_trip_past_bound() {
        let mut counters = ErrorCounters::new(3);
        for _ in 0..3 {
            counters.count(ErrorCategory::Corruption).unwrap();
        }
        assert_eq!(counters.get(ErrorCategory::Corruption), 3);
        let err = counters.count(ErrorCategory::Corruption).unwrap_err();
        assert!(err.is_fatal());
        // Other categories are unaffected.
        counters.count(ErrorCategory::Timeout).unwrap();
    }

    #[test]
    fn ipc_errors_convert() {
        let e = WorkerError::from(IpcError::Transient("busy".into()));
        assert_eq!(e.kind(), ErrorKind::Transient);
        let e = WorkerError::from(IpcError::Identity("gone".into()));
        assert_eq!(e.kind(), ErrorKind::Identity);
        let e = WorkerError::from(IpcError::Corrupt("mangled".into()));
        assert_eq!(e.kind(), ErrorKind::Corruption);
        let e = WorkerError::from(IpcError::Setup("nope".into()));
        assert!(e.is_fatal());
    }

    #[test]
    fn clean_renders_bare() {
        assert_eq!(WorkerError::clean("declined").to_string(), "declined");
    }
}
