//! Error types for the IPC transport.

use nix::errno::Errno;

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, IpcError>;

/// Failure modes of the shared-memory/queue transport.
///
/// The variants mirror how the mediator reacts to them: `Transient`
/// errors are retried with back-off, `Identity` errors trigger a
/// reattach, `Corrupt` errors trigger the store self-test, and the rest
/// are surfaced to the caller unchanged.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// Attaching the lock, store, or queues failed.
    #[error("transport setup failed: {0}")]
    Setup(String),

    /// The operation would block or was interrupted; safe to retry.
    #[error("transient transport error: {0}")]
    Transient(String),

    /// The underlying queue or segment was destroyed out from under us.
    #[error("transport identity lost: {0}")]
    Identity(String),

    /// A payload failed to round-trip through the store.
    #[error("payload corruption: {0}")]
    Corrupt(String),

    /// The payload store has no extent large enough for the record.
    #[error("payload store full: need {need} bytes, {free} contiguous free")]
    StoreFull {
        /// Bytes required by the record being written.
        need: usize,
        /// Largest contiguous free extent observed.
        free: usize,
    },

    /// No directory entry exists for the requested slot.
    #[error("no payload slot for id {0}")]
    MissingSlot(u64),

    /// The slot directory is out of entries.
    #[error("payload slot directory exhausted ({0} entries)")]
    DirectoryFull(usize),

    /// Caller error: bad name, bad size, operation before `setup`.
    #[error("invalid transport argument: {0}")]
    Invalid(String),

    /// I/O error from the OS.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl IpcError {
    /// Wraps an OS errno in the variant the mediator's retry logic expects.
    ///
    /// `EAGAIN`/`EINTR`/`ETIMEDOUT` mean "try again shortly"; `EIDRM`,
    /// `ENOENT` and `EINVAL` on an already-attached object mean the
    /// other side (or an operator) destroyed it and we must reattach.
    #[must_use]
    pub fn from_errno(errno: Errno, what: &str) -> Self {
        match errno {
            Errno::EAGAIN | Errno::EINTR | Errno::ETIMEDOUT => {
                Self::Transient(format!("{what}: {errno}"))
            }
            Errno::EIDRM | Errno::ENOENT | Errno::EINVAL => {
                Self::Identity(format!("{what}: {errno}"))
            }
            _ => Self::Io(std::io::Error::from_raw_os_error(errno as i32)),
        }
    }

    /// True when a short back-off and retry may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// True when the queue/segment identity is gone and the caller
    /// should reattach before retrying.
    #[must_use]
    pub const fn is_identity(&self) -> bool {
        matches!(self, Self::Identity(_))
    }

    /// True when the payload store returned bytes that do not decode.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(self, Self::Corrupt(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_classification() {
        assert!(IpcError::from_errno(Errno::EAGAIN, "recv").is_transient());
        assert!(IpcError::from_errno(Errno::EINTR, "recv").is_transient());
        assert!(IpcError::from_errno(Errno::EIDRM, "recv").is_identity());
        assert!(IpcError::from_errno(Errno::EINVAL, "send").is_identity());
        assert!(!IpcError::from_errno(Errno::EACCES, "open").is_transient());
    }

    #[test]
    fn display_messages() {
        let err = IpcError::StoreFull { need: 64, free: 8 };
        assert!(err.to_string().contains("need 64"));
        assert_eq!(
            IpcError::MissingSlot(7).to_string(),
            "no payload slot for id 7"
        );
    }
}
