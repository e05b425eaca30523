// Unsafe is confined to this crate: raw shared memory and pthread
// primitives live here so the core and worker crates can deny it.
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

//! # stoker-ipc
//!
//! The inter-process channel the stoker mediator runs over. Three
//! cooperating pieces, all named off a stable token derived from the
//! daemon binary and the worker alias:
//!
//! - a process-shared robust **lock** ([`ShmLock`]) guarding the store,
//! - an indexed **payload store** ([`PayloadStore`]) in shared memory,
//!   addressed by call id,
//! - typed **header queues** ([`HeaderQueue`]) carrying fixed-width
//!   `{id, status, time, pid}` records, one POSIX message queue per
//!   type so FIFO order holds per type.
//!
//! [`PosixChannel`] composes the three behind the [`Transport`] trait;
//! the parent and every forked worker attach to the same objects by
//! re-deriving the [`Guid`].

#![warn(missing_docs)]

pub mod error;
pub mod guid;
pub mod lock;
pub mod queue;
pub mod shm;
pub mod store;
pub mod transport;

pub use error::{IpcError, Result};
pub use guid::Guid;
pub use lock::{LockGuard, ShmLock};
pub use queue::{Header, HeaderQueue, MessageType, HEADER_LEN};
pub use shm::{ShmMode, ShmSegment};
pub use store::{PayloadStore, FIRST_CALL_SLOT, RESERVED_SLOT, SLOT_CAP};
pub use transport::{
    backoff_delay, Frame, PosixChannel, Role, Transport, DEFAULT_STORE_SIZE, PROTOCOL_VERSION,
};
