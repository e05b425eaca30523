// Allow unwrap/expect in tests for clear failure messages
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

//! # stoker-worker
//!
//! The request/response fabric between a stoker daemon and its forked
//! workers:
//!
//! - [`Call`]: one remote invocation — id, method, arguments, a status
//!   machine, and per-status timestamps
//! - [`Promise`]: the parent-side settled-once result handle
//! - [`WorkerRegistry`]: the named operation table a worker declares
//!   up front (no reflection; the inline path hits the same table)
//! - [`Mediator`]: the per-alias coordinator — forks workers per a
//!   [`ForkStrategy`], writes calls into the shared payload store,
//!   drains acks and returns every tick, detects premature child
//!   deaths, and recycles long-lived workers
//!
//! Everything is single-threaded and cooperative; the only
//! cross-process surfaces are the transport and POSIX signals.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod call;
pub mod error;
pub mod mediator;
pub mod promise;
pub mod registry;
pub mod strategy;
pub mod testing;

pub use call::{Call, CallId, CallStatus};
pub use error::{ErrorCategory, ErrorCounters, ErrorKind, Result, WorkerError};
pub use mediator::{CallSummary, Mediator, MediatorConfig};
pub use promise::{Chained, Promise, Settled};
pub use registry::{WorkerRegistry, DEFAULT_OP};
pub use strategy::ForkStrategy;
