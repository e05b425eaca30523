// Allow unwrap/expect in tests for clear failure messages
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

//! # stoker-core
//!
//! Lifecycle primitives for supervised, multi-process daemons:
//!
//! - [`Daemon`]: the fixed-cadence main loop with signal-driven
//!   interrupts, idle dispatch, auto-restart, and graceful teardown
//! - [`Lifecycle`]: the trait a daemon author implements (one
//!   `execute` per tick)
//! - [`Bus`]/[`Event`]: the synchronous publish/subscribe fabric that
//!   cross-wires the scheduler, mediators, and plugins
//! - [`ProcessTable`]: fork bookkeeping, `SIGCHLD` reaping, teardown
//! - [`LogChannel`]: a write-through file log that survives rotation
//!
//! The daemon is an explicit value, not a process-wide singleton:
//! construct it at program start and thread it into whatever needs it.

// Unsafe appears only where POSIX demands it: fork(2), sigaction(2),
// nanosleep(2).
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
#[allow(unsafe_code)]
pub mod daemon;
pub mod error;
pub mod event;
pub mod log;
#[allow(unsafe_code)]
pub mod process;
#[allow(unsafe_code)]
pub mod signals;
#[cfg(test)]
mod tests;

pub use config::{DaemonConfig, MIN_AUTO_RESTART_INTERVAL};
pub use daemon::{Daemon, DaemonInfo, DaemonState, Lifecycle, DAEMONIZED_ENV};
pub use error::{CoreError, Result};
pub use event::{
    Bus, CtxRequests, Dispatch, Event, EventCtx, EventName, Flow, LogLevel, ReapedChild,
    StatsReport, SubscriberId,
};
pub use log::LogChannel;
pub use process::{
    EndedProcess, ExitKind, Forked, Process, ProcessTable, MIN_PROCESS_TIMEOUT, TASK_GROUP,
};
pub use signals::SignalWatcher;
