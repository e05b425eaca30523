//! Stoker: supervised multi-process daemons on POSIX hosts.
//!
//! A daemon author implements one per-tick hook; the framework owns
//! the main loop, signal plumbing, supervised forked workers, and the
//! remote-method layer that calls worker operations in children over a
//! shared-memory call buffer.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use serde_json::json;
//! use stoker::prelude::*;
//!
//! struct Ticker {
//!     echo: Mediator,
//! }
//!
//! impl Lifecycle for Ticker {
//!     fn execute(&mut self, ctx: &mut EventCtx<'_>) -> stoker::core::Result<()> {
//!         if ctx.daemon.loop_iterations == 1 {
//!             let _ = self.echo.call("echo", vec![json!("hello")]).then(
//!                 |value| {
//!                     println!("worker said {value}");
//!                     Chained::Value(value)
//!                 },
//!                 Chained::Error,
//!             );
//!         }
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = DaemonConfig::new("hello")
//!         .with_loop_interval(std::time::Duration::from_millis(200));
//!     let mut daemon = Daemon::new(config)?;
//!     daemon.init()?;
//!
//!     let registry = WorkerRegistry::new()
//!         .operation("echo", |args| Ok(args.first().cloned().unwrap_or_default()))?;
//!     let echo = Mediator::attach(&mut daemon, registry, MediatorConfig::new("echo"))?;
//!
//!     let mut ticker = Ticker { echo };
//!     daemon.run(&mut ticker)?;
//!     Ok(())
//! }
//! ```

pub use stoker_core as core;
pub use stoker_ipc as ipc;
pub use stoker_worker as worker;

/// Prelude module for common imports.
pub mod prelude {
    pub use stoker_core::{
        Daemon, DaemonConfig, DaemonInfo, DaemonState, Event, EventCtx, EventName, Flow,
        Lifecycle, LogLevel,
    };
    pub use stoker_worker::{
        Chained, ForkStrategy, Mediator, MediatorConfig, Promise, Settled, WorkerRegistry,
    };
}
