// Demos are allowed to use expect/unwrap for simplicity
#![allow(clippy::expect_used, clippy::unwrap_used)]

//! Echo daemon demo.
//!
//! One worker child, one operation. The daemon ticks five times a
//! second, sends the worker a message every 10th tick, and prints the
//! reply when the promise settles.
//!
//! ```bash
//! cargo run --example echo-daemon
//! # Ctrl+C (or SIGTERM) stops it gracefully.
//! ```

use std::time::Duration;

use serde_json::json;
use stoker::prelude::*;

struct EchoApp {
    echo: Mediator,
    sent: u64,
}

impl Lifecycle for EchoApp {
    fn execute(&mut self, ctx: &mut EventCtx<'_>) -> stoker::core::Result<()> {
        if ctx.daemon.loop_iterations % 10 != 1 {
            return Ok(());
        }
        self.sent += 1;
        let n = self.sent;
        let _ = self
            .echo
            .call("echo", vec![json!(format!("message {n}"))])
            .then(
                move |value| {
                    println!("[{n}] worker replied: {value}");
                    Chained::Value(value)
                },
                move |err| {
                    eprintln!("[{n}] call failed: {err}");
                    Chained::Error(err)
                },
            );
        Ok(())
    }

    fn teardown(&mut self, _ctx: &mut EventCtx<'_>) {
        println!("echo daemon: {} messages sent, shutting down", self.sent);
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = DaemonConfig::new("echo-daemon")
        .with_loop_interval(Duration::from_millis(200));
    let mut daemon = Daemon::new(config)?;
    daemon.init()?;

    let registry = WorkerRegistry::new()
        .operation("echo", |args| {
            Ok(args.first().cloned().unwrap_or_default())
        })?
        .with_setup(|| println!("echo worker {} online", std::process::id()));

    let echo = Mediator::attach(
        &mut daemon,
        registry,
        MediatorConfig::new("echo").with_max_processes(1),
    )?;

    println!("echo daemon running, pid {}", daemon.info().pid);
    let mut app = EchoApp { echo, sent: 0 };
    daemon.run(&mut app)?;
    Ok(())
}
