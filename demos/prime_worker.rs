// Demos are allowed to use expect/unwrap for simplicity
#![allow(clippy::expect_used, clippy::unwrap_used)]

//! Prime-counting worker pool demo.
//!
//! Fans CPU-bound range scans out to a pool of recycling workers and
//! folds the answers back in as promises settle. Shows worker
//! recycling (`auto_restart` + a small per-child call budget) and the
//! aggressive forking strategy.
//!
//! ```bash
//! cargo run --example prime-worker
//! ```

use std::time::Duration;

use serde_json::json;
use stoker::prelude::*;

fn primes_in(lo: u64, hi: u64) -> u64 {
    (lo.max(2)..hi)
        .filter(|&n| {
            let mut d = 2;
            while d * d <= n {
                if n % d == 0 {
                    return false;
                }
                d += 1;
            }
            true
        })
        .count() as u64
}

struct PrimeApp {
    pool: Mediator,
    next_lo: u64,
    outstanding: Vec<Promise>,
    batches: u32,
}

impl Lifecycle for PrimeApp {
    fn execute(&mut self, ctx: &mut EventCtx<'_>) -> stoker::core::Result<()> {
        // Keep four scans in flight until we have dispatched 20 batches.
        while self.batches < 20 && self.outstanding.len() < 4 {
            let (lo, hi) = (self.next_lo, self.next_lo + 50_000);
            self.next_lo = hi;
            self.batches += 1;
            let promise = self.pool.call("count", vec![json!(lo), json!(hi)]);
            let _ = promise.then(
                move |value| {
                    println!("[{lo:>8}..{hi:>8}) -> {value} primes");
                    Chained::Value(value)
                },
                move |err| {
                    eprintln!("[{lo:>8}..{hi:>8}) failed: {err}");
                    Chained::Error(err)
                },
            );
            self.outstanding.push(promise);
        }
        self.outstanding.retain(|p| !p.is_settled());

        if self.batches >= 20 && self.outstanding.is_empty() {
            println!("all batches done");
            ctx.request_shutdown();
        }
        Ok(())
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = DaemonConfig::new("prime-daemon")
        .with_loop_interval(Duration::from_millis(100));
    let mut daemon = Daemon::new(config)?;
    daemon.init()?;

    let registry = WorkerRegistry::new().operation("count", |args| {
        let lo = args.first().and_then(|v| v.as_u64()).ok_or("lo missing")?;
        let hi = args.get(1).and_then(|v| v.as_u64()).ok_or("hi missing")?;
        Ok(json!(primes_in(lo, hi)))
    })?;

    let pool = Mediator::attach(
        &mut daemon,
        registry,
        MediatorConfig::new("primes")
            .with_max_processes(4)
            .with_strategy(ForkStrategy::Aggressive)
            .with_auto_restart(true)
            .with_max_calls_per_child(8)
            .with_runtime_bounds(Duration::from_secs(1), Duration::from_secs(600)),
    )?;

    let mut app = PrimeApp {
        pool,
        next_lo: 0,
        outstanding: Vec::new(),
        batches: 0,
    };
    daemon.run(&mut app)?;
    Ok(())
}
