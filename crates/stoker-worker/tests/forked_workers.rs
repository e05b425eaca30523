//! End-to-end scenarios over the real POSIX channel with real forked
//! workers. Serialized: every daemon here reaps with `waitpid(-1)`,
//! which collects any child of the test process.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::{json, Value};

use stoker_core::{Daemon, DaemonConfig, EventCtx, Lifecycle};
use stoker_worker::{Mediator, MediatorConfig, Promise, Settled, WorkerRegistry};

static FORK_TESTS: Mutex<()> = Mutex::new(());

/// Issues a batch of calls on the first tick, then idles until every
/// promise settles (or the tick budget runs out).
struct CallDriver {
    mediator: Mediator,
    to_issue: Vec<(String, Vec<Value>)>,
    promises: Vec<Promise>,
    max_ticks: u64,
}

impl CallDriver {
    fn new(mediator: Mediator, calls: Vec<(&str, Vec<Value>)>) -> Self {
        Self {
            mediator,
            to_issue: calls
                .into_iter()
                .map(|(m, a)| (m.to_string(), a))
                .collect(),
            promises: Vec::new(),
            max_ticks: 100,
        }
    }
}

impl Lifecycle for CallDriver {
    fn execute(&mut self, ctx: &mut EventCtx<'_>) -> stoker_core::Result<()> {
        if ctx.daemon.loop_iterations == 1 {
            for (method, args) in self.to_issue.drain(..) {
                self.promises.push(self.mediator.call(&method, args));
            }
            return Ok(());
        }
        if self.promises.iter().all(Promise::is_settled)
            || ctx.daemon.loop_iterations >= self.max_ticks
        {
            ctx.request_shutdown();
        }
        Ok(())
    }
}

fn fulfilled(promise: &Promise) -> Option<Value> {
    match promise.state() {
        Some(Settled::Fulfilled(v)) => Some(v),
        _ => None,
    }
}

fn rejected(promise: &Promise) -> Option<String> {
    match promise.state() {
        Some(Settled::Rejected(e)) => Some(e.to_string()),
        _ => None,
    }
}

fn echo_registry() -> WorkerRegistry {
    WorkerRegistry::new()
        .operation("echo", |args| {
            Ok(args.first().cloned().unwrap_or(Value::Null))
        })
        .unwrap()
        .operation("die", |_| std::process::exit(9))
        .unwrap()
}

/// Unique per test run so parallel `cargo test` invocations on the
/// same host never share kernel objects.
fn alias(tag: &str) -> String {
    format!("{tag}{}", std::process::id() % 10_000)
}

#[test]
fn echo_worker_round_trip() {
    let _serial = FORK_TESTS.lock().unwrap();
    let config = DaemonConfig::new("echo-e2e").with_loop_interval(Duration::from_millis(100));
    let mut daemon = Daemon::new(config).unwrap();
    daemon.init().unwrap();

    let mediator = Mediator::attach(
        &mut daemon,
        echo_registry(),
        MediatorConfig::new(alias("echo")).with_max_processes(1),
    )
    .unwrap();

    let mut driver = CallDriver::new(mediator.clone(), vec![("echo", vec![json!("hi")])]);
    daemon.run(&mut driver).unwrap();

    assert_eq!(fulfilled(&driver.promises[0]), Some(json!("hi")));
    assert_eq!(mediator.active_calls(), 0);
    let recent = mediator.recent();
    assert_eq!(recent.last().unwrap().method, "echo");
    assert_eq!(recent.last().unwrap().status, "returned");
    assert_eq!(daemon.procs().count(None), 0);
}

#[test]
fn workers_recycle_across_many_calls() {
    let _serial = FORK_TESTS.lock().unwrap();
    let config = DaemonConfig::new("recycle-e2e").with_loop_interval(Duration::from_millis(100));
    let mut daemon = Daemon::new(config).unwrap();
    daemon.init().unwrap();

    let mediator_config = MediatorConfig::new(alias("recycle"))
        .with_max_processes(2)
        .with_auto_restart(true)
        .with_max_calls_per_child(3)
        .with_runtime_bounds(Duration::ZERO, Duration::from_secs(3600));
    let mediator =
        Mediator::attach(&mut daemon, echo_registry(), mediator_config).unwrap();

    let calls: Vec<(&str, Vec<Value>)> = (0..10).map(|i| ("echo", vec![json!(i)])).collect();
    let mut driver = CallDriver::new(mediator.clone(), calls);
    daemon.run(&mut driver).unwrap();

    for (i, promise) in driver.promises.iter().enumerate() {
        assert_eq!(
            fulfilled(promise),
            Some(json!(i)),
            "call {i} should have resolved"
        );
    }

    // Recycling at <=3 calls per child means several distinct pids
    // serviced the batch.
    let pids: HashSet<i32> = mediator
        .recent()
        .iter()
        .filter(|s| s.status == "returned")
        .map(|s| s.pid)
        .collect();
    assert!(
        pids.len() >= 3,
        "expected at least 3 worker pids, saw {pids:?}"
    );
    assert!(daemon.procs().count(None) <= 2);
}

#[test]
fn premature_death_rejects_the_call() {
    let _serial = FORK_TESTS.lock().unwrap();
    let config = DaemonConfig::new("mortal-e2e").with_loop_interval(Duration::from_millis(100));
    let mut daemon = Daemon::new(config).unwrap();
    daemon.init().unwrap();

    let mediator = Mediator::attach(
        &mut daemon,
        echo_registry(),
        MediatorConfig::new(alias("mortal")).with_max_processes(1),
    )
    .unwrap();

    let mut driver = CallDriver::new(mediator.clone(), vec![("die", vec![])]);
    daemon.run(&mut driver).unwrap();

    let message = rejected(&driver.promises[0]).expect("the call must be rejected");
    assert!(message.contains("died"), "unexpected rejection: {message}");
    assert_eq!(mediator.recent().last().unwrap().status, "timeout");
    assert_eq!(mediator.active_calls(), 0);
}

#[test]
fn sigterm_ends_the_loop_gracefully() {
    let _serial = FORK_TESTS.lock().unwrap();
    let config = DaemonConfig::new("term-e2e").with_loop_interval(Duration::from_millis(50));
    let mut daemon = Daemon::new(config).unwrap();
    daemon.init().unwrap();

    let mediator = Mediator::attach(
        &mut daemon,
        echo_registry(),
        MediatorConfig::new(alias("term")).with_max_processes(1),
    )
    .unwrap();

    // Raise SIGTERM from inside the second tick, like an operator would
    // from outside.
    struct TermDriver {
        executed: u64,
    }
    impl Lifecycle for TermDriver {
        fn execute(&mut self, _ctx: &mut EventCtx<'_>) -> stoker_core::Result<()> {
            self.executed += 1;
            if self.executed == 2 {
                nix::sys::signal::raise(nix::sys::signal::Signal::SIGTERM).ok();
            }
            Ok(())
        }
    }

    let mut driver = TermDriver { executed: 0 };
    daemon.run(&mut driver).unwrap();

    // The tick that raised the signal finished; no further tick ran,
    // and every worker was torn down.
    assert_eq!(driver.executed, 2);
    assert!(daemon.is_shutdown());
    assert_eq!(daemon.procs().count(None), 0);
    assert!(mediator.fatal_error().is_none());
}
