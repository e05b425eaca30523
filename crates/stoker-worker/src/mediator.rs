//! The worker mediator.
//!
//! One mediator per worker alias. The parent side keeps the table of
//! active calls, forks workers per its strategy, drains RUNNING and
//! RETURN headers every tick, reconciles dead children, and settles
//! promises. The child side is [`MediatorCore::child_main`]: attach,
//! run the registry's setup hook, then serve CALL headers until the
//! recycle policy says to exit.
//!
//! The mediator wires itself onto the daemon's bus at attach time:
//! `pre_execute` drains acks and returns, `post_execute` reconciles
//! the per-tick reaped pids and runs a fork pass, `reaped` queues
//! pids, `idle` throttles call GC, `stats` exports a snapshot, and
//! `shutdown` removes the kernel objects.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use stoker_core::{Daemon, Event, EventCtx, EventName, Flow, Forked};
use stoker_ipc::{
    Frame, Guid, IpcError, MessageType, PosixChannel, Role, Transport, DEFAULT_STORE_SIZE,
};

use crate::call::{Call, CallId, CallStatus};
use crate::error::{ErrorCategory, ErrorCounters, Result, WorkerError};
use crate::promise::Promise;
use crate::registry::WorkerRegistry;
use crate::strategy::ForkStrategy;

/// Finished-call summaries kept for statistics.
const RECENT_CAP: usize = 32;

/// Minimum spacing between idle-time call GC passes.
const GC_INTERVAL: Duration = Duration::from_secs(30);

/// Child yield between polls when it may not block.
const CHILD_POLL: Duration = Duration::from_millis(20);

/// Key of the error sentinel a child embeds in a failed call's result.
const ERROR_SENTINEL: &str = "__error__";

/// Consecutive fork failures tolerated before the mediator goes fatal.
const FORK_FAILURE_LIMIT: u32 = 3;

/// Configuration of one mediator.
#[derive(Debug, Clone)]
pub struct MediatorConfig {
    /// The worker alias; names the process group and the IPC token.
    pub alias: String,
    /// Forking strategy; derived from the loop interval when `None`.
    pub strategy: Option<ForkStrategy>,
    /// Upper bound on live workers (1..=25).
    pub max_processes: u32,
    /// Calls a child serves before recycling (jittered ±25%).
    pub max_calls_per_child: u32,
    /// A child never recycles on call count before running this long.
    pub min_runtime: Duration,
    /// A child recycles after running this long (jittered ±25%).
    pub max_runtime: Duration,
    /// Enable worker recycling.
    pub auto_restart: bool,
    /// Let children `SIGALRM` the parent out of its sleep on returns.
    pub allow_wakeup: bool,
    /// Payload store size in bytes.
    pub store_size: usize,
    /// Shutdown timeout per worker (floored at 60 s by the table).
    pub process_timeout: Duration,
    /// Per-category error bound inside a child.
    pub worker_error_bound: u32,
    /// Per-category error bound in the parent.
    pub parent_error_bound: u32,
}

impl MediatorConfig {
    /// Defaults for `alias`: one worker, recycling off, 5 MiB store.
    #[must_use]
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            strategy: None,
            max_processes: 1,
            max_calls_per_child: 1024,
            min_runtime: Duration::from_secs(30),
            max_runtime: Duration::from_secs(3600),
            auto_restart: false,
            allow_wakeup: true,
            store_size: DEFAULT_STORE_SIZE,
            process_timeout: Duration::from_secs(60),
            worker_error_bound: 10,
            parent_error_bound: 25,
        }
    }

    /// Sets the worker bound.
    #[must_use]
    pub const fn with_max_processes(mut self, max: u32) -> Self {
        self.max_processes = max;
        self
    }

    /// Pins the forking strategy.
    #[must_use]
    pub const fn with_strategy(mut self, strategy: ForkStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Sets the per-child call budget and enables recycling.
    #[must_use]
    pub const fn with_max_calls_per_child(mut self, calls: u32) -> Self {
        self.max_calls_per_child = calls;
        self
    }

    /// Sets the per-child runtime window.
    #[must_use]
    pub const fn with_runtime_bounds(mut self, min: Duration, max: Duration) -> Self {
        self.min_runtime = min;
        self.max_runtime = max;
        self
    }

    /// Enables or disables worker recycling.
    #[must_use]
    pub const fn with_auto_restart(mut self, on: bool) -> Self {
        self.auto_restart = on;
        self
    }

    /// Enables or disables the SIGALRM wakeup.
    #[must_use]
    pub const fn with_allow_wakeup(mut self, on: bool) -> Self {
        self.allow_wakeup = on;
        self
    }

    /// Sets the payload store size (before attach).
    #[must_use]
    pub const fn with_store_size(mut self, bytes: usize) -> Self {
        self.store_size = bytes;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Names the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.alias.is_empty()
            || self.alias.len() > 32
            || !self
                .alias
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(WorkerError::validation(format!(
                "alias {:?} must be a short identifier",
                self.alias
            )));
        }
        if !(1..=25).contains(&self.max_processes) {
            return Err(WorkerError::validation(format!(
                "max_processes {} outside 1..=25",
                self.max_processes
            )));
        }
        if self.max_calls_per_child == 0 {
            return Err(WorkerError::validation("max_calls_per_child must be nonzero"));
        }
        if self.min_runtime > self.max_runtime {
            return Err(WorkerError::validation(format!(
                "min_runtime {:?} exceeds max_runtime {:?}",
                self.min_runtime, self.max_runtime
            )));
        }
        if self.worker_error_bound == 0 || !(1..=50).contains(&self.parent_error_bound) {
            return Err(WorkerError::validation("error bounds must be 1..=50"));
        }
        Ok(())
    }
}

/// A finished call, condensed for the statistics ring.
#[derive(Debug, Clone)]
pub struct CallSummary {
    /// The call id.
    pub id: CallId,
    /// The operation name.
    pub method: String,
    /// The terminal status name.
    pub status: &'static str,
    /// The child that serviced it (zero when none did).
    pub pid: i32,
    /// Seconds from submission to settlement, when both ends are known.
    pub duration_secs: f64,
}

struct MediatorCore {
    config: MediatorConfig,
    strategy: ForkStrategy,
    registry: WorkerRegistry,
    transport: Box<dyn Transport>,
    calls: HashMap<CallId, Call>,
    running: HashMap<CallId, f64>,
    recent: VecDeque<CallSummary>,
    reaped: VecDeque<i32>,
    counters: ErrorCounters,
    fork_failures: u32,
    last_gc: Instant,
    fatal: Option<WorkerError>,
}

/// Handle to an attached mediator. Clones share the same state.
#[derive(Clone)]
pub struct Mediator {
    core: Rc<RefCell<MediatorCore>>,
}

impl Mediator {
    /// Attaches a mediator for `config.alias` to `daemon` over the
    /// real POSIX channel: derives the guid, purges residual state,
    /// subscribes to the bus, and performs the initial fork pass.
    ///
    /// # Errors
    /// Validation or transport setup failures.
    pub fn attach(
        daemon: &mut Daemon,
        registry: WorkerRegistry,
        config: MediatorConfig,
    ) -> Result<Self> {
        let exe = std::env::current_exe()
            .map_err(|e| WorkerError::fatal(format!("current_exe: {e}")))?;
        let guid = Guid::derive(&exe, &config.alias)?;
        let token = guid.token();
        let mut transport: Box<dyn Transport> = Box::new(PosixChannel::new(guid));
        transport
            .set_store_size(config.store_size)
            .map_err(WorkerError::from)?;
        Self::attach_with_transport(daemon, registry, config, transport, token)
    }

    /// Attaches over a caller-supplied transport. This is the seam the
    /// tests drive an in-memory channel through.
    ///
    /// # Errors
    /// Validation or transport setup failures.
    pub fn attach_with_transport(
        daemon: &mut Daemon,
        registry: WorkerRegistry,
        config: MediatorConfig,
        mut transport: Box<dyn Transport>,
        token: u32,
    ) -> Result<Self> {
        config.validate()?;
        if registry.is_empty() {
            return Err(WorkerError::validation(format!(
                "worker {:?} declares no operations",
                config.alias
            )));
        }
        transport.setup(Role::Parent)?;
        // A previous incarnation of this daemon may have left calls
        // behind under the same token.
        transport.purge()?;
        daemon.publish(Event::GenerateGuid {
            alias: config.alias.clone(),
            token,
        });

        let strategy = config
            .strategy
            .unwrap_or_else(|| ForkStrategy::for_interval(daemon.info().loop_interval));
        let parent_bound = config.parent_error_bound;
        let core = Rc::new(RefCell::new(MediatorCore {
            strategy,
            registry,
            transport,
            calls: HashMap::new(),
            running: HashMap::new(),
            recent: VecDeque::new(),
            reaped: VecDeque::new(),
            counters: ErrorCounters::new(parent_bound),
            fork_failures: 0,
            last_gc: Instant::now(),
            fatal: None,
            config,
        }));

        {
            let core = Rc::clone(&core);
            daemon.subscribe(EventName::PreExecute, 0, move |ctx, _| {
                core.borrow_mut().on_pre_execute(ctx);
                Flow::Continue
            });
        }
        {
            let core = Rc::clone(&core);
            daemon.subscribe(EventName::PostExecute, 0, move |ctx, _| {
                core.borrow_mut().on_post_execute(ctx);
                Flow::Continue
            });
        }
        {
            let core = Rc::clone(&core);
            daemon.subscribe(EventName::Reaped, 0, move |_, event| {
                if let Event::Reaped { children } = event {
                    core.borrow_mut().on_reaped(children);
                }
                Flow::Continue
            });
        }
        {
            let core = Rc::clone(&core);
            daemon.subscribe(EventName::Idle, 0, move |_, _| {
                core.borrow_mut().on_idle();
                Flow::Continue
            });
        }
        {
            let core = Rc::clone(&core);
            daemon.subscribe(EventName::Stats, 0, move |ctx, event| {
                if let Event::Stats { report } = event {
                    let snapshot = core.borrow().stats_with_procs(ctx);
                    report.push(snapshot);
                }
                Flow::Continue
            });
        }
        {
            let core = Rc::clone(&core);
            daemon.subscribe(EventName::Shutdown, 0, move |_, _| {
                core.borrow_mut().transport.teardown();
                Flow::Continue
            });
        }

        daemon.with_ctx(|ctx| core.borrow_mut().fork_pass(ctx));
        Ok(Self { core })
    }

    /// The worker alias.
    #[must_use]
    pub fn alias(&self) -> String {
        self.core.borrow().config.alias.clone()
    }

    /// Issues an asynchronous call; the returned promise settles when
    /// the worker returns (or the call is lost).
    pub fn call(&self, method: &str, args: Vec<Value>) -> Promise {
        self.core.borrow_mut().issue(method, args)
    }

    /// Invokes the operation on the current process, bypassing IPC.
    ///
    /// # Errors
    /// The handler's own failure, as a clean error.
    pub fn inline(&self, method: &str, args: &[Value]) -> Result<Value> {
        self.core
            .borrow()
            .registry
            .invoke(method, args)
            .map_err(WorkerError::clean)
    }

    /// Cancels a call that no child has picked up yet.
    ///
    /// # Errors
    /// Unknown id, or the call is already running/terminal.
    pub fn cancel(&self, id: CallId) -> Result<()> {
        self.core.borrow_mut().cancel(id)
    }

    /// `SIGKILL`s one worker (or all of this alias's workers).
    ///
    /// # Errors
    /// Kill failures; unknown pids are skipped silently.
    pub fn kill(&self, daemon: &mut Daemon, pid: Option<i32>) -> Result<usize> {
        let alias = self.alias();
        let targets: Vec<i32> = match pid {
            Some(pid) => vec![pid],
            None => daemon.procs().pids(&alias),
        };
        let mut killed = 0;
        for target in targets {
            if daemon.procs().find(target, Some(&alias)).is_some() {
                daemon
                    .procs_mut()
                    .kill(target, nix::sys::signal::Signal::SIGKILL)
                    .map_err(|e| WorkerError::fatal(e.to_string()))?;
                killed += 1;
            }
        }
        Ok(killed)
    }

    /// Resubmits a tracked call under its original id.
    ///
    /// # Errors
    /// Unknown id or transport failures.
    pub fn retry(&self, id: CallId) -> Result<Promise> {
        self.core.borrow_mut().retry(id)
    }

    /// Number of active (unsettled) calls.
    #[must_use]
    pub fn active_calls(&self) -> usize {
        self.core.borrow().calls.len()
    }

    /// The finished-call ring, most recent last.
    #[must_use]
    pub fn recent(&self) -> Vec<CallSummary> {
        self.core.borrow().recent.iter().cloned().collect()
    }

    /// The fatal error this mediator latched, if any.
    #[must_use]
    pub fn fatal_error(&self) -> Option<WorkerError> {
        self.core.borrow().fatal.clone()
    }

    /// A statistics snapshot (without the live-process count, which
    /// needs the process table).
    #[must_use]
    pub fn stats(&self) -> Value {
        self.core.borrow().stats_json(None)
    }
}

impl MediatorCore {
    // ------------------------------------------------------------------
    // Parent side
    // ------------------------------------------------------------------

    fn issue(&mut self, method: &str, args: Vec<Value>) -> Promise {
        if let Some(fatal) = &self.fatal {
            return Promise::rejected(fatal.clone());
        }
        if !self.registry.contains(method) {
            return Promise::rejected(WorkerError::validation(format!(
                "worker {:?} has no operation {method:?}",
                self.config.alias
            )));
        }

        let mut call = Call::create(method, args);
        let promise = call.promise();
        let id = call.id();

        let wire = match call.to_wire() {
            Ok(bytes) => bytes,
            Err(e) => {
                promise.reject(e);
                return promise;
            }
        };
        match self
            .transport
            .put(call.header(MessageType::Call), Some(&wire))
        {
            Ok(()) => {
                let _ = call.called();
                self.calls.insert(id, call);
            }
            Err(e) => {
                // The call stays in the table, CALLED, until GC sweeps
                // it; the caller learns immediately.
                let werr = WorkerError::from(e);
                self.note_error(&werr);
                let _ = call.called();
                self.calls.insert(id, call);
                promise.reject(werr);
            }
        }
        promise
    }

    fn cancel(&mut self, id: CallId) -> Result<()> {
        let status = match self.calls.get(&id) {
            Some(call) => call.status(),
            None => return Err(WorkerError::validation(format!("no active call {id}"))),
        };
        if status >= CallStatus::Running {
            return Err(WorkerError::clean(format!(
                "call {id} is already {}; kill its worker instead",
                status.name()
            )));
        }
        let Some(mut call) = self.calls.remove(&id) else {
            return Err(WorkerError::validation(format!("no active call {id}")));
        };
        call.cancelled()?;
        // Removing the payload is what a child observes: a CALL header
        // whose slot is gone is skipped as stale.
        let _ = self.transport.drop_slot(id);
        call.promise()
            .reject(WorkerError::clean(format!("call {id} cancelled")));
        self.push_recent(&call);
        Ok(())
    }

    fn retry(&mut self, id: CallId) -> Result<Promise> {
        let Some(call) = self.calls.get_mut(&id) else {
            return Err(WorkerError::validation(format!("no active call {id}")));
        };
        call.retry();
        let promise = call.promise();
        let wire = call.to_wire()?;
        self.transport
            .put(call.header(MessageType::Call), Some(&wire))?;
        call.called()?;
        Ok(promise)
    }

    fn on_pre_execute(&mut self, _ctx: &mut EventCtx<'_>) {
        // RUNNING first: a call's ack always precedes its return.
        loop {
            match self.transport.get(Some(MessageType::Running), false) {
                Ok(Some(frame)) => self.apply_running(&frame),
                Ok(None) => break,
                Err(e) => {
                    self.note_ipc_error(e);
                    break;
                }
            }
        }
        loop {
            match self.transport.get(Some(MessageType::Return), false) {
                Ok(Some(frame)) => self.apply_return(frame),
                Ok(None) => break,
                Err(e) => {
                    self.note_ipc_error(e);
                    break;
                }
            }
        }
    }

    fn apply_running(&mut self, frame: &Frame) {
        let id = frame.header.id;
        match self.calls.get_mut(&id) {
            Some(call) => {
                let _ = call.running(frame.header.pid);
                self.running.insert(id, frame.header.time);
            }
            None => {
                tracing::warn!(id, alias = %self.config.alias, "dropping stale RUNNING header");
            }
        }
    }

    fn apply_return(&mut self, frame: Frame) {
        let id = frame.header.id;
        let Some(mut call) = self.calls.remove(&id) else {
            tracing::warn!(id, alias = %self.config.alias, "dropping stale RETURN header");
            let _ = self.transport.drop_slot(id);
            return;
        };
        self.running.remove(&id);
        let promise = call.promise();

        match frame.payload.as_deref().map(Call::from_wire) {
            Some(Ok(wire)) => {
                let result = wire.result.clone();
                call.pid = wire.pid;
                let _ = call.returned(result.clone());
                match sentinel_error(&result) {
                    Some(message) => {
                        call.errors += 1;
                        promise.reject(WorkerError::clean(message));
                    }
                    None => {
                        promise.fulfill(result.unwrap_or(Value::Null));
                    }
                }
            }
            Some(Err(decode_err)) => {
                self.note_error(&decode_err);
                self.verify_store();
                let _ = call.timeout();
                promise.reject(decode_err);
            }
            None => {
                let missing = WorkerError::Corruption(format!("call {id} return payload missing"));
                self.note_error(&missing);
                let _ = call.timeout();
                promise.reject(missing);
            }
        }
        self.push_recent(&call);
        call.gc();
    }

    fn on_post_execute(&mut self, ctx: &mut EventCtx<'_>) {
        // Premature deaths: any reaped pid still owning unsettled calls
        // took them down with it.
        while let Some(pid) = self.reaped.pop_front() {
            let lost: Vec<CallId> = self
                .calls
                .iter()
                .filter(|(_, call)| call.pid == pid && !call.promise_settled())
                .map(|(id, _)| *id)
                .collect();
            for id in lost {
                let Some(mut call) = self.calls.remove(&id) else {
                    continue;
                };
                self.running.remove(&id);
                let _ = call.timeout();
                call.errors += 1;
                let died = WorkerError::died(format!(
                    "call {id} died: worker {pid} exited before returning"
                ));
                tracing::warn!(id, pid, alias = %self.config.alias, "call died with its worker");
                if let Err(fatal) = self
                    .counters
                    .count(ErrorCategory::Timeout)
                {
                    self.latch_fatal(fatal);
                }
                call.promise().reject(died);
                let _ = self.transport.drop_slot(id);
                self.push_recent(&call);
                call.gc();
            }
        }
        self.fork_pass(ctx);
    }

    fn on_reaped(&mut self, children: &[stoker_core::ReapedChild]) {
        for child in children {
            if child.group == self.config.alias {
                self.reaped.push_back(child.pid);
            }
        }
    }

    fn on_idle(&mut self) {
        if self.last_gc.elapsed() >= GC_INTERVAL {
            self.gc();
        }
    }

    fn gc(&mut self) {
        self.last_gc = Instant::now();
        let swept: Vec<CallId> = self
            .calls
            .iter()
            .filter(|(_, call)| call.promise_settled() || call.status().is_terminal())
            .map(|(id, _)| *id)
            .collect();
        for id in swept {
            if let Some(mut call) = self.calls.remove(&id) {
                let _ = self.transport.drop_slot(id);
                self.push_recent(&call);
                call.gc();
            }
        }
    }

    fn fork_pass(&mut self, ctx: &mut EventCtx<'_>) {
        if self.fatal.is_some() {
            return;
        }
        let alias = self.config.alias.clone();
        let active = self.calls.len();
        let procs = ctx.procs.count(Some(&alias));
        let max = self.config.max_processes as usize;
        let needed = self.strategy.forks_needed(active, procs, max);

        for _ in 0..needed {
            ctx.defer(Event::ParentFork {
                group: alias.clone(),
            });
            match ctx.procs.fork(&alias, self.config.process_timeout) {
                Ok(Forked::Parent(pid)) => {
                    self.fork_failures = 0;
                    ctx.defer(Event::Fork {
                        group: alias.clone(),
                        pid,
                    });
                }
                Ok(Forked::Child) => self.child_main(),
                Ok(Forked::Failed) | Err(_) => {
                    self.fork_failures += 1;
                    if self.fork_failures > FORK_FAILURE_LIMIT {
                        let fatal = WorkerError::fatal(format!(
                            "forking {alias:?} workers failed {} times in a row",
                            self.fork_failures
                        ));
                        ctx.defer(Event::Error {
                            message: fatal.to_string(),
                            fatal: false,
                        });
                        self.latch_fatal(fatal);
                    }
                    break;
                }
            }
        }
    }

    fn note_ipc_error(&mut self, e: IpcError) {
        let reattach = e.is_identity();
        let werr = WorkerError::from(e);
        self.note_error(&werr);
        if reattach {
            tracing::warn!(alias = %self.config.alias, error = %werr,
                "transport identity lost; reattaching");
            if let Err(again) = self.transport.reattach() {
                self.latch_fatal(WorkerError::from(again));
            }
        }
    }

    fn note_error(&mut self, e: &WorkerError) {
        if let Some(category) = e.category() {
            if let Err(fatal) = self.counters.count(category) {
                self.latch_fatal(fatal);
            }
        }
        if e.kind() == crate::error::ErrorKind::Corruption {
            self.verify_store();
        }
    }

    /// The corruption self-test: two clean round-trips through the
    /// store mean the failure was a fluke.
    fn verify_store(&mut self) {
        for _ in 0..2 {
            match self.transport.self_test() {
                Ok(true) => {}
                Ok(false) => {
                    self.latch_fatal(WorkerError::Fatal(
                        "payload store failed its self-test".into(),
                    ));
                    return;
                }
                Err(e) => {
                    self.latch_fatal(WorkerError::from(e));
                    return;
                }
            }
        }
    }

    fn latch_fatal(&mut self, e: WorkerError) {
        if self.fatal.is_none() {
            tracing::error!(alias = %self.config.alias, error = %e, "mediator went fatal");
            self.fatal = Some(e);
        }
    }

    fn push_recent(&mut self, call: &Call) {
        if self.recent.len() == RECENT_CAP {
            self.recent.pop_front();
        }
        let duration = match (
            call.time_of(CallStatus::Called),
            call.time_of(CallStatus::Returned),
        ) {
            (Some(start), Some(end)) => (end - start).max(0.0),
            _ => 0.0,
        };
        self.recent.push_back(CallSummary {
            id: call.id(),
            method: call.method.clone(),
            status: call.status().name(),
            pid: call.pid,
            duration_secs: duration,
        });
    }

    fn stats_with_procs(&self, ctx: &mut EventCtx<'_>) -> Value {
        self.stats_json(Some(ctx.procs.count(Some(&self.config.alias))))
    }

    fn stats_json(&self, processes: Option<usize>) -> Value {
        let recent: Vec<Value> = self
            .recent
            .iter()
            .map(|s| {
                json!({
                    "id": s.id,
                    "method": s.method,
                    "status": s.status,
                    "pid": s.pid,
                    "duration_secs": s.duration_secs,
                })
            })
            .collect();
        json!({
            "alias": self.config.alias,
            "active_calls": self.calls.len(),
            "running_calls": self.running.len(),
            "processes": processes,
            "pending_messages": self.transport.pending_messages().ok(),
            "errors": {
                "communication": self.counters.get(ErrorCategory::Communication),
                "corruption": self.counters.get(ErrorCategory::Corruption),
                "timeout": self.counters.get(ErrorCategory::Timeout),
            },
            "fatal": self.fatal.as_ref().map(ToString::to_string),
            "recent": recent,
        })
    }

    // ------------------------------------------------------------------
    // Child side
    // ------------------------------------------------------------------

    fn child_main(&mut self) -> ! {
        let code = self.child_loop();
        std::process::exit(code);
    }

    fn child_loop(&mut self) -> i32 {
        // The parent's tables mean nothing here.
        self.calls.clear();
        self.running.clear();
        self.reaped.clear();

        if let Err(e) = self.transport.setup(Role::Child) {
            tracing::error!(alias = %self.config.alias, error = %e, "child attach failed");
            return 1;
        }
        // The fork shared the parent's queue descriptors, and with them
        // the O_NONBLOCK flag on each open file description. Fresh
        // handles keep the child's blocking toggles out of the
        // parent's.
        if let Err(e) = self.transport.reattach() {
            tracing::error!(alias = %self.config.alias, error = %e, "child reattach failed");
            return 1;
        }
        self.registry.run_setup();

        let started = Instant::now();
        let mut rng = rand::rng();
        let max_calls = jitter_count(&mut rng, self.config.max_calls_per_child);
        let max_runtime = jitter_duration(&mut rng, self.config.max_runtime);
        let mut counters = ErrorCounters::new(self.config.worker_error_bound);
        let mut served: u32 = 0;

        // With recycling and a runtime bound we must wake periodically
        // to check the clock; otherwise we can block for work.
        let block = !(self.config.auto_restart && !self.config.max_runtime.is_zero());

        loop {
            if term_requested() {
                return 0;
            }
            if self.config.auto_restart {
                let runtime = started.elapsed();
                if (!max_runtime.is_zero() && runtime >= max_runtime)
                    || (runtime >= self.config.min_runtime && served >= max_calls)
                {
                    tracing::debug!(alias = %self.config.alias, served, "worker recycling");
                    return 0;
                }
            }

            let frame = match self.transport.get(Some(MessageType::Call), block) {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    if !block {
                        std::thread::sleep(CHILD_POLL);
                    }
                    continue;
                }
                Err(e) => {
                    if child_note(&mut counters, &e) {
                        return 1;
                    }
                    if e.is_identity() && self.transport.reattach().is_err() {
                        return 1;
                    }
                    std::thread::sleep(CHILD_POLL);
                    continue;
                }
            };

            let Some(bytes) = frame.payload else {
                tracing::warn!(id = frame.header.id, "skipping CALL with no payload");
                continue;
            };
            let mut call = match Call::from_wire(&bytes) {
                Ok(call) => call,
                Err(_) => {
                    let _ = self.transport.drop_slot(frame.header.id);
                    if counters.count(ErrorCategory::Corruption).is_err() {
                        return 1;
                    }
                    continue;
                }
            };
            if call.status() == CallStatus::Cancelled {
                let _ = self.transport.drop_slot(call.id());
                continue;
            }

            let pid = std::process::id() as i32;
            let _ = call.running(pid);
            let _ = self
                .transport
                .put(call.header(MessageType::Running), None);

            let result = match self.registry.invoke(&call.method, &call.args) {
                Ok(value) => value,
                Err(message) => {
                    call.errors += 1;
                    json!({ ERROR_SENTINEL: message })
                }
            };
            served += 1;

            let _ = call.returned(Some(result));
            match call.to_wire() {
                Ok(bytes) => {
                    if let Err(e) = self
                        .transport
                        .put(call.header(MessageType::Return), Some(&bytes))
                    {
                        if child_note(&mut counters, &e) {
                            return 1;
                        }
                    }
                }
                Err(_) => {
                    if counters.count(ErrorCategory::Corruption).is_err() {
                        return 1;
                    }
                }
            }

            if self.config.allow_wakeup {
                let _ = nix::sys::signal::kill(
                    nix::unistd::getppid(),
                    nix::sys::signal::Signal::SIGALRM,
                );
            }
        }
    }
}

/// Extracts the handler-error sentinel from a result value.
fn sentinel_error(result: &Option<Value>) -> Option<String> {
    result
        .as_ref()?
        .as_object()?
        .get(ERROR_SENTINEL)?
        .as_str()
        .map(String::from)
}

/// Counts a child-side transport error; true means the bound tripped.
fn child_note(counters: &mut ErrorCounters, e: &IpcError) -> bool {
    let category = if e.is_corruption() {
        ErrorCategory::Corruption
    } else {
        ErrorCategory::Communication
    };
    counters.count(category).is_err()
}

fn term_requested() -> bool {
    stoker_core::SignalWatcher::pending(nix::sys::signal::Signal::SIGTERM) > 0
}

fn jitter_count(rng: &mut impl rand::Rng, base: u32) -> u32 {
    let factor: f64 = rng.random_range(0.75..=1.25);
    ((f64::from(base) * factor) as u32).max(1)
}

fn jitter_duration(rng: &mut impl rand::Rng, base: Duration) -> Duration {
    if base.is_zero() {
        return base;
    }
    let factor: f64 = rng.random_range(0.75..=1.25);
    base.mul_f64(factor)
}
