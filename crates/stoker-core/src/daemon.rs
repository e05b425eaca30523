//! The fixed-cadence scheduler.
//!
//! A [`Daemon`] is an explicit lifecycle value: construct it at program
//! start, attach mediators and plugins, then hand [`Daemon::run`] a
//! [`Lifecycle`] implementation whose `execute` hook runs once per
//! tick. The scheduler owns signal draining, child reaping, the idle
//! policy, auto-restart, and graceful teardown.
//!
//! Per iteration:
//!
//! 1. drain signal counters into `signal` events and their flag effects;
//! 2. sweep finished children (published as `reaped` *after* the tick);
//! 3. honor the auto-restart interval unless a subscriber stops it;
//! 4. `pre_execute` → user `execute` (skipped when propagation stopped)
//!    → `post_execute`;
//! 5. idle policy;
//! 6. `wait`: sleep out the interval with `SIGCHLD` blocked, or yield
//!    at least `loop_sleep_min` after an over-run.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use nix::unistd::{fork, getpid, setsid, ForkResult};
use rand::Rng;

use crate::config::DaemonConfig;
use crate::error::{CoreError, Result};
use crate::event::{
    Bus, CtxRequests, Dispatch, Event, EventCtx, EventName, Flow, LogLevel, StatsReport,
    SubscriberId,
};
use crate::log::LogChannel;
use crate::process::ProcessTable;
use crate::signals::{self, SignalWatcher};

/// Environment marker carried across a self-restart exec so the
/// restarted process knows it is already detached.
pub const DAEMONIZED_ENV: &str = "STOKER_DAEMONIZED";

/// Guard subtracted from the interval when deciding idleness.
const IDLE_GUARD: Duration = Duration::from_millis(10);

/// Cap on chained deferred-event rounds per publish.
const MAX_DEFER_ROUNDS: usize = 8;

/// Lifecycle states of the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    /// Constructed, not initialized.
    Created,
    /// Signals installed, log open, `init` published.
    Initialized,
    /// Inside the main loop.
    Running,
    /// The loop exited; teardown in progress.
    ShuttingDown,
    /// About to exec the restart command.
    Restarting,
    /// Torn down.
    Exited,
}

/// Read-only summary of the daemon's loop state, handed to every
/// subscriber and lifecycle hook.
#[derive(Debug, Clone)]
pub struct DaemonInfo {
    /// Our pid.
    pub pid: i32,
    /// Pid of the original parent process.
    pub parent_pid: i32,
    /// False inside any forked child.
    pub is_parent: bool,
    /// Whether the daemon detached from the terminal.
    pub daemonized: bool,
    /// The configured loop cadence.
    pub loop_interval: Duration,
    /// Completed loop iterations.
    pub loop_iterations: u64,
    /// Shutdown latch; never clears once set.
    pub shutdown: bool,
    /// Restart request; honored at loop exit.
    pub restart: bool,
    started: Instant,
}

impl DaemonInfo {
    fn new(loop_interval: Duration) -> Self {
        let pid = getpid().as_raw();
        Self {
            pid,
            parent_pid: pid,
            is_parent: true,
            daemonized: false,
            loop_interval,
            loop_iterations: 0,
            shutdown: false,
            restart: false,
            started: Instant::now(),
        }
    }

    /// Time since the loop value was created.
    #[must_use]
    pub fn runtime(&self) -> Duration {
        self.started.elapsed()
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self::new(Duration::ZERO)
    }
}

/// The hooks a daemon author supplies.
pub trait Lifecycle {
    /// Runs once after `init`, before the first tick.
    ///
    /// # Errors
    /// A failure aborts startup.
    fn setup(&mut self, _ctx: &mut EventCtx<'_>) -> Result<()> {
        Ok(())
    }

    /// Runs once per tick (unless a `pre_execute` subscriber stopped
    /// propagation).
    ///
    /// # Errors
    /// Non-fatal errors are published and logged; fatal errors tear the
    /// daemon down.
    fn execute(&mut self, ctx: &mut EventCtx<'_>) -> Result<()>;

    /// Runs during teardown, before children are terminated.
    fn teardown(&mut self, _ctx: &mut EventCtx<'_>) {}
}

/// The supervised event loop.
pub struct Daemon {
    config: DaemonConfig,
    info: DaemonInfo,
    state: DaemonState,
    bus: Bus,
    procs: ProcessTable,
    log_chan: Option<LogChannel>,
    deferred: Vec<Event>,
    requests: CtxRequests,
    dispatched: HashMap<EventName, u64>,
    interrupt_count: u64,
    restart_args: Vec<String>,
    watcher: Option<SignalWatcher>,
}

impl Daemon {
    /// Creates a daemon from a validated configuration.
    ///
    /// # Errors
    /// Validation failures.
    pub fn new(config: DaemonConfig) -> Result<Self> {
        config.validate()?;
        let info = DaemonInfo::new(config.loop_interval);
        Ok(Self {
            config,
            info,
            state: DaemonState::Created,
            bus: Bus::new(),
            procs: ProcessTable::new(),
            log_chan: None,
            deferred: Vec::new(),
            requests: CtxRequests::default(),
            dispatched: HashMap::new(),
            interrupt_count: 0,
            restart_args: std::env::args().collect(),
            watcher: None,
        })
    }

    /// Detaches (when configured), installs signal handlers, opens the
    /// log channel, and publishes `init`.
    ///
    /// # Errors
    /// Any of those steps failing. Fatal; the daemon must not run.
    pub fn init(&mut self) -> Result<()> {
        if self.state != DaemonState::Created {
            return Ok(());
        }
        if self.config.daemonize {
            self.info.daemonized = true;
            if std::env::var_os(DAEMONIZED_ENV).is_none() {
                self.detach()?;
            }
        }
        self.watcher = Some(SignalWatcher::install(&[])?);
        if let Some(path) = self.config.log_path.clone() {
            self.log_chan = Some(LogChannel::open(path, self.config.log_echo)?);
        }
        self.state = DaemonState::Initialized;
        self.publish(Event::Init);
        Ok(())
    }

    /// Registers a subscriber; see [`Bus::subscribe`].
    pub fn subscribe(
        &mut self,
        name: EventName,
        priority: i32,
        sub: impl FnMut(&mut EventCtx<'_>, &Event) -> Flow + 'static,
    ) -> SubscriberId {
        self.bus.subscribe(name, priority, sub)
    }

    /// Removes a subscriber.
    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        self.bus.unsubscribe(id)
    }

    /// The daemon's loop state summary.
    #[must_use]
    pub const fn info(&self) -> &DaemonInfo {
        &self.info
    }

    /// The configuration.
    #[must_use]
    pub const fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// The lifecycle state.
    #[must_use]
    pub const fn state(&self) -> DaemonState {
        self.state
    }

    /// The process table.
    #[must_use]
    pub const fn procs(&self) -> &ProcessTable {
        &self.procs
    }

    /// Mutable access to the process table.
    pub fn procs_mut(&mut self) -> &mut ProcessTable {
        &mut self.procs
    }

    /// `SIGINT` deliveries observed so far.
    #[must_use]
    pub const fn interrupt_count(&self) -> u64 {
        self.interrupt_count
    }

    /// How often `name` has been dispatched.
    #[must_use]
    pub fn dispatched_count(&self, name: EventName) -> u64 {
        self.dispatched.get(&name).copied().unwrap_or(0)
    }

    /// Latches the shutdown flag. Idempotent.
    pub fn request_shutdown(&mut self) {
        self.info.shutdown = true;
    }

    /// Whether the shutdown latch is set.
    #[must_use]
    pub const fn is_shutdown(&self) -> bool {
        self.info.shutdown
    }

    /// Publishes an event, then any events deferred during dispatch.
    pub fn publish(&mut self, event: Event) -> Dispatch {
        let outcome = self.dispatch_one(&event);
        self.flush_deferred();
        self.absorb_requests();
        outcome
    }

    /// Runs `f` with an event context over this daemon's state, then
    /// publishes anything `f` deferred.
    pub fn with_ctx<R>(&mut self, f: impl FnOnce(&mut EventCtx<'_>) -> R) -> R {
        let out = {
            let mut ctx = EventCtx::new(
                &mut self.procs,
                &self.info,
                &mut self.deferred,
                &mut self.requests,
            );
            f(&mut ctx)
        };
        self.flush_deferred();
        self.absorb_requests();
        out
    }

    /// Publishes a `log` event and, unless a subscriber suppressed it,
    /// writes the line to the log channel and the tracing output.
    pub fn log(&mut self, level: LogLevel, message: &str) {
        let outcome = self.publish(Event::Log {
            level,
            message: message.to_string(),
        });
        if outcome.stopped {
            return;
        }
        match level {
            LogLevel::Debug => tracing::debug!("{message}"),
            LogLevel::Info => tracing::info!("{message}"),
            LogLevel::Warn => tracing::warn!("{message}"),
            LogLevel::Error => tracing::error!("{message}"),
        }
        if let Some(chan) = &mut self.log_chan {
            if let Err(e) = chan.write(level, message) {
                tracing::warn!(error = %e, "log channel write failed");
            }
        }
    }

    /// Forks a fire-and-forget task in the `"task"` group and publishes
    /// `fork`. Returns the child pid, or `None` on an early death.
    ///
    /// # Errors
    /// Fork failures.
    pub fn run_task(&mut self, f: Box<dyn FnOnce()>) -> Result<Option<i32>> {
        let pid = self.procs.fork_task(f)?;
        if let Some(pid) = pid {
            self.publish(Event::Fork {
                group: crate::process::TASK_GROUP.to_string(),
                pid,
            });
        }
        Ok(pid)
    }

    /// Assembles a statistics snapshot: the daemon's own counters plus
    /// whatever `stats` subscribers push into the report.
    pub fn stats(&mut self) -> Vec<serde_json::Value> {
        let report = StatsReport::new();
        self.publish(Event::Stats {
            report: report.clone(),
        });
        let mut entries = report.take();
        entries.insert(0, self.own_stats());
        entries
    }

    /// Runs the main loop until shutdown, then tears down.
    ///
    /// On a restart request this execs the rebuilt command and does not
    /// return.
    ///
    /// # Errors
    /// Setup failures and fatal runtime errors.
    pub fn run(&mut self, lifecycle: &mut dyn Lifecycle) -> Result<()> {
        self.init()?;
        if let Err(e) = self.with_ctx(|ctx| lifecycle.setup(ctx)) {
            self.teardown(lifecycle);
            return Err(e);
        }
        self.state = DaemonState::Running;

        while !self.info.shutdown {
            let t0 = Instant::now();

            self.drain_signals();
            self.procs.reap();
            if self.info.shutdown {
                break;
            }

            if self.auto_restart_due() {
                let outcome = self.publish(Event::AutoRestart);
                if !outcome.stopped {
                    self.info.restart = true;
                    self.info.shutdown = true;
                    break;
                }
            }

            self.info.loop_iterations += 1;
            let iteration = self.info.loop_iterations;

            let pre = self.publish(Event::PreExecute { iteration });
            if !pre.stopped {
                if let Err(e) = self.with_ctx(|ctx| lifecycle.execute(ctx)) {
                    self.report_error(&e);
                    if e.is_fatal() {
                        return self.fatal_exit(lifecycle, e);
                    }
                }
            }
            self.publish(Event::PostExecute { iteration });

            // Reaped pids are published only after the iteration body, so
            // a child's final RETURN drained above wins the race against
            // its exit.
            let reaped = self.procs.take_reaped();
            if !reaped.is_empty() {
                self.publish(Event::Reaped { children: reaped });
            }

            if self.info.shutdown {
                break;
            }
            self.idle_after(t0);
            self.wait(t0);
        }

        self.teardown(lifecycle);
        if self.info.restart && self.can_restart() {
            self.state = DaemonState::Restarting;
            return Err(self.exec_restart());
        }
        self.state = DaemonState::Exited;
        Ok(())
    }

    /// Publishes `shutdown`, runs the lifecycle teardown hook,
    /// terminates children, and closes the log. Safe to call twice.
    pub fn teardown(&mut self, lifecycle: &mut dyn Lifecycle) {
        if self.state == DaemonState::Exited {
            return;
        }
        self.state = DaemonState::ShuttingDown;
        self.publish(Event::Shutdown);
        self.with_ctx(|ctx| lifecycle.teardown(ctx));
        self.procs.teardown();
        let reaped = self.procs.take_reaped();
        if !reaped.is_empty() {
            self.publish(Event::Reaped { children: reaped });
        }
        if let Some(chan) = &mut self.log_chan {
            chan.close();
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn dispatch_one(&mut self, event: &Event) -> Dispatch {
        *self.dispatched.entry(event.name()).or_insert(0) += 1;
        let mut ctx = EventCtx::new(
            &mut self.procs,
            &self.info,
            &mut self.deferred,
            &mut self.requests,
        );
        self.bus.dispatch(&mut ctx, event)
    }

    fn absorb_requests(&mut self) {
        if std::mem::take(&mut self.requests.shutdown) {
            self.info.shutdown = true;
        }
    }

    fn flush_deferred(&mut self) {
        let mut rounds = 0;
        while !self.deferred.is_empty() && rounds < MAX_DEFER_ROUNDS {
            rounds += 1;
            let batch: Vec<Event> = self.deferred.drain(..).collect();
            for event in batch {
                self.dispatch_one(&event);
            }
        }
        if !self.deferred.is_empty() {
            tracing::warn!(
                dropped = self.deferred.len(),
                "deferred events kept chaining; dropping the tail"
            );
            self.deferred.clear();
        }
    }

    fn drain_signals(&mut self) {
        let drained = match &self.watcher {
            Some(watcher) => watcher.drain(),
            None => return,
        };
        for (signo, count) in drained {
            match Signal::try_from(signo) {
                Ok(Signal::SIGTERM) => {
                    self.info.shutdown = true;
                }
                Ok(Signal::SIGINT) => {
                    self.interrupt_count += u64::from(count);
                    if self.config.shutdown_on_interrupt {
                        self.info.shutdown = true;
                    }
                }
                Ok(Signal::SIGHUP) => {
                    if self.info.is_parent && self.info.daemonized {
                        self.info.restart = true;
                        self.info.shutdown = true;
                    } else {
                        self.log(LogLevel::Warn, "SIGHUP ignored: daemon not daemonized");
                    }
                }
                Ok(Signal::SIGUSR1) => {
                    if self.info.is_parent && self.config.dump_on_signal {
                        self.dump_stats();
                    }
                }
                // The reaper sweeps every tick; SIGALRM only exists to
                // break the sleep early.
                Ok(Signal::SIGCHLD | Signal::SIGALRM) => {}
                _ => {}
            }
            self.publish(Event::Signal { signo });
        }
    }

    fn auto_restart_due(&self) -> bool {
        let Some(interval) = self.config.auto_restart_interval else {
            return false;
        };
        self.info.daemonized && !interval.is_zero() && self.info.runtime() >= interval
    }

    fn can_restart(&self) -> bool {
        self.state != DaemonState::Created && self.info.is_parent && self.info.daemonized
    }

    fn idle_after(&mut self, t0: Instant) {
        let interval = self.config.loop_interval;
        let idle = if interval.is_zero() {
            rand::rng().random_bool(self.config.idle_probability.clamp(0.0, 1.0))
        } else {
            Instant::now() + IDLE_GUARD < t0 + interval
        };
        if idle {
            self.publish(Event::Idle);
        }
    }

    fn wait(&mut self, t0: Instant) {
        let interval = self.config.loop_interval;
        let elapsed = t0.elapsed();
        if !interval.is_zero() && elapsed < interval {
            // Workers exiting mid-sleep must not wake us early; any
            // other signal (SIGALRM wakeups included) still does.
            signals::block_sigchld();
            signals::interruptible_sleep(interval - elapsed);
            signals::unblock_sigchld();
        } else {
            if !interval.is_zero() && self.config.log_overruns {
                tracing::debug!(
                    over_ms = (elapsed - interval).as_millis() as u64,
                    iteration = self.info.loop_iterations,
                    "tick over-ran the loop interval"
                );
            }
            std::thread::sleep(self.config.loop_sleep_min);
        }
    }

    fn report_error(&mut self, e: &CoreError) {
        let message = e.to_string();
        let outcome = self.publish(Event::Error {
            message: message.clone(),
            fatal: e.is_fatal(),
        });
        if !outcome.stopped {
            self.log(LogLevel::Error, &message);
        }
    }

    fn fatal_exit(&mut self, lifecycle: &mut dyn Lifecycle, e: CoreError) -> Result<()> {
        let up_long_enough = self.info.runtime() >= self.config.min_restart_threshold;
        self.teardown(lifecycle);
        if !e.is_clean() && up_long_enough && self.can_restart() {
            self.state = DaemonState::Restarting;
            return Err(self.exec_restart());
        }
        self.state = DaemonState::Exited;
        Err(e)
    }

    fn dump_stats(&mut self) {
        let entries = self.stats();
        for entry in &entries {
            self.log(LogLevel::Info, &format!("stats: {entry}"));
        }
    }

    fn own_stats(&self) -> serde_json::Value {
        let mut ended: HashMap<&str, usize> = HashMap::new();
        for proc_ in self.procs.recently_ended() {
            *ended.entry(proc_.group.as_str()).or_insert(0) += 1;
        }
        let dispatched: HashMap<String, u64> = self
            .dispatched
            .iter()
            .map(|(name, count)| (name.to_string(), *count))
            .collect();
        serde_json::json!({
            "daemon": self.config.name,
            "pid": self.info.pid,
            "uptime_secs": self.info.runtime().as_secs(),
            "iterations": self.info.loop_iterations,
            "interrupts": self.interrupt_count,
            "live_processes": self.procs.count(None),
            "dispatched": dispatched,
            "recently_ended": ended,
        })
    }

    /// Double fork + setsid; the intermediate parents exit 0.
    fn detach(&mut self) -> Result<()> {
        let old = self.info.pid;
        match unsafe { fork() }.map_err(|e| CoreError::init(format!("daemonize fork: {e}")))? {
            ForkResult::Parent { .. } => std::process::exit(0),
            ForkResult::Child => {}
        }
        setsid().map_err(|e| CoreError::init(format!("setsid: {e}")))?;
        match unsafe { fork() }.map_err(|e| CoreError::init(format!("daemonize fork: {e}")))? {
            ForkResult::Parent { .. } => std::process::exit(0),
            ForkResult::Child => {}
        }
        std::env::set_var(DAEMONIZED_ENV, "1");
        self.info.pid = getpid().as_raw();
        self.info.parent_pid = self.info.pid;
        self.publish(Event::PidChange {
            old,
            new: self.info.pid,
        });
        Ok(())
    }

    /// Rebuilds the original invocation and execs it. Returns only on
    /// failure.
    fn exec_restart(&mut self) -> CoreError {
        use std::os::unix::process::CommandExt;

        self.log(LogLevel::Info, "restarting via exec");
        if let Some(chan) = &mut self.log_chan {
            chan.close();
        }
        let exe = match std::env::current_exe() {
            Ok(exe) => exe,
            Err(e) => return CoreError::Restart(format!("current_exe: {e}")),
        };
        // Std handles are nulled so the next incarnation does not
        // inherit a blocking pipe from whoever launched us.
        let err = std::process::Command::new(exe)
            .args(self.restart_args.iter().skip(1))
            .env(DAEMONIZED_ENV, "1")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .exec();
        CoreError::Restart(format!("exec: {err}"))
    }
}
