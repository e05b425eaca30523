//! The in-process event bus.
//!
//! Everything interesting in a stoker daemon is cross-wired over this
//! bus: the scheduler publishes the tick events, the process table
//! publishes reap results, mediators and user plugins subscribe.
//! Dispatch is synchronous and single-threaded; a subscriber stops
//! propagation for the current dispatch by returning [`Flow::Stop`],
//! and that decision lives in the dispatcher's own state, so the next
//! dispatch of the same event kind always starts propagating again.
//!
//! Signal handlers never touch the bus. They only flip atomic
//! counters; the loop turns those into `signal` events at iteration
//! boundaries.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::daemon::DaemonInfo;
use crate::process::ProcessTable;

/// Severity of a log-channel line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Diagnostic chatter.
    Debug,
    /// Normal operation.
    Info,
    /// Something off, daemon continues.
    Warn,
    /// Something failed.
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        })
    }
}

/// A child collected by the reaper.
#[derive(Debug, Clone)]
pub struct ReapedChild {
    /// The reaped pid.
    pub pid: i32,
    /// Group the process was forked under.
    pub group: String,
    /// Exit code when the child exited normally.
    pub exit_code: Option<i32>,
    /// Terminating signal when the child was killed.
    pub signal: Option<i32>,
}

/// Shared collector that `stats` subscribers push their snapshots into.
#[derive(Debug, Clone, Default)]
pub struct StatsReport {
    entries: Rc<RefCell<Vec<serde_json::Value>>>,
}

impl StatsReport {
    /// Creates an empty report.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one subsystem's snapshot.
    pub fn push(&self, entry: serde_json::Value) {
        self.entries.borrow_mut().push(entry);
    }

    /// Takes the collected snapshots.
    #[must_use]
    pub fn take(&self) -> Vec<serde_json::Value> {
        std::mem::take(&mut *self.entries.borrow_mut())
    }
}

/// Every event a stoker daemon publishes.
#[derive(Debug, Clone)]
pub enum Event {
    /// The daemon finished initialization.
    Init,
    /// The current tick left spare time (or won the idle draw).
    Idle,
    /// A child was forked and registered (published in the parent).
    Fork {
        /// Process group of the child.
        group: String,
        /// Pid of the new child.
        pid: i32,
    },
    /// The parent is about to fork into `group`; plugins that hold
    /// handles a child must not inherit react here.
    ParentFork {
        /// Process group about to be forked into.
        group: String,
    },
    /// The daemon's pid changed (daemonize fork).
    PidChange {
        /// Previous pid.
        old: i32,
        /// Current pid.
        new: i32,
    },
    /// Start of a tick; stopping propagation skips the user `execute`.
    PreExecute {
        /// Loop iteration number, 1-based.
        iteration: u64,
    },
    /// End of a tick.
    PostExecute {
        /// Loop iteration number, 1-based.
        iteration: u64,
    },
    /// The auto-restart interval elapsed; stopping propagation cancels
    /// the restart.
    AutoRestart,
    /// A signal was delivered since the last drain.
    Signal {
        /// The raw signal number.
        signo: i32,
    },
    /// Shutdown has latched; teardown is about to run.
    Shutdown,
    /// A runtime error; stopping propagation marks it consumed.
    Error {
        /// Rendered error message.
        message: String,
        /// Whether the daemon is about to tear down over it.
        fatal: bool,
    },
    /// A log-channel line; stopping propagation suppresses the write.
    Log {
        /// Severity.
        level: LogLevel,
        /// The line.
        message: String,
    },
    /// A statistics snapshot is being assembled.
    Stats {
        /// Collector the subscribers push into.
        report: StatsReport,
    },
    /// A transport token was derived for a worker alias.
    GenerateGuid {
        /// The worker alias.
        alias: String,
        /// The derived token.
        token: u32,
    },
    /// Children were collected since the last iteration.
    Reaped {
        /// The reaped children, in collection order.
        children: Vec<ReapedChild>,
    },
}

impl Event {
    /// The stable name this event dispatches under.
    #[must_use]
    pub const fn name(&self) -> EventName {
        match self {
            Self::Init => EventName::Init,
            Self::Idle => EventName::Idle,
            Self::Fork { .. } => EventName::Fork,
            Self::ParentFork { .. } => EventName::ParentFork,
            Self::PidChange { .. } => EventName::PidChange,
            Self::PreExecute { .. } => EventName::PreExecute,
            Self::PostExecute { .. } => EventName::PostExecute,
            Self::AutoRestart => EventName::AutoRestart,
            Self::Signal { .. } => EventName::Signal,
            Self::Shutdown => EventName::Shutdown,
            Self::Error { .. } => EventName::Error,
            Self::Log { .. } => EventName::Log,
            Self::Stats { .. } => EventName::Stats,
            Self::GenerateGuid { .. } => EventName::GenerateGuid,
            Self::Reaped { .. } => EventName::Reaped,
        }
    }
}

/// The stable event names; part of the plugin contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    /// `init`
    Init,
    /// `idle`
    Idle,
    /// `fork`
    Fork,
    /// `parent_fork`
    ParentFork,
    /// `pid_change`
    PidChange,
    /// `pre_execute`
    PreExecute,
    /// `post_execute`
    PostExecute,
    /// `auto_restart`
    AutoRestart,
    /// `signal`
    Signal,
    /// `shutdown`
    Shutdown,
    /// `error`
    Error,
    /// `log`
    Log,
    /// `stats`
    Stats,
    /// `generate_guid`
    GenerateGuid,
    /// `reaped`
    Reaped,
}

impl std::fmt::Display for EventName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Init => "init",
            Self::Idle => "idle",
            Self::Fork => "fork",
            Self::ParentFork => "parent_fork",
            Self::PidChange => "pid_change",
            Self::PreExecute => "pre_execute",
            Self::PostExecute => "post_execute",
            Self::AutoRestart => "auto_restart",
            Self::Signal => "signal",
            Self::Shutdown => "shutdown",
            Self::Error => "error",
            Self::Log => "log",
            Self::Stats => "stats",
            Self::GenerateGuid => "generate_guid",
            Self::Reaped => "reaped",
        })
    }
}

/// What a subscriber wants done with the rest of the subscriber list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep delivering to later subscribers.
    Continue,
    /// Stop propagation for this dispatch only.
    Stop,
}

/// Requests a subscriber or lifecycle hook hands back to the
/// scheduler, applied once the current dispatch completes.
#[derive(Debug, Default)]
pub struct CtxRequests {
    pub(crate) shutdown: bool,
}

/// What the bus hands each subscriber alongside the event.
///
/// Subscribers may fork and inspect processes, read the daemon's
/// summary state, defer follow-up events to after the current
/// dispatch, and request a shutdown.
pub struct EventCtx<'a> {
    /// The process table.
    pub procs: &'a mut ProcessTable,
    /// Read-only snapshot of the daemon's loop state.
    pub daemon: &'a DaemonInfo,
    deferred: &'a mut Vec<Event>,
    requests: &'a mut CtxRequests,
}

impl<'a> EventCtx<'a> {
    /// Assembles a context from its parts.
    #[must_use]
    pub fn new(
        procs: &'a mut ProcessTable,
        daemon: &'a DaemonInfo,
        deferred: &'a mut Vec<Event>,
        requests: &'a mut CtxRequests,
    ) -> Self {
        Self {
            procs,
            daemon,
            deferred,
            requests,
        }
    }

    /// Queues an event to be published after the current dispatch
    /// completes.
    pub fn defer(&mut self, event: Event) {
        self.deferred.push(event);
    }

    /// Asks the scheduler to latch its shutdown flag.
    pub fn request_shutdown(&mut self) {
        self.requests.shutdown = true;
    }
}

/// Outcome of one dispatch.
#[derive(Debug, Clone, Copy)]
pub struct Dispatch {
    /// Subscribers that received the event.
    pub delivered: usize,
    /// Whether a subscriber stopped propagation.
    pub stopped: bool,
}

/// Identifies one subscription for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberId(u64);

type SubscriberFn = Box<dyn FnMut(&mut EventCtx<'_>, &Event) -> Flow>;

struct Entry {
    id: u64,
    priority: i32,
    seq: u64,
    sub: SubscriberFn,
}

/// Event name → priority-ordered subscriber list.
///
/// Not thread-safe; the bus belongs to the main loop.
#[derive(Default)]
pub struct Bus {
    subs: HashMap<EventName, Vec<Entry>>,
    next: u64,
}

impl Bus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `sub` for `name`. Higher `priority` runs earlier;
    /// equal priorities run in registration order. Registration is
    /// valid at any time, including after `init`.
    pub fn subscribe(
        &mut self,
        name: EventName,
        priority: i32,
        sub: impl FnMut(&mut EventCtx<'_>, &Event) -> Flow + 'static,
    ) -> SubscriberId {
        self.next += 1;
        let entry = Entry {
            id: self.next,
            priority,
            seq: self.next,
            sub: Box::new(sub),
        };
        let list = self.subs.entry(name).or_default();
        list.push(entry);
        list.sort_by_key(|e| (std::cmp::Reverse(e.priority), e.seq));
        SubscriberId(self.next)
    }

    /// Removes a subscription; true when it existed.
    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        for list in self.subs.values_mut() {
            if let Some(pos) = list.iter().position(|e| e.id == id.0) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    /// Number of subscribers registered for `name`.
    #[must_use]
    pub fn subscriber_count(&self, name: EventName) -> usize {
        self.subs.get(&name).map_or(0, Vec::len)
    }

    /// Delivers `event` to its subscribers in priority order.
    ///
    /// Propagation state is re-armed per dispatch; a `Stop` from one
    /// dispatch never leaks into the next.
    pub fn dispatch(&mut self, ctx: &mut EventCtx<'_>, event: &Event) -> Dispatch {
        let mut delivered = 0;
        let mut stopped = false;
        if let Some(list) = self.subs.get_mut(&event.name()) {
            for entry in list.iter_mut() {
                delivered += 1;
                if (entry.sub)(ctx, event) == Flow::Stop {
                    stopped = true;
                    break;
                }
            }
        }
        Dispatch { delivered, stopped }
    }
}
