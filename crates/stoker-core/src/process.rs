//! Parent-side bookkeeping for forked children.
//!
//! Every child a stoker daemon creates goes through this table: worker
//! processes grouped by their mediator alias and fire-and-forget tasks
//! under the `"task"` group. The table registers pids at fork time,
//! collects exits with a nonblocking `waitpid` sweep after `SIGCHLD`,
//! and force-terminates stragglers at teardown.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

use crate::error::{CoreError, Result};
use crate::event::ReapedChild;

/// Group name for fire-and-forget tasks.
pub const TASK_GROUP: &str = "task";

/// Floor for a process's shutdown timeout.
pub const MIN_PROCESS_TIMEOUT: Duration = Duration::from_secs(60);

/// How many ended processes the statistics ring keeps.
const ENDED_RING: usize = 32;

/// Poll cadence while waiting out a teardown.
const TEARDOWN_POLL: Duration = Duration::from_millis(50);

/// One live forked child.
#[derive(Debug, Clone)]
pub struct Process {
    /// The child's pid.
    pub pid: i32,
    /// Worker alias, or [`TASK_GROUP`].
    pub group: String,
    /// When the fork returned in the parent.
    pub started: Instant,
    /// When a shutdown attempt against this child began.
    pub stopped: Option<Instant>,
    timeout: Duration,
}

impl Process {
    fn new(pid: i32, group: &str, timeout: Duration) -> Self {
        Self {
            pid,
            group: group.to_string(),
            started: Instant::now(),
            stopped: None,
            timeout: timeout.max(MIN_PROCESS_TIMEOUT),
        }
    }

    /// Shutdown timeout; at least [`MIN_PROCESS_TIMEOUT`].
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Time since the fork.
    #[must_use]
    pub fn runtime(&self) -> Duration {
        self.started.elapsed()
    }
}

/// How an ended process went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Exited with a code.
    Exited(i32),
    /// Terminated by a signal.
    Signaled(i32),
    /// The wait status carried no usable detail.
    Unknown,
}

/// A recently ended process, for statistics.
#[derive(Debug, Clone)]
pub struct EndedProcess {
    /// The pid it had.
    pub pid: i32,
    /// Its group.
    pub group: String,
    /// How long it ran.
    pub runtime: Duration,
    /// How it ended.
    pub exit: ExitKind,
}

/// Result of a fork request, seen from the caller.
#[derive(Debug)]
pub enum Forked {
    /// We are the parent; the child is registered under this pid.
    Parent(i32),
    /// We are inside the new child; the caller drives from here.
    Child,
    /// The child died before registration completed; the work never
    /// started.
    Failed,
}

/// The table of live children.
#[derive(Default)]
pub struct ProcessTable {
    procs: HashMap<i32, Process>,
    tick_reaped: Vec<ReapedChild>,
    ended: VecDeque<EndedProcess>,
}

impl ProcessTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Forks a child under `group`.
    ///
    /// In the parent, the pid is registered before returning; if the
    /// child already exited by then (an early death), it is reaped
    /// synchronously and [`Forked::Failed`] comes back so the caller
    /// knows the work never started. In the child, [`Forked::Child`]
    /// comes back and the caller drives.
    ///
    /// # Errors
    /// `fork(2)` failures.
    pub fn fork(&mut self, group: &str, timeout: Duration) -> Result<Forked> {
        match unsafe { fork() } {
            Ok(ForkResult::Child) => Ok(Forked::Child),
            Ok(ForkResult::Parent { child }) => {
                let pid = child.as_raw();
                self.procs.insert(pid, Process::new(pid, group, timeout));

                // A SIGCHLD between fork and here means the child may be
                // gone already; check without blocking.
                match waitpid(child, Some(WaitPidFlag::WNOHANG)) {
                    Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => {
                        self.procs.remove(&pid);
                        tracing::warn!(pid, group, ?status, "child died before registration");
                        Ok(Forked::Failed)
                    }
                    _ => Ok(Forked::Parent(pid)),
                }
            }
            Err(e) => Err(CoreError::Fork(format!("fork for group {group}: {e}"))),
        }
    }

    /// Forks a fire-and-forget task: the child runs `f` and exits 0.
    ///
    /// Returns the child pid, or `None` when the child died before
    /// registration.
    ///
    /// # Errors
    /// `fork(2)` failures.
    pub fn fork_task(&mut self, f: Box<dyn FnOnce()>) -> Result<Option<i32>> {
        match self.fork(TASK_GROUP, MIN_PROCESS_TIMEOUT)? {
            Forked::Child => {
                f();
                std::process::exit(0);
            }
            Forked::Parent(pid) => Ok(Some(pid)),
            Forked::Failed => Ok(None),
        }
    }

    /// Number of live children, optionally within one group.
    #[must_use]
    pub fn count(&self, group: Option<&str>) -> usize {
        match group {
            Some(g) => self.procs.values().filter(|p| p.group == g).count(),
            None => self.procs.len(),
        }
    }

    /// Looks up a live child, optionally constrained to a group.
    #[must_use]
    pub fn find(&self, pid: i32, group: Option<&str>) -> Option<&Process> {
        self.procs
            .get(&pid)
            .filter(|p| group.is_none_or(|g| p.group == g))
    }

    /// Pids of the live children in `group`.
    #[must_use]
    pub fn pids(&self, group: &str) -> Vec<i32> {
        let mut pids: Vec<i32> = self
            .procs
            .values()
            .filter(|p| p.group == group)
            .map(|p| p.pid)
            .collect();
        pids.sort_unstable();
        pids
    }

    /// Collects every finished child without blocking.
    ///
    /// Each reaped pid is removed from the table and appended to the
    /// per-tick reaped list; the scheduler publishes that list as a
    /// `reaped` event after the iteration has finished, so a child's
    /// final message wins any race against its exit.
    pub fn reap(&mut self) -> usize {
        let mut collected = 0;
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    self.collect(pid.as_raw(), ExitKind::Exited(code));
                    collected += 1;
                }
                Ok(WaitStatus::Signaled(pid, sig, _)) => {
                    self.collect(pid.as_raw(), ExitKind::Signaled(sig as i32));
                    collected += 1;
                }
                Ok(WaitStatus::StillAlive) | Err(_) => break,
                Ok(_) => {} // stopped/continued: not exits
            }
        }
        collected
    }

    /// Takes the reaped list accumulated since the last call.
    #[must_use]
    pub fn take_reaped(&mut self) -> Vec<ReapedChild> {
        std::mem::take(&mut self.tick_reaped)
    }

    /// Sends `sig` to one child.
    ///
    /// # Errors
    /// Unknown pid or `kill(2)` failure.
    pub fn kill(&mut self, pid: i32, sig: Signal) -> Result<()> {
        if !self.procs.contains_key(&pid) {
            return Err(CoreError::runtime(format!("no live child with pid {pid}")));
        }
        kill(Pid::from_raw(pid), sig)
            .map_err(|e| CoreError::runtime(format!("kill({pid}, {sig}): {e}")))
    }

    /// Begins a shutdown of one child: `SIGTERM` now, upgraded to
    /// `SIGKILL` by [`teardown`](Self::teardown) (or a later `stop`)
    /// once the child's timeout elapses.
    ///
    /// # Errors
    /// Unknown pid or `kill(2)` failure.
    pub fn stop(&mut self, pid: i32) -> Result<()> {
        let Some(proc_) = self.procs.get_mut(&pid) else {
            return Err(CoreError::runtime(format!("no live child with pid {pid}")));
        };
        match proc_.stopped {
            None => {
                proc_.stopped = Some(Instant::now());
                kill(Pid::from_raw(pid), Signal::SIGTERM)
                    .map_err(|e| CoreError::runtime(format!("SIGTERM {pid}: {e}")))
            }
            Some(since) if since.elapsed() >= proc_.timeout => {
                kill(Pid::from_raw(pid), Signal::SIGKILL)
                    .map_err(|e| CoreError::runtime(format!("SIGKILL {pid}: {e}")))
            }
            Some(_) => Ok(()),
        }
    }

    /// Terminates every live child: TERM first, 50 ms polls, KILL for
    /// anything still alive after its per-process timeout.
    pub fn teardown(&mut self) {
        let deadline = self
            .procs
            .values()
            .map(Process::timeout)
            .max()
            .unwrap_or(MIN_PROCESS_TIMEOUT)
            + Duration::from_secs(5);
        let begun = Instant::now();

        let pids: Vec<i32> = self.procs.keys().copied().collect();
        for pid in pids {
            let _ = self.stop(pid);
        }

        while !self.procs.is_empty() && begun.elapsed() < deadline {
            self.reap();
            let overdue: Vec<i32> = self
                .procs
                .values()
                .filter(|p| p.stopped.is_some_and(|s| s.elapsed() >= p.timeout))
                .map(|p| p.pid)
                .collect();
            for pid in overdue {
                let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
            }
            if self.procs.is_empty() {
                break;
            }
            std::thread::sleep(TEARDOWN_POLL);
        }
        self.reap();
        if !self.procs.is_empty() {
            tracing::error!(survivors = self.procs.len(), "teardown left live children");
        }
    }

    /// Forgets everything. A freshly forked child calls this so it
    /// never acts on the parent's records.
    pub fn clear(&mut self) {
        self.procs.clear();
        self.tick_reaped.clear();
        self.ended.clear();
    }

    /// The recently ended processes, newest last.
    pub fn recently_ended(&self) -> impl Iterator<Item = &EndedProcess> {
        self.ended.iter()
    }

    fn collect(&mut self, pid: i32, exit: ExitKind) {
        let (group, runtime) = match self.procs.remove(&pid) {
            Some(p) => (p.group, p.started.elapsed()),
            // A pid we never registered (e.g. an early death already
            // handled in fork) still gets reported.
            None => (String::from("unknown"), Duration::ZERO),
        };
        let (exit_code, signal) = match exit {
            ExitKind::Exited(code) => (Some(code), None),
            ExitKind::Signaled(sig) => (None, Some(sig)),
            ExitKind::Unknown => (None, None),
        };
        self.tick_reaped.push(ReapedChild {
            pid,
            group: group.clone(),
            exit_code,
            signal,
        });
        if self.ended.len() == ENDED_RING {
            self.ended.pop_front();
        }
        self.ended.push_back(EndedProcess {
            pid,
            group,
            runtime,
            exit,
        });
    }
}

/// Serializes tests that fork or reap: `waitpid(-1)` collects any
/// child of the test process, so concurrent reapers steal from each
/// other.
#[cfg(test)]
pub(crate) static TEST_REAP_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_floor_applies() {
        let p = Process::new(1, "w", Duration::from_secs(5));
        assert_eq!(p.timeout(), MIN_PROCESS_TIMEOUT);
        let p = Process::new(1, "w", Duration::from_secs(90));
        assert_eq!(p.timeout(), Duration::from_secs(90));
    }

    #[test]
    fn count_and_find_by_group() {
        let mut table = ProcessTable::new();
        table.procs.insert(10, Process::new(10, "alpha", MIN_PROCESS_TIMEOUT));
        table.procs.insert(11, Process::new(11, "alpha", MIN_PROCESS_TIMEOUT));
        table.procs.insert(12, Process::new(12, TASK_GROUP, MIN_PROCESS_TIMEOUT));

        assert_eq!(table.count(None), 3);
        assert_eq!(table.count(Some("alpha")), 2);
        assert_eq!(table.count(Some("beta")), 0);

        assert!(table.find(10, None).is_some());
        assert!(table.find(10, Some("alpha")).is_some());
        assert!(table.find(10, Some(TASK_GROUP)).is_none());
        assert_eq!(table.pids("alpha"), vec![10, 11]);
    }

    #[test]
    fn collect_records_ring_and_reaped() {
        let mut table = ProcessTable::new();
        table.procs.insert(20, Process::new(20, "w", MIN_PROCESS_TIMEOUT));
        table.collect(20, ExitKind::Exited(0));
        table.collect(21, ExitKind::Signaled(9));

        let reaped = table.take_reaped();
        assert_eq!(reaped.len(), 2);
        assert_eq!(reaped[0].pid, 20);
        assert_eq!(reaped[0].exit_code, Some(0));
        assert_eq!(reaped[1].signal, Some(9));
        assert_eq!(reaped[1].group, "unknown");
        assert!(table.take_reaped().is_empty());
        assert_eq!(table.recently_ended().count(), 2);
    }

    #[test]
    fn ended_ring_is_bounded() {
        let mut table = ProcessTable::new();
        for pid in 0..(ENDED_RING as i32 + 10) {
            table.collect(pid, ExitKind::Exited(0));
        }
        assert_eq!(table.recently_ended().count(), ENDED_RING);
        let _ = table.take_reaped();
    }

    #[test]
    fn kill_unknown_pid_errors() {
        let mut table = ProcessTable::new();
        assert!(table.kill(424_242, Signal::SIGTERM).is_err());
        assert!(table.stop(424_242).is_err());
    }

    #[test]
    fn fork_and_reap_child() {
        let _serial = TEST_REAP_LOCK.lock().unwrap();
        let mut table = ProcessTable::new();
        match table.fork("w", MIN_PROCESS_TIMEOUT).unwrap() {
            Forked::Child => std::process::exit(0),
            Forked::Parent(pid) => {
                assert!(table.find(pid, Some("w")).is_some());
                // The child exits immediately; sweep until collected.
                let begun = Instant::now();
                while table.count(None) > 0 && begun.elapsed() < Duration::from_secs(5) {
                    table.reap();
                    std::thread::sleep(Duration::from_millis(10));
                }
                let reaped = table.take_reaped();
                assert_eq!(reaped.len(), 1);
                assert_eq!(reaped[0].pid, pid);
                assert_eq!(reaped[0].exit_code, Some(0));
            }
            Forked::Failed => {
                // Child exited before registration; equally fine here.
            }
        }
    }

    #[test]
    fn fork_task_runs_and_exits() {
        let _serial = TEST_REAP_LOCK.lock().unwrap();
        let mut table = ProcessTable::new();
        let pid = table.fork_task(Box::new(|| {})).unwrap();
        if let Some(pid) = pid {
            assert_eq!(table.count(Some(TASK_GROUP)), 1);
            let begun = Instant::now();
            while table.count(None) > 0 && begun.elapsed() < Duration::from_secs(5) {
                table.reap();
                std::thread::sleep(Duration::from_millis(10));
            }
            assert!(table.take_reaped().iter().any(|r| r.pid == pid));
        }
    }
}
