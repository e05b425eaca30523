//! Async-signal-safe plumbing.
//!
//! Handlers do exactly one thing: bump a per-signal atomic counter.
//! The main loop drains the counters between ticks and turns them into
//! `signal` events, so everything a signal "does" happens at a safe
//! point in the next iteration.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};

use crate::error::{CoreError, Result};

const MAX_SIGNO: usize = 64;

static COUNTS: [AtomicU32; MAX_SIGNO] = [const { AtomicU32::new(0) }; MAX_SIGNO];

extern "C" fn note_signal(signo: libc::c_int) {
    let idx = signo as usize;
    if idx < MAX_SIGNO {
        COUNTS[idx].fetch_add(1, Ordering::Relaxed);
    }
}

/// The signal set a stoker daemon always watches.
pub const WATCHED: &[Signal] = &[
    Signal::SIGTERM,
    Signal::SIGINT,
    Signal::SIGHUP,
    Signal::SIGUSR1,
    Signal::SIGCHLD,
    Signal::SIGALRM,
];

/// Installed counting handlers. Dropping does not uninstall; a daemon
/// installs once for its lifetime.
#[derive(Debug)]
pub struct SignalWatcher {
    watched: Vec<Signal>,
}

impl SignalWatcher {
    /// Installs counting handlers for [`WATCHED`] plus `extra`.
    ///
    /// Handlers are installed without `SA_RESTART` on purpose: a
    /// delivery must interrupt the scheduler's sleep.
    ///
    /// # Errors
    /// `sigaction` failures.
    pub fn install(extra: &[Signal]) -> Result<Self> {
        let mut watched: Vec<Signal> = WATCHED.to_vec();
        for sig in extra {
            if !watched.contains(sig) {
                watched.push(*sig);
            }
        }
        let action = SigAction::new(
            SigHandler::Handler(note_signal),
            SaFlags::empty(),
            SigSet::empty(),
        );
        for sig in &watched {
            unsafe { sigaction(*sig, &action) }
                .map_err(|e| CoreError::Signal(format!("sigaction({sig}): {e}")))?;
        }
        Ok(Self { watched })
    }

    /// The signals this watcher counts.
    #[must_use]
    pub fn watched(&self) -> &[Signal] {
        &self.watched
    }

    /// Takes all pending deliveries as `(signo, count)` pairs, in
    /// ascending signal order.
    #[must_use]
    pub fn drain(&self) -> Vec<(i32, u32)> {
        let mut out = Vec::new();
        for sig in &self.watched {
            let idx = *sig as usize;
            let count = COUNTS[idx].swap(0, Ordering::Relaxed);
            if count > 0 {
                out.push((idx as i32, count));
            }
        }
        out
    }

    /// Pending deliveries of one signal, without clearing.
    #[must_use]
    pub fn pending(sig: Signal) -> u32 {
        COUNTS[sig as usize].load(Ordering::Relaxed)
    }

    /// Clears one signal's pending count.
    pub fn clear(sig: Signal) {
        COUNTS[sig as usize].store(0, Ordering::Relaxed);
    }
}

/// Blocks `SIGCHLD` delivery until [`unblock_sigchld`] runs.
///
/// Workers exiting during the scheduler's sleep must not cause an
/// early wakeup; every other signal still interrupts it.
pub fn block_sigchld() {
    let mut set = SigSet::empty();
    set.add(Signal::SIGCHLD);
    let _ = nix::sys::signal::sigprocmask(SigmaskHow::SIG_BLOCK, Some(&set), None);
}

/// Re-enables `SIGCHLD` delivery; a blocked pending delivery arrives
/// immediately and is counted as usual.
pub fn unblock_sigchld() {
    let mut set = SigSet::empty();
    set.add(Signal::SIGCHLD);
    let _ = nix::sys::signal::sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&set), None);
}

/// Sleeps up to `dur`, returning early when any unblocked signal is
/// delivered. Returns true when the sleep ran to completion.
///
/// `std::thread::sleep` retries on `EINTR`, which is exactly wrong
/// here, so this goes straight to `nanosleep(2)`.
pub fn interruptible_sleep(dur: Duration) -> bool {
    let ts = libc::timespec {
        tv_sec: dur.as_secs() as libc::time_t,
        tv_nsec: libc::c_long::from(dur.subsec_nanos()),
    };
    let rc = unsafe { libc::nanosleep(&ts, std::ptr::null_mut()) };
    rc == 0
}

/// Serializes tests that raise real signals: the counters are
/// process-global, so concurrent drains would steal deliveries.
#[cfg(test)]
pub(crate) static TEST_SIGNAL_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
