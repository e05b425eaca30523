//! Forking strategies.
//!
//! When to create more worker children is a policy decision driven by
//! the daemon's cadence: a slow loop can afford to fork lazily on
//! demand, a tight loop wants its full complement of workers standing
//! by before calls pile up.

use std::time::Duration;

/// Governs when the mediator creates additional workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkStrategy {
    /// Fork one worker only when there are more active calls than
    /// workers.
    Lazy,
    /// Fork up to the maximum as soon as any call is active.
    Mixed,
    /// Keep the maximum number of workers alive at all times.
    Aggressive,
}

impl ForkStrategy {
    /// The default strategy for a daemon with the given loop interval:
    /// `Lazy` for free-running or leisurely loops (zero or over 2 s),
    /// `Mixed` over 1 s, `Aggressive` otherwise.
    #[must_use]
    pub fn for_interval(interval: Duration) -> Self {
        if interval.is_zero() || interval > Duration::from_secs(2) {
            Self::Lazy
        } else if interval > Duration::from_secs(1) {
            Self::Mixed
        } else {
            Self::Aggressive
        }
    }

    /// How many forks to perform right now, given `active` in-flight
    /// calls, `procs` live workers, and the `max` worker bound. Never
    /// asks for more than `max - procs`.
    #[must_use]
    pub fn forks_needed(self, active: usize, procs: usize, max: usize) -> usize {
        let headroom = max.saturating_sub(procs);
        let want = match self {
            Self::Lazy => usize::from(active > procs),
            Self::Mixed => {
                if active > 0 {
                    headroom
                } else {
                    0
                }
            }
            Self::Aggressive => headroom,
        };
        want.min(headroom)
    }
}
