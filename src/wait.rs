//! Worker idle-wait strategies.
//!
//! # Purpose
//!
//! What a worker does when the queue comes up empty. Three fixed tiers,
//! chosen per branch at construction:
//!
//! | Strategy | Behavior | Trade-off |
//! |----------|----------|-----------|
//! | `LowLatency` | cooperative yield, every round | lowest pickup latency, one core burned per idle worker |
//! | `Balance` | yield up to a spin budget, then ~1 ms sleeps | near-low-latency for bursty load, bounded idle burn |
//! | `Blocking` | condvar wait until work or a state change | zero idle burn, one wakeup of latency |
//!
//! The spin budget resets whenever the worker executes a task, so a worker
//! inside a burst stays in the cheap yield tier.
//!
//! The `Blocking` wait itself lives in the branch (it needs the branch lock
//! and condvar); this module owns the strategy choice and the spin
//! bookkeeping shared by the other two tiers.

use std::thread;
use std::time::Duration;

/// Per-branch policy for idle workers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WaitStrategy {
    /// Busy-yield. Minimal latency, maximal idle CPU.
    LowLatency,
    /// Busy-yield up to [`MAX_SPIN`] rounds, then short sleeps.
    Balance,
    /// Condition-variable wait until a task arrives or branch state changes.
    #[default]
    Blocking,
}

/// Spin rounds before `Balance` falls back to sleeping.
pub(crate) const MAX_SPIN: u32 = 10_000;

/// Sleep length once the spin budget is exhausted.
pub(crate) const SPIN_SLEEP: Duration = Duration::from_millis(1);

/// Spin-counter state for one worker.
///
/// Only meaningful for `LowLatency` and `Balance`; a `Blocking` worker never
/// consults it.
#[derive(Debug, Default)]
pub(crate) struct IdleSpin {
    rounds: u32,
}

impl IdleSpin {
    /// Call after executing a task: the next idle stretch starts cheap.
    #[inline]
    pub(crate) fn reset(&mut self) {
        self.rounds = 0;
    }

    /// One idle round under the given (non-blocking) strategy.
    pub(crate) fn idle_round(&mut self, strategy: WaitStrategy) {
        match strategy {
            WaitStrategy::LowLatency => thread::yield_now(),
            WaitStrategy::Balance => {
                if self.rounds < MAX_SPIN {
                    self.rounds += 1;
                    thread::yield_now();
                } else {
                    thread::sleep(SPIN_SLEEP);
                }
            }
            WaitStrategy::Blocking => {
                unreachable!("blocking strategy waits on the branch condvar")
            }
        }
    }
}
