//! Supervisor: the autoscaling control loop.
//!
//! # Purpose
//!
//! A single control thread that periodically inspects every registered
//! branch and applies the scaling policy in [`crate::scale`]: cap worker
//! counts that exceed their ceiling, grow into backlog, retire idle-aged
//! workers toward the floor.
//!
//! # Cadence
//!
//! Two different clocks, deliberately:
//!
//! - **Control passes** run every ~1 ms, always. This is what makes
//!   scale-up responsive to a burst.
//! - **The tick callback** fires at most once per effective tick interval,
//!   after a pass. [`Supervisor::suspend`] stretches only this gate;
//!   control passes keep running while suspended. [`Supervisor::proceed`]
//!   restores the configured interval.
//!
//! # Failure containment
//!
//! A panic escaping a control pass is caught, logged with the supervisor's
//! thread id, and the loop continues; a sick branch cannot kill
//! supervision for the healthy ones. Branches that have been dropped are
//! pruned from the registry on the next pass.
//!
//! # Lifetime
//!
//! The supervisor owns its thread and joins it on drop. It holds only
//! non-owning handles to branches, so it never keeps a dead branch's state
//! alive. Callers must still drop the supervisor *before* the branches
//! it supervises (as [`crate::DynBranch`] does by construction) so no pass
//! can race a branch teardown.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::branch::BranchHandle;
use crate::scale::{self, BranchLimits, ScaleAction};
use crate::task::panic_message;
use crate::WorkBranch;

/// Sleep between control passes.
const PASS_INTERVAL: Duration = Duration::from_millis(1);

/// Default idle-age threshold for scale-down.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default tick-callback interval.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(1000);

struct SupervisedBranch {
    handle: BranchHandle,
    limits: BranchLimits,
}

struct State {
    branches: Vec<SupervisedBranch>,
    /// Effective tick gate (`suspend` stretches it, `proceed` restores it).
    tick_gate: Duration,
    /// Configured tick interval, restored by `proceed`.
    tick_interval: Duration,
    tick_cb: Option<Box<dyn FnMut() + Send>>,
}

struct Shared {
    stop: AtomicBool,
    state: Mutex<State>,
}

impl Shared {
    /// Lock the supervisor state, recovering from poisoning: a caught pass
    /// panic must not take the control loop down with it.
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Autoscaler for one or more [`WorkBranch`]es.
pub struct Supervisor {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
    default_idle_timeout: Duration,
}

impl Supervisor {
    /// Supervisor with the default idle timeout (5 s) and tick interval (1 s).
    pub fn new() -> Self {
        Self::with_intervals(DEFAULT_IDLE_TIMEOUT, DEFAULT_TICK_INTERVAL)
    }

    /// Supervisor with explicit intervals. The control thread starts
    /// immediately; it idles until a branch is registered.
    pub fn with_intervals(idle_timeout: Duration, tick_interval: Duration) -> Self {
        let shared = Arc::new(Shared {
            stop: AtomicBool::new(false),
            state: Mutex::new(State {
                branches: Vec::new(),
                tick_gate: tick_interval,
                tick_interval,
                tick_cb: None,
            }),
        });

        let loop_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("branch-supervisor".to_string())
            .spawn(move || control_loop(&loop_shared))
            .expect("failed to spawn supervisor thread");

        Self {
            shared,
            thread: Some(thread),
            default_idle_timeout: idle_timeout,
        }
    }

    /// Register `branch` with the given bounds, or update its bounds if it
    /// is already registered (idempotent re-registration: the last call
    /// wins entirely).
    ///
    /// # Panics
    ///
    /// Panics on invalid limits (`max == 0` or `min > max`).
    pub fn supervise(
        &self,
        branch: &WorkBranch,
        min_workers: usize,
        max_workers: usize,
        idle_timeout: Duration,
    ) {
        let limits = BranchLimits {
            min: min_workers,
            max: max_workers,
            idle_timeout,
        };
        limits.validate();

        let handle = branch.handle();
        let mut state = self.shared.state();
        if let Some(entry) = state
            .branches
            .iter_mut()
            .find(|b| b.handle.same_branch(&handle))
        {
            entry.limits = limits;
        } else {
            state.branches.push(SupervisedBranch { handle, limits });
        }
    }

    /// [`Supervisor::supervise`] with this supervisor's default idle timeout.
    pub fn supervise_default(&self, branch: &WorkBranch, min_workers: usize, max_workers: usize) {
        self.supervise(branch, min_workers, max_workers, self.default_idle_timeout);
    }

    /// Register with bounds derived from the core count:
    /// `min = ceil(cores × min_mult)`, `max = ceil(cores × max_mult)`.
    pub fn supervise_cpu_multiple(
        &self,
        branch: &WorkBranch,
        min_mult: f64,
        max_mult: f64,
        idle_timeout: Duration,
    ) {
        let cores = available_cores();
        self.supervise(
            branch,
            scale::cpu_scaled(cores, min_mult),
            scale::cpu_scaled(cores, max_mult),
            idle_timeout,
        );
    }

    /// Stretch the tick gate to `timeout`: the tick callback fires at most
    /// once per `timeout` until [`Supervisor::proceed`]. Control passes are
    /// unaffected: scaling continues while suspended.
    pub fn suspend(&self, timeout: Duration) {
        self.shared.state().tick_gate = timeout;
    }

    /// Restore the configured tick interval immediately.
    pub fn proceed(&self) {
        let mut state = self.shared.state();
        state.tick_gate = state.tick_interval;
    }

    /// Install the callback invoked at most once per tick interval, after a
    /// control pass. Replaces any previous callback.
    pub fn set_tick_cb<F>(&self, cb: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.shared.state().tick_cb = Some(Box::new(cb));
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Number of cores for the cpu-multiple forms, never zero.
pub(crate) fn available_cores() -> usize {
    thread::available_parallelism().map_or(1, |n| n.get())
}

// ---------------------------------------------------------------------------
// Control loop
// ---------------------------------------------------------------------------

fn control_loop(shared: &Shared) {
    let mut last_tick = Instant::now();

    while !shared.stop.load(Ordering::Acquire) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| control_pass(shared))) {
            tracing::error!(
                supervisor_thread = ?thread::current().id(),
                "control pass panicked: {}",
                panic_message(payload.as_ref())
            );
        }

        maybe_tick(shared, &mut last_tick);
        thread::sleep(PASS_INTERVAL);
    }
}

/// One scaling pass over every registered branch, under the supervisor
/// lock. Dropped branches are pruned; live ones get the policy's action.
fn control_pass(shared: &Shared) {
    let mut state = shared.state();
    state.branches.retain(|entry| {
        let Some(core) = entry.handle.upgrade() else {
            return false;
        };

        let workers = core.num_workers();
        let tasks = core.num_tasks();
        // Idle ages only matter on the shrink path; skip the registry scan
        // when there is backlog.
        let idle_aged = if tasks == 0 && workers > entry.limits.min {
            core.count_idle_workers(entry.limits.idle_timeout)
        } else {
            0
        };

        match scale::plan(workers, tasks, idle_aged, &entry.limits) {
            ScaleAction::Hold => {}
            ScaleAction::Grow(n) => core.add_worker(n),
            ScaleAction::Shrink(n) => core.del_worker(n),
        }
        true
    });
}

/// Fire the tick callback if the effective gate has elapsed. The callback
/// runs without the supervisor lock so it may call `suspend`, `proceed`,
/// or `supervise` itself.
fn maybe_tick(shared: &Shared, last_tick: &mut Instant) {
    let gate = {
        let state = shared.state();
        state.tick_gate
    };
    if last_tick.elapsed() < gate {
        return;
    }
    *last_tick = Instant::now();

    let cb = shared.state().tick_cb.take();
    if let Some(mut cb) = cb {
        cb();
        let mut state = shared.state();
        // Keep a callback installed mid-call by the callback itself.
        if state.tick_cb.is_none() {
            state.tick_cb = Some(cb);
        }
    }
}
