//! Work branch: the worker pool around one shared task deque.
//!
//! # Architecture
//!
//! ```text
//!                      ┌────────────────────────────────────────────────┐
//!                      │                  WorkBranch                    │
//!  Producers ─────────►│  TaskQueue  (push_back / push_front)           │
//!  (submit*)           │      │                                         │
//!                      │      ▼ try_pop                                 │
//!                      │  ┌─────────┐  ┌─────────┐      ┌─────────┐     │
//!                      │  │worker 0 │  │worker 1 │ ...  │worker N │     │
//!                      │  └────┬────┘  └────┬────┘      └────┬────┘     │
//!                      │       └────────────┴─────────┬──────┘          │
//!                      │                              ▼                 │
//!                      │  Mutex<WorkerRegistry> + phase/ticket atomics  │
//!                      │  condvars: task · idle · resume · ack · retire │
//!                      └────────────────────────────────────────────────┘
//! ```
//!
//! # Concurrency model
//!
//! One non-recursive mutex (around the [`WorkerRegistry`]) guards every
//! registry mutation and every state transition that must be observed
//! together with one. The five condition variables all pair with that mutex.
//! State read on worker fast paths (the phase and the three counters) is
//! atomic and read without the lock; it is only ever *written* under the
//! lock.
//!
//! The task deque synchronizes itself. For the `Blocking` strategy the
//! push and the `notify_one` happen under the branch lock, so a worker
//! sitting between its predicate check and its sleep cannot miss the
//! wakeup. The spinning strategies skip the lock entirely on submit.
//!
//! # Worker loop
//!
//! Each worker repeats: retirement check → non-blocking pop (execute on
//! success, then straight back to the pop) → barrier park if quiescence is
//! engaged → idle wait per the branch's [`WaitStrategy`].
//!
//! # Invariants
//!
//! - registry size == live (un-retired) worker threads
//! - a worker is busy iff it is inside a popped task body
//! - `pending_deletions ≤ registry size`
//! - once `Destructing` is observed, every worker retires and every thread
//!   handle is joined; no thread is ever detached
//! - the barrier gathers with `idle_workers ≥ registry size` (`≥` because
//!   workers may retire while the barrier is engaged)

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;

use crate::queue::TaskQueue;
use crate::registry::{WorkerId, WorkerRegistry};
use crate::task::{self, Priority, Task, TaskHandle};
use crate::wait::{IdleSpin, WaitStrategy};

// ---------------------------------------------------------------------------
// Branch phase
// ---------------------------------------------------------------------------

/// Lifecycle phase of a branch, one tagged value instead of independent
/// flags so impossible combinations (destructing ∧ waiting) cannot exist.
/// The orthogonal "deleting" condition is simply `pending_deletions > 0`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum BranchPhase {
    /// Normal dispatch.
    Running = 0,
    /// Quiescence barrier engaged: idle workers park until release.
    Waiting = 1,
    /// Teardown begun: no new submissions, every worker retires.
    Destructing = 2,
}

impl BranchPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => BranchPhase::Running,
            1 => BranchPhase::Waiting,
            2 => BranchPhase::Destructing,
            _ => unreachable!("invalid branch phase {v}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Point-in-time task counters for one branch.
///
/// `panicked` counts failures reported to the error sink at worker scope;
/// future-bearing failures travel through their handles instead and are not
/// counted here. A sequence group counts as one executed task.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BranchStats {
    pub tasks_submitted: u64,
    pub tasks_executed: u64,
    pub tasks_panicked: u64,
}

#[derive(Default)]
struct StatsCells {
    submitted: AtomicU64,
    executed: AtomicU64,
    panicked: AtomicU64,
}

impl StatsCells {
    fn snapshot(&self) -> BranchStats {
        BranchStats {
            tasks_submitted: self.submitted.load(Ordering::Relaxed),
            tasks_executed: self.executed.load(Ordering::Relaxed),
            tasks_panicked: self.panicked.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Core shared state
// ---------------------------------------------------------------------------

pub(crate) struct BranchCore {
    strategy: WaitStrategy,
    queue: TaskQueue<Task>,

    /// The branch lock. Registry mutations, phase transitions, and every
    /// condvar predicate go through it.
    registry: Mutex<WorkerRegistry>,

    next_worker_id: AtomicU64,
    phase: AtomicU8,

    /// Outstanding retirement tickets. Written under the lock, read on the
    /// worker fast path without it.
    pending_deletions: CachePadded<AtomicUsize>,
    /// Workers parked at the quiescence barrier in the current cycle.
    idle_workers: CachePadded<AtomicUsize>,
    /// Workers that acknowledged barrier release in the current cycle.
    resumed_workers: CachePadded<AtomicUsize>,

    /// Blocking-strategy workers wait here for work or a state change.
    task_cv: Condvar,
    /// `wait_tasks` waits here for the barrier to fill.
    idle_cv: Condvar,
    /// Barrier-parked workers wait here for release.
    resume_cv: Condvar,
    /// `wait_tasks` waits here for release acknowledgements.
    resume_ack_cv: Condvar,
    /// `del_worker` and teardown wait here for tickets to drain.
    retire_cv: Condvar,

    stats: StatsCells,
}

impl BranchCore {
    #[inline]
    fn phase(&self) -> BranchPhase {
        BranchPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Callers hold the branch lock for every phase transition.
    #[inline]
    fn set_phase(&self, phase: BranchPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    pub(crate) fn num_workers(&self) -> usize {
        self.registry.lock().expect("branch lock poisoned").len()
    }

    pub(crate) fn num_tasks(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn count_idle_workers(&self, min_idle_age: Duration) -> usize {
        self.registry
            .lock()
            .expect("branch lock poisoned")
            .count_idle(min_idle_age, Instant::now())
    }

    pub(crate) fn count_busy_workers(&self) -> usize {
        self.registry
            .lock()
            .expect("branch lock poisoned")
            .count_busy()
    }

    fn enqueue(&self, priority: Priority, task: Task) {
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);

        if self.strategy == WaitStrategy::Blocking {
            // Push under the branch lock so the notify cannot slip between a
            // blocking worker's predicate check and its sleep.
            let _reg = self.registry.lock().expect("branch lock poisoned");
            match priority {
                Priority::Normal => self.queue.push_back(task),
                Priority::Urgent => self.queue.push_front(task),
            }
            self.task_cv.notify_one();
        } else {
            match priority {
                Priority::Normal => self.queue.push_back(task),
                Priority::Urgent => self.queue.push_front(task),
            }
        }
    }

    /// Spawn `n` workers. No-op once teardown has begun.
    pub(crate) fn add_worker(self: &Arc<Self>, n: usize) {
        let mut reg = self.registry.lock().expect("branch lock poisoned");
        if self.phase() == BranchPhase::Destructing {
            return;
        }
        for _ in 0..n {
            let id = WorkerId(self.next_worker_id.fetch_add(1, Ordering::Relaxed));
            let core = Arc::clone(self);
            let handle = thread::Builder::new()
                .name(format!("branch-{id}"))
                .spawn(move || worker_loop(core, id))
                .expect("failed to spawn worker thread");
            reg.insert(id, handle);
        }
    }

    /// Retire up to `n` workers, capped at the current worker count, and
    /// block until exactly that many have exited. Which workers retire is
    /// unspecified; all are fungible. The retired threads are joined before
    /// returning.
    pub(crate) fn del_worker(&self, n: usize) {
        let mut reg = self.registry.lock().expect("branch lock poisoned");
        let n = n.min(reg.len());
        if n == 0 {
            return;
        }

        self.pending_deletions.fetch_add(n, Ordering::Release);
        if self.strategy == WaitStrategy::Blocking {
            self.task_cv.notify_all();
        }

        reg = self
            .retire_cv
            .wait_while(reg, |_| self.pending_deletions.load(Ordering::Acquire) > 0)
            .expect("branch lock poisoned");

        let handles = reg.drain_reaped();
        drop(reg);
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Quiescence barrier. See [`WorkBranch::wait_tasks`].
    fn wait_tasks(&self, timeout: Duration) -> bool {
        if self.phase() == BranchPhase::Destructing {
            return false;
        }

        let reg = self.registry.lock().expect("branch lock poisoned");

        self.idle_workers.store(0, Ordering::Relaxed);
        self.set_phase(BranchPhase::Waiting);
        if self.strategy == WaitStrategy::Blocking {
            self.task_cv.notify_all();
        }

        // Gather: every worker parked. `≥` rather than `==` because workers
        // may claim retirement tickets (shrinking the registry) mid-wait.
        let (reg, timeout_result) = self
            .idle_cv
            .wait_timeout_while(reg, timeout, |reg| {
                self.idle_workers.load(Ordering::Relaxed) < reg.len()
            })
            .expect("branch lock poisoned");
        let all_idle = !timeout_result.timed_out();

        // Release: even on timeout, parked workers must be let go.
        self.set_phase(BranchPhase::Running);
        self.resume_cv.notify_all();

        // Ack: do not return to the caller until every parked worker has
        // woken, otherwise a back-to-back wait_tasks could re-engage the
        // barrier before stragglers left the previous one.
        let reg = self
            .resume_ack_cv
            .wait_while(reg, |_| {
                self.resumed_workers.load(Ordering::Relaxed)
                    < self.idle_workers.load(Ordering::Relaxed)
            })
            .expect("branch lock poisoned");
        self.resumed_workers.store(0, Ordering::Relaxed);
        drop(reg);

        all_idle
    }

    fn stats(&self) -> BranchStats {
        self.stats.snapshot()
    }
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

/// Claim a retirement ticket if any are outstanding. On success the worker
/// has removed itself from the registry and must exit immediately.
fn try_retire(core: &BranchCore, id: WorkerId) -> bool {
    let mut reg = core.registry.lock().expect("branch lock poisoned");
    if core.pending_deletions.load(Ordering::Acquire) == 0 {
        return false;
    }

    core.pending_deletions.fetch_sub(1, Ordering::Release);
    reg.retire(id);

    // A shrinking registry can satisfy an engaged barrier.
    if core.phase() == BranchPhase::Waiting {
        core.idle_cv.notify_one();
    }
    core.retire_cv.notify_all();
    true
}

/// Park at the quiescence barrier until `wait_tasks` releases it.
fn park_at_barrier(core: &BranchCore) {
    let reg = core.registry.lock().expect("branch lock poisoned");

    // The unlocked phase read that sent us here may be stale; only count
    // ourselves idle while the barrier is genuinely engaged, so the
    // idle/resumed accounting never leaks across barrier cycles.
    if core.phase() != BranchPhase::Waiting {
        return;
    }

    core.idle_workers.fetch_add(1, Ordering::Relaxed);
    core.idle_cv.notify_one();

    let _reg = core
        .resume_cv
        .wait_while(reg, |_| core.phase() == BranchPhase::Waiting)
        .expect("branch lock poisoned");

    core.resumed_workers.fetch_add(1, Ordering::Relaxed);
    core.resume_ack_cv.notify_one();
}

/// Blocking-strategy idle wait: sleep until there is work or branch state
/// changed (tickets outstanding, barrier engaged, or teardown).
fn blocking_wait(core: &BranchCore) {
    let reg = core.registry.lock().expect("branch lock poisoned");
    let _reg = core
        .task_cv
        .wait_while(reg, |_| {
            core.queue.is_empty()
                && core.pending_deletions.load(Ordering::Acquire) == 0
                && core.phase() == BranchPhase::Running
        })
        .expect("branch lock poisoned");
}

fn worker_loop(core: Arc<BranchCore>, id: WorkerId) {
    let mut spin = IdleSpin::default();

    loop {
        // 1. Retirement: tickets outstanding or teardown begun.
        if core.phase() == BranchPhase::Destructing
            || core.pending_deletions.load(Ordering::Acquire) > 0
        {
            if try_retire(&core, id) {
                return;
            }
        }

        // 2. Dispatch. The pop comes before the barrier check: an engaged
        // barrier drains the queue before anyone parks, which is what lets
        // wait_tasks promise an empty queue on success.
        if let Some(task) = core.queue.try_pop() {
            core.registry
                .lock()
                .expect("branch lock poisoned")
                .mark_busy(id);

            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                core.stats.panicked.fetch_add(1, Ordering::Relaxed);
                task::log_task_panic(payload.as_ref());
            }
            core.stats.executed.fetch_add(1, Ordering::Relaxed);
            spin.reset();

            core.registry
                .lock()
                .expect("branch lock poisoned")
                .mark_idle(id);
            continue;
        }

        // 3. Barrier park.
        if core.phase() == BranchPhase::Waiting {
            park_at_barrier(&core);
            continue;
        }

        // 4. Idle wait per strategy.
        if core.strategy == WaitStrategy::Blocking {
            blocking_wait(&core);
        } else {
            spin.idle_round(core.strategy);
        }
    }
}

// ---------------------------------------------------------------------------
// Public surface
// ---------------------------------------------------------------------------

/// A pool of worker threads pulling from one shared task deque.
///
/// Producers submit from any thread through `&self`. Worker count changes
/// go through the crate-internal `add_worker` / `del_worker` used by the
/// [`crate::supervisor::Supervisor`]; most users want [`crate::DynBranch`],
/// which composes both.
///
/// Dropping the branch begins teardown: in-flight tasks run to completion,
/// every worker retires and is joined, and queued-but-unstarted tasks are
/// dropped (their handles resolve to [`crate::TaskError::Abandoned`]).
pub struct WorkBranch {
    core: Arc<BranchCore>,
}

impl WorkBranch {
    /// Build a branch with `initial_workers` threads (clamped up to 1) and
    /// the given idle-wait strategy. Workers are spawned synchronously.
    pub fn new(initial_workers: usize, strategy: WaitStrategy) -> Self {
        let core = Arc::new(BranchCore {
            strategy,
            queue: TaskQueue::new(),
            registry: Mutex::new(WorkerRegistry::default()),
            next_worker_id: AtomicU64::new(0),
            phase: AtomicU8::new(BranchPhase::Running as u8),
            pending_deletions: CachePadded::new(AtomicUsize::new(0)),
            idle_workers: CachePadded::new(AtomicUsize::new(0)),
            resumed_workers: CachePadded::new(AtomicUsize::new(0)),
            task_cv: Condvar::new(),
            idle_cv: Condvar::new(),
            resume_cv: Condvar::new(),
            resume_ack_cv: Condvar::new(),
            retire_cv: Condvar::new(),
            stats: StatsCells::default(),
        });
        core.add_worker(initial_workers.max(1));
        Self { core }
    }

    /// Fire-and-forget, normal priority: append at the queue tail.
    ///
    /// A panicking body is reported to the error sink with the worker's
    /// thread id; the worker continues.
    pub fn submit<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.core.enqueue(Priority::Normal, Box::new(f));
    }

    /// Fire-and-forget, urgent: prepend at the queue head, ahead of every
    /// queued normal task. No ordering among urgents.
    pub fn submit_urgent<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.core.enqueue(Priority::Urgent, Box::new(f));
    }

    /// Enqueue an ordered group as one tail task: the callables run on a
    /// single worker, in order, each under its own panic scope.
    ///
    /// # Panics
    ///
    /// Panics if `tasks` is empty.
    pub fn submit_sequence(&self, tasks: Vec<Task>) {
        self.core.enqueue(Priority::Normal, task::sequence(tasks));
    }

    /// Normal-priority submission returning a [`TaskHandle`] for the result.
    ///
    /// The handle always resolves: to the value, to the task's panic, or
    /// to [`crate::TaskError::Abandoned`] if the branch is destroyed first.
    pub fn submit_future<R, F>(&self, f: F) -> TaskHandle<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let (task, handle) = task::future_task(f);
        self.core.enqueue(Priority::Normal, task);
        handle
    }

    /// Urgent-priority variant of [`WorkBranch::submit_future`].
    pub fn submit_urgent_future<R, F>(&self, f: F) -> TaskHandle<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let (task, handle) = task::future_task(f);
        self.core.enqueue(Priority::Urgent, task);
        handle
    }

    /// Quiescence barrier: block until every worker has finished its task,
    /// drained the queue, and parked, or until `timeout` expires.
    ///
    /// Returns true iff full quiescence was reached in time; at that
    /// instant the queue is empty and every worker is idle. Either way, all
    /// parked workers are released and their release acknowledged before
    /// this returns. Returns false immediately if teardown already began.
    pub fn wait_tasks(&self, timeout: Duration) -> bool {
        self.core.wait_tasks(timeout)
    }

    /// Live worker count.
    pub fn num_workers(&self) -> usize {
        self.core.num_workers()
    }

    /// Queued (not yet started) task count. Weakly consistent.
    pub fn num_tasks(&self) -> usize {
        self.core.num_tasks()
    }

    /// Workers idle for at least `min_idle_age`.
    pub fn count_idle_workers(&self, min_idle_age: Duration) -> usize {
        self.core.count_idle_workers(min_idle_age)
    }

    /// Workers currently inside a task body.
    pub fn count_busy_workers(&self) -> usize {
        self.core.count_busy_workers()
    }

    /// Task counters since construction.
    pub fn stats(&self) -> BranchStats {
        self.core.stats()
    }

    /// Non-owning handle for supervisor registration.
    pub(crate) fn handle(&self) -> BranchHandle {
        BranchHandle {
            core: Arc::downgrade(&self.core),
        }
    }

    pub(crate) fn add_worker(&self, n: usize) {
        self.core.add_worker(n);
    }

    pub(crate) fn del_worker(&self, n: usize) {
        self.core.del_worker(n);
    }
}

impl Drop for WorkBranch {
    /// Teardown: every worker gets a retirement ticket, in-flight tasks run
    /// to completion, and every thread is joined. The last retiring worker
    /// signals the retirement condvar; nothing polls.
    fn drop(&mut self) {
        let core = &self.core;
        let mut reg = core.registry.lock().expect("branch lock poisoned");

        core.pending_deletions
            .store(reg.len(), Ordering::Release);
        core.set_phase(BranchPhase::Destructing);
        core.task_cv.notify_all();
        // Any worker still parked at a released barrier re-checks its
        // predicate against the new phase.
        core.resume_cv.notify_all();

        reg = core
            .retire_cv
            .wait_while(reg, |reg| !reg.is_empty())
            .expect("branch lock poisoned");

        let handles = reg.drain_reaped();
        drop(reg);
        for handle in handles {
            let _ = handle.join();
        }
    }
}

/// Weak reference to a branch core, held by the supervisor's registry.
/// Upgrading fails once the branch owner dropped it; the supervisor prunes
/// such entries instead of keeping a dead branch alive.
#[derive(Clone)]
pub(crate) struct BranchHandle {
    core: Weak<BranchCore>,
}

impl BranchHandle {
    pub(crate) fn upgrade(&self) -> Option<Arc<BranchCore>> {
        self.core.upgrade()
    }

    /// Identity comparison for idempotent re-registration.
    pub(crate) fn same_branch(&self, other: &BranchHandle) -> bool {
        Weak::ptr_eq(&self.core, &other.core)
    }
}
