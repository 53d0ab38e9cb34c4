//! Worker registry: identity and bookkeeping for live workers.
//!
//! # Purpose
//!
//! The branch-lock-protected map from worker id to worker record. It owns
//! exactly the per-worker state the branch and supervisor need to observe:
//! the busy flag, the last busy→idle transition time, and the OS thread
//! handle. It does not own the task queue.
//!
//! # Locking
//!
//! Every method here is called with the branch lock held (the registry
//! lives inside the branch's `Mutex`). Nothing in this module synchronizes
//! on its own.
//!
//! # Thread-handle ownership
//!
//! Handles are owned uniquely by their registry entry and are always
//! joined, never detached. A worker cannot join itself, so retirement is
//! two-phase: [`WorkerRegistry::retire`] (called by the retiring worker)
//! moves the handle from the live map into a reap list, and whoever was
//! waiting on the retirement (`del_worker` or branch teardown) drains the
//! list with [`WorkerRegistry::drain_reaped`] and joins outside the lock.

use std::collections::HashMap;
use std::fmt;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Unique, monotonically assigned worker identity.
///
/// Ids are never reused within a branch; the branch hands them out from an
/// atomic counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub(crate) u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Per-worker bookkeeping.
pub(crate) struct WorkerRecord {
    /// True iff the worker is executing the body of a popped task.
    busy: bool,
    /// Updated on every busy→idle transition; the supervisor measures
    /// idle-age against this.
    last_active: Instant,
    /// The worker's OS thread, owned uniquely by this entry.
    handle: JoinHandle<()>,
}

/// Lock-protected set of live workers plus the reap list of retired
/// handles awaiting join.
#[derive(Default)]
pub(crate) struct WorkerRegistry {
    workers: HashMap<WorkerId, WorkerRecord>,
    reaped: Vec<JoinHandle<()>>,
}

impl WorkerRegistry {
    pub(crate) fn len(&self) -> usize {
        self.workers.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Register a freshly spawned worker.
    pub(crate) fn insert(&mut self, id: WorkerId, handle: JoinHandle<()>) {
        let previous = self.workers.insert(
            id,
            WorkerRecord {
                busy: false,
                last_active: Instant::now(),
                handle,
            },
        );
        debug_assert!(previous.is_none(), "worker id reused: {id}");
    }

    /// Mark a worker as executing a task.
    pub(crate) fn mark_busy(&mut self, id: WorkerId) {
        self.record_mut(id).busy = true;
    }

    /// Mark a worker idle and stamp its last-active time.
    pub(crate) fn mark_idle(&mut self, id: WorkerId) {
        let record = self.record_mut(id);
        record.busy = false;
        record.last_active = Instant::now();
    }

    /// Remove a worker that claimed a retirement ticket, parking its thread
    /// handle on the reap list for a later out-of-lock join.
    pub(crate) fn retire(&mut self, id: WorkerId) {
        let record = self
            .workers
            .remove(&id)
            .expect("retiring worker not in registry");
        self.reaped.push(record.handle);
    }

    /// Take every handle parked by retired workers. Callers join these
    /// after releasing the branch lock.
    pub(crate) fn drain_reaped(&mut self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut self.reaped)
    }

    /// Workers currently idle for at least `min_idle_age`.
    pub(crate) fn count_idle(&self, min_idle_age: Duration, now: Instant) -> usize {
        self.workers
            .values()
            .filter(|w| !w.busy && now.duration_since(w.last_active) >= min_idle_age)
            .count()
    }

    /// Workers currently executing a task body.
    pub(crate) fn count_busy(&self) -> usize {
        self.workers.values().filter(|w| w.busy).count()
    }

    fn record_mut(&mut self, id: WorkerId) -> &mut WorkerRecord {
        self.workers
            .get_mut(&id)
            .expect("worker record missing from registry")
    }
}
