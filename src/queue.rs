//! Shared task deque.
//!
//! # Purpose
//!
//! The one structure producers and workers touch without the branch lock:
//! an unbounded, internally synchronized deque of opaque tasks. Normal
//! submissions append at the tail, urgent submissions jump the line at the
//! head, workers pop from the head without blocking.
//!
//! # Contract
//!
//! - `push_back` / `push_front`: unbounded, callable from any thread.
//! - `try_pop`: non-blocking; `None` means "empty right now", nothing more.
//! - `len`: weakly consistent snapshot. Readers (the supervisor's control
//!   pass, the blocking-strategy wake predicate) tolerate staleness of one
//!   concurrent push/pop.
//!
//! # Design
//!
//! A `Mutex<VecDeque>` with the length mirrored into an atomic so `len()`
//! never takes the lock. The critical sections are a handful of pointer
//! moves; under the submission rates this engine targets, deque contention
//! is invisible next to the task bodies themselves.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Thread-safe double-ended task queue.
///
/// Head = next to execute. Urgent tasks are pushed at the head, so they are
/// popped before any queued normal task, with no ordering among themselves.
pub struct TaskQueue<T> {
    items: Mutex<VecDeque<T>>,
    /// Mirror of `items.len()`, updated inside the critical section.
    ///
    /// Readers outside the lock see a value that was exact at some recent
    /// instant, which is all the `len` contract promises.
    len: AtomicUsize,
}

impl<T> TaskQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            len: AtomicUsize::new(0),
        }
    }

    /// Append at the tail (normal priority).
    pub fn push_back(&self, item: T) {
        let mut q = self.items.lock().expect("task queue poisoned");
        q.push_back(item);
        self.len.store(q.len(), Ordering::Release);
    }

    /// Prepend at the head (urgent priority).
    pub fn push_front(&self, item: T) {
        let mut q = self.items.lock().expect("task queue poisoned");
        q.push_front(item);
        self.len.store(q.len(), Ordering::Release);
    }

    /// Non-blocking pop from the head.
    pub fn try_pop(&self) -> Option<T> {
        let mut q = self.items.lock().expect("task queue poisoned");
        let item = q.pop_front();
        self.len.store(q.len(), Ordering::Release);
        item
    }

    /// Weakly consistent length snapshot. Never takes the lock.
    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
