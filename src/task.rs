//! Tasks, priorities, and result handles.
//!
//! # Purpose
//!
//! Everything that happens to a callable before it reaches the shared queue:
//! argument binding (closure capture), priority tagging, sequence
//! composition, and the one-shot promise/handle pair for future-bearing
//! submissions.
//!
//! # Failure model
//!
//! A task body may panic. What happens depends on how it was submitted:
//!
//! - **Fire-and-forget**: the panic is caught at worker scope, reported to
//!   the error sink with the worker's thread id, and the worker continues.
//! - **Future-bearing**: the panic is caught inside the task wrapper and
//!   carried to the consumer as [`TaskError::Panicked`] through the
//!   [`TaskHandle`]. Nothing is logged; the consumer owns the failure.
//! - **Sequence elements**: each element runs under its own panic scope, so
//!   a panicking element never skips its successors.
//!
//! No failure is fatal to the worker or the process.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use thiserror::Error;

/// An opaque, movable, one-shot unit of work.
///
/// All argument binding and result plumbing happens before construction;
/// by the time a `Task` reaches the queue it takes nothing and returns
/// nothing.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Queue placement for a submission.
///
/// `Urgent` tasks are enqueued at the head and therefore begin before any
/// queued `Normal` task, but carry no ordering guarantee among themselves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Priority {
    /// Tail of the queue, FIFO dequeue among normals.
    Normal,
    /// Head of the queue, jumps all queued normals.
    Urgent,
}

/// Why a future-bearing submission produced no value.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The task body panicked. The payload's message, if it had one.
    #[error("task panicked: {message}")]
    Panicked { message: String },

    /// The branch shut down before the task ran. Queued-but-unstarted tasks
    /// are dropped at branch destruction; their handles resolve to this
    /// instead of hanging their consumers.
    #[error("branch shut down before the task ran")]
    Abandoned,
}

/// Best-effort extraction of a panic payload's message.
///
/// `panic!("...")` payloads are `&str` or `String`; anything else gets a
/// placeholder.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

/// Error-sink entry for a fire-and-forget task failure.
///
/// One line per failure, tagged with the reporting worker's thread id.
pub(crate) fn log_task_panic(payload: &(dyn Any + Send)) {
    tracing::error!(
        worker_thread = ?std::thread::current().id(),
        "task panicked: {}",
        panic_message(payload)
    );
}

// ---------------------------------------------------------------------------
// One-shot promise / handle
// ---------------------------------------------------------------------------

enum HandleState<R> {
    Pending,
    Ready(Result<R, TaskError>),
    Taken,
}

struct HandleShared<R> {
    state: Mutex<HandleState<R>>,
    ready: Condvar,
}

/// Consumer side of a future-bearing submission.
///
/// Exactly one value (or failure) will arrive: when the task completes, when
/// it panics, or when the branch is destroyed before the task ran. Waiting
/// never deadlocks on an accepted submission.
pub struct TaskHandle<R> {
    shared: Arc<HandleShared<R>>,
}

impl<R> TaskHandle<R> {
    /// Whether a result is available without blocking.
    pub fn is_finished(&self) -> bool {
        !matches!(
            *self.shared.state.lock().expect("task handle poisoned"),
            HandleState::Pending
        )
    }

    /// Block until the task completes and take its result.
    pub fn wait(self) -> Result<R, TaskError> {
        let mut state = self.shared.state.lock().expect("task handle poisoned");
        loop {
            match std::mem::replace(&mut *state, HandleState::Taken) {
                HandleState::Ready(result) => return result,
                HandleState::Pending => {
                    *state = HandleState::Pending;
                    state = self
                        .shared
                        .ready
                        .wait(state)
                        .expect("task handle poisoned");
                }
                HandleState::Taken => panic!("task handle result already taken"),
            }
        }
    }

    /// Take the result if it arrived; `None` leaves the handle usable.
    pub fn try_wait(&mut self) -> Option<Result<R, TaskError>> {
        let mut state = self.shared.state.lock().expect("task handle poisoned");
        match std::mem::replace(&mut *state, HandleState::Taken) {
            HandleState::Ready(result) => Some(result),
            HandleState::Pending => {
                *state = HandleState::Pending;
                None
            }
            HandleState::Taken => panic!("task handle result already taken"),
        }
    }

    /// Block up to `timeout` for the result; `None` leaves the handle usable.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<Result<R, TaskError>> {
        let state = self.shared.state.lock().expect("task handle poisoned");
        let (mut state, _timed_out) = self
            .shared
            .ready
            .wait_timeout_while(state, timeout, |s| matches!(s, HandleState::Pending))
            .expect("task handle poisoned");

        match std::mem::replace(&mut *state, HandleState::Taken) {
            HandleState::Ready(result) => Some(result),
            HandleState::Pending => {
                *state = HandleState::Pending;
                None
            }
            HandleState::Taken => panic!("task handle result already taken"),
        }
    }
}

/// Producer side. Completes its handle exactly once; dropping an
/// uncompleted promise resolves the handle to [`TaskError::Abandoned`], so a
/// branch torn down with queued work never strands a waiting consumer.
pub(crate) struct Promise<R> {
    shared: Arc<HandleShared<R>>,
    completed: bool,
}

impl<R> Promise<R> {
    pub(crate) fn complete(mut self, result: Result<R, TaskError>) {
        self.deliver(result);
        self.completed = true;
    }

    fn deliver(&self, result: Result<R, TaskError>) {
        let mut state = self.shared.state.lock().expect("task handle poisoned");
        debug_assert!(
            matches!(*state, HandleState::Pending),
            "promise completed twice"
        );
        *state = HandleState::Ready(result);
        self.shared.ready.notify_all();
    }
}

impl<R> Drop for Promise<R> {
    fn drop(&mut self) {
        if !self.completed {
            self.deliver(Err(TaskError::Abandoned));
        }
    }
}

/// Create a linked promise/handle pair.
pub(crate) fn oneshot<R>() -> (Promise<R>, TaskHandle<R>) {
    let shared = Arc::new(HandleShared {
        state: Mutex::new(HandleState::Pending),
        ready: Condvar::new(),
    });
    (
        Promise {
            shared: Arc::clone(&shared),
            completed: false,
        },
        TaskHandle { shared },
    )
}

// ---------------------------------------------------------------------------
// Task wrappers (the invocation adapter)
// ---------------------------------------------------------------------------

/// Wrap a callable for future-bearing submission.
///
/// Returns the queue entry plus the consumer handle. A panic becomes
/// `Err(TaskError::Panicked)` on the handle instead of an error-sink entry.
pub(crate) fn future_task<R, F>(f: F) -> (Task, TaskHandle<R>)
where
    R: Send + 'static,
    F: FnOnce() -> R + Send + 'static,
{
    let (promise, handle) = oneshot();
    let task: Task = Box::new(move || {
        let result = panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
            TaskError::Panicked {
                message: panic_message(payload.as_ref()),
            }
        });
        promise.complete(result);
    });
    (task, handle)
}

/// Compose an ordered group of callables into one queue entry.
///
/// The group executes on a single worker, in submitted order, each element
/// under its own panic scope; a panicking element is reported and its
/// successors still run.
///
/// # Panics
///
/// Panics if `tasks` is empty (programmer error, caught at submission).
pub(crate) fn sequence(tasks: Vec<Task>) -> Task {
    assert!(!tasks.is_empty(), "sequence requires at least one callable");
    Box::new(move || {
        for task in tasks {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                log_task_panic(payload.as_ref());
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn handle_receives_value() {
        let (task, handle) = future_task(|| 41 + 1);
        task();
        assert_eq!(handle.wait().unwrap(), 42);
    }

    #[test]
    fn handle_receives_unit_value() {
        let (task, handle) = future_task(|| ());
        task();
        assert!(handle.wait().is_ok());
    }

    #[test]
    fn handle_carries_panic() {
        let (task, handle) = future_task::<u32, _>(|| panic!("boom"));
        task();
        match handle.wait() {
            Err(TaskError::Panicked { message }) => assert_eq!(message, "boom"),
            other => panic!("expected Panicked, got {other:?}"),
        }
    }

    #[test]
    fn dropped_task_resolves_handle_to_abandoned() {
        let (task, handle) = future_task(|| 7);
        drop(task);
        assert!(matches!(handle.wait(), Err(TaskError::Abandoned)));
    }

    #[test]
    fn try_wait_is_nonblocking() {
        let (task, mut handle) = future_task(|| 5);
        assert!(handle.try_wait().is_none());
        task();
        assert_eq!(handle.try_wait().unwrap().unwrap(), 5);
    }

    #[test]
    fn wait_timeout_expires_then_succeeds() {
        let (task, mut handle) = future_task(|| 9);
        assert!(handle.wait_timeout(Duration::from_millis(10)).is_none());

        let runner = thread::spawn(task);
        let result = handle.wait_timeout(Duration::from_secs(5));
        runner.join().unwrap();
        assert_eq!(result.unwrap().unwrap(), 9);
    }

    #[test]
    fn wait_blocks_until_completion_from_other_thread() {
        let (task, handle) = future_task(|| "done");
        let runner = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            task();
        });
        assert_eq!(handle.wait().unwrap(), "done");
        runner.join().unwrap();
    }

    #[test]
    fn sequence_runs_in_order_on_one_call() {
        let log = Arc::new(Mutex::new(String::new()));
        let tasks: Vec<Task> = ["a", "b", "c"]
            .into_iter()
            .map(|letter| {
                let log = Arc::clone(&log);
                Box::new(move || log.lock().unwrap().push_str(letter)) as Task
            })
            .collect();

        sequence(tasks)();
        assert_eq!(*log.lock().unwrap(), "abc");
    }

    #[test]
    fn sequence_survives_panicking_element() {
        let ran = Arc::new(AtomicUsize::new(0));
        let mk = |ran: &Arc<AtomicUsize>| {
            let ran = Arc::clone(ran);
            Box::new(move || {
                ran.fetch_add(1, Ordering::Relaxed);
            }) as Task
        };

        let tasks: Vec<Task> = vec![
            mk(&ran),
            Box::new(|| panic!("middle element")),
            mk(&ran),
        ];

        sequence(tasks)();
        assert_eq!(ran.load(Ordering::Relaxed), 2);
    }

    #[test]
    #[should_panic(expected = "sequence requires at least one callable")]
    fn empty_sequence_rejected() {
        let _ = sequence(Vec::new());
    }

    #[test]
    fn panic_message_extracts_str_and_string() {
        let p1: Box<dyn Any + Send> = Box::new("literal");
        assert_eq!(panic_message(p1.as_ref()), "literal");

        let p2: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(p2.as_ref()), "owned");

        let p3: Box<dyn Any + Send> = Box::new(17u8);
        assert_eq!(panic_message(p3.as_ref()), "<non-string panic payload>");
    }
}
