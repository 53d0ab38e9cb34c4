//! branchpool: an embeddable adaptive worker-pool engine.
//!
//! # Overview
//!
//! A branch is a pool of OS worker threads pulling from one shared
//! double-ended task deque. A supervisor is a control thread that grows and
//! shrinks branches in response to backlog and idleness. A dyn-branch is
//! the composed unit (one branch, one supervisor) and the surface most
//! users want.
//!
//! ```text
//!                    ┌──────────────────────────────────────────────┐
//!                    │                 DynBranch                    │
//!                    │                                              │
//!  Producers ───────►│  WorkBranch ◄── add/del ── Supervisor        │
//!  (submit*)         │  ├ TaskQueue (urgent → head)   │             │
//!                    │  └ workers (autoscaled)        └ ~1ms passes │
//!                    └──────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`queue`] | Shared double-ended task deque |
//! | [`task`] | Priorities, sequence composition, one-shot result handles |
//! | [`wait`] | Worker idle-wait strategies (yield / spin-then-sleep / block) |
//! | [`registry`] | Worker identity, busy/idle bookkeeping, thread-handle reaping |
//! | [`branch`] | The work branch: dispatch, quiescence barrier, retirement |
//! | [`scale`] | Pure autoscaling policy |
//! | [`supervisor`] | Control loop applying the policy to registered branches |
//! | [`dyn_branch`] | Branch + supervisor composition and configuration |
//!
//! # Guarantees
//!
//! - **Exactly-once execution**: every accepted submission runs exactly
//!   once, unless the branch is destroyed before the task starts (its
//!   handle then resolves to [`TaskError::Abandoned`]).
//! - **Urgent bypass**: an urgent task begins before any queued normal task
//!   that has not already been popped.
//! - **Sequence order**: a sequence group runs on one worker, in submitted
//!   order, a panicking element never skipping its successors.
//! - **Deterministic quiescence**: [`WorkBranch::wait_tasks`] returns true
//!   only with an empty queue and every worker parked, and always releases
//!   the barrier before returning.
//! - **No interrupted work**: scale-down and teardown retire workers only
//!   between tasks; in-flight bodies always complete; threads are always
//!   joined.
//!
//! # Example
//!
//! ```no_run
//! use branchpool::{DynBranch, DynBranchConfig};
//! use std::time::Duration;
//!
//! let pool = DynBranch::with_config(DynBranchConfig {
//!     min_workers: 2,
//!     max_workers: 8,
//!     ..Default::default()
//! });
//!
//! for i in 0..100 {
//!     pool.submit(move || {
//!         // fire-and-forget work
//!         let _ = i;
//!     });
//! }
//! let answer = pool.submit_future(|| 6 * 7);
//!
//! assert!(pool.wait_tasks(Duration::from_secs(10)));
//! assert_eq!(answer.wait().unwrap(), 42);
//! ```
//!
//! # Failure model
//!
//! Task panics are contained at worker scope: fire-and-forget failures are
//! reported to the structured log (`tracing`) with the worker's thread id,
//! future-bearing failures travel to the consumer through the handle. A
//! panic escaping a supervisor control pass is logged and the loop
//! continues. No failure is fatal to the process.

pub mod branch;
pub mod dyn_branch;
pub mod queue;
pub mod registry;
pub mod scale;
pub mod supervisor;
pub mod task;
pub mod wait;

// Core surface
pub use branch::{BranchStats, WorkBranch};
pub use dyn_branch::{DynBranch, DynBranchConfig};
pub use supervisor::Supervisor;

// Supporting types
pub use queue::TaskQueue;
pub use registry::WorkerId;
pub use scale::{plan, BranchLimits, ScaleAction};
pub use task::{Priority, Task, TaskError, TaskHandle};
pub use wait::WaitStrategy;
