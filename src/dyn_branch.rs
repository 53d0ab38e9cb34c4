//! Dyn-branch: the composed, autoscaled pool most users want.
//!
//! # Purpose
//!
//! One [`WorkBranch`] plus one [`Supervisor`], wired together at
//! construction and torn down in the only safe order (supervisor first, so
//! its control thread is joined before the branch starts retiring
//! workers). The façade adds no policy of its own beyond starting the
//! branch with a single worker and letting the supervisor grow it.

use std::time::Duration;

use crate::branch::{BranchStats, WorkBranch};
use crate::scale::{cpu_scaled, BranchLimits};
use crate::supervisor::{
    available_cores, Supervisor, DEFAULT_IDLE_TIMEOUT, DEFAULT_TICK_INTERVAL,
};
use crate::task::{Task, TaskHandle};
use crate::wait::WaitStrategy;

/// Construction options for a [`DynBranch`].
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `min_workers` | 1 |
/// | `max_workers` | `max(2, available_parallelism)` |
/// | `wait_strategy` | [`WaitStrategy::Blocking`] |
/// | `idle_timeout` | 5000 ms |
/// | `tick_interval` | 1000 ms |
#[derive(Clone, Copy, Debug)]
pub struct DynBranchConfig {
    /// Floor for the autoscaled worker count.
    pub min_workers: usize,
    /// Ceiling for the autoscaled worker count.
    pub max_workers: usize,
    /// Idle-wait policy for the branch's workers.
    pub wait_strategy: WaitStrategy,
    /// How long a worker must sit idle before scale-down may retire it.
    pub idle_timeout: Duration,
    /// Tick-callback interval for the supervisor.
    pub tick_interval: Duration,
}

impl Default for DynBranchConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: available_cores().max(2),
            wait_strategy: WaitStrategy::Blocking,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }
}

impl DynBranchConfig {
    /// Bounds as core-count multiples: `min = ceil(cores × min_mult)`,
    /// `max = ceil(cores × max_mult)`; everything else default.
    pub fn cpu_multiple(min_mult: f64, max_mult: f64) -> Self {
        let cores = available_cores();
        Self {
            min_workers: cpu_scaled(cores, min_mult),
            max_workers: cpu_scaled(cores, max_mult),
            ..Self::default()
        }
    }

    /// Panics on `max_workers == 0` or `min_workers > max_workers`
    /// (programmer error). Equal bounds configure a fixed-size pool.
    pub fn validate(&self) {
        self.limits().validate();
    }

    fn limits(&self) -> BranchLimits {
        BranchLimits {
            min: self.min_workers,
            max: self.max_workers,
            idle_timeout: self.idle_timeout,
        }
    }
}

/// An autoscaled worker pool: submissions go to the branch, the supervisor
/// keeps the worker count inside the configured bounds.
///
/// Dropping a `DynBranch` first joins the supervisor thread, then tears the
/// branch down (in-flight tasks complete, workers are joined).
pub struct DynBranch {
    // Field order is teardown order: the supervisor must be gone before the
    // branch begins retiring workers.
    supervisor: Supervisor,
    branch: WorkBranch,
}

impl DynBranch {
    /// Dyn-branch with [`DynBranchConfig::default`].
    pub fn new() -> Self {
        Self::with_config(DynBranchConfig::default())
    }

    /// Dyn-branch with explicit options.
    ///
    /// # Panics
    ///
    /// Panics on an invalid configuration (see [`DynBranchConfig::validate`]).
    pub fn with_config(config: DynBranchConfig) -> Self {
        config.validate();

        let branch = WorkBranch::new(1, config.wait_strategy);
        let supervisor = Supervisor::with_intervals(config.idle_timeout, config.tick_interval);
        supervisor.supervise(
            &branch,
            config.min_workers,
            config.max_workers,
            config.idle_timeout,
        );

        Self { supervisor, branch }
    }

    /// See [`WorkBranch::submit`].
    pub fn submit<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.branch.submit(f);
    }

    /// See [`WorkBranch::submit_urgent`].
    pub fn submit_urgent<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.branch.submit_urgent(f);
    }

    /// See [`WorkBranch::submit_sequence`].
    pub fn submit_sequence(&self, tasks: Vec<Task>) {
        self.branch.submit_sequence(tasks);
    }

    /// See [`WorkBranch::submit_future`].
    pub fn submit_future<R, F>(&self, f: F) -> TaskHandle<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        self.branch.submit_future(f)
    }

    /// See [`WorkBranch::submit_urgent_future`].
    pub fn submit_urgent_future<R, F>(&self, f: F) -> TaskHandle<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        self.branch.submit_urgent_future(f)
    }

    /// See [`WorkBranch::wait_tasks`].
    pub fn wait_tasks(&self, timeout: Duration) -> bool {
        self.branch.wait_tasks(timeout)
    }

    /// See [`WorkBranch::num_workers`].
    pub fn num_workers(&self) -> usize {
        self.branch.num_workers()
    }

    /// See [`WorkBranch::num_tasks`].
    pub fn num_tasks(&self) -> usize {
        self.branch.num_tasks()
    }

    /// See [`WorkBranch::stats`].
    pub fn stats(&self) -> BranchStats {
        self.branch.stats()
    }

    /// See [`Supervisor::suspend`].
    pub fn suspend(&self, timeout: Duration) {
        self.supervisor.suspend(timeout);
    }

    /// See [`Supervisor::proceed`].
    pub fn proceed(&self) {
        self.supervisor.proceed();
    }

    /// See [`Supervisor::set_tick_cb`].
    pub fn set_tick_cb<F>(&self, cb: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.supervisor.set_tick_cb(cb);
    }

    /// Update the autoscaling bounds at runtime (last call wins).
    ///
    /// # Panics
    ///
    /// Panics on invalid limits.
    pub fn set_worker_limits(&self, min_workers: usize, max_workers: usize, idle_timeout: Duration) {
        self.supervisor
            .supervise(&self.branch, min_workers, max_workers, idle_timeout);
    }

    /// Core-multiple form of [`DynBranch::set_worker_limits`], with this
    /// supervisor's default idle timeout.
    pub fn set_worker_limits_cpu_multiple(&self, min_mult: f64, max_mult: f64) {
        let cores = available_cores();
        self.supervisor.supervise_default(
            &self.branch,
            cpu_scaled(cores, min_mult),
            cpu_scaled(cores, max_mult),
        );
    }
}

impl Default for DynBranch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    fn fast_config(min: usize, max: usize) -> DynBranchConfig {
        DynBranchConfig {
            min_workers: min,
            max_workers: max,
            wait_strategy: WaitStrategy::Blocking,
            idle_timeout: Duration::from_millis(50),
            tick_interval: Duration::from_millis(50),
        }
    }

    #[test]
    fn default_config_is_sane() {
        let cfg = DynBranchConfig::default();
        cfg.validate();
        assert_eq!(cfg.min_workers, 1);
        assert!(cfg.max_workers >= 2);
        assert_eq!(cfg.wait_strategy, WaitStrategy::Blocking);
        assert_eq!(cfg.idle_timeout, Duration::from_millis(5000));
        assert_eq!(cfg.tick_interval, Duration::from_millis(1000));
    }

    #[test]
    fn starts_with_one_worker() {
        let pool = DynBranch::with_config(fast_config(1, 4));
        assert_eq!(pool.num_workers(), 1);
    }

    #[test]
    fn runs_work_and_reports_counts() {
        let pool = DynBranch::with_config(fast_config(1, 4));
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..200 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }

        assert!(pool.wait_tasks(Duration::from_secs(10)));
        assert_eq!(counter.load(Ordering::Relaxed), 200);
        assert_eq!(pool.num_tasks(), 0);
        assert_eq!(pool.stats().tasks_executed, 200);
    }

    #[test]
    fn future_round_trip() {
        let pool = DynBranch::with_config(fast_config(1, 4));
        let handle = pool.submit_future(|| String::from("value"));
        assert_eq!(handle.wait().unwrap(), "value");
    }

    #[test]
    fn runtime_limit_update_takes_effect() {
        let pool = DynBranch::with_config(fast_config(1, 8));

        for _ in 0..64 {
            pool.submit(|| thread::sleep(Duration::from_millis(10)));
        }
        pool.set_worker_limits(1, 2, Duration::from_millis(50));

        // After the cap, the count must settle at ≤ 2 and stay there.
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            assert!(Instant::now() < deadline, "never settled under new max");
            if pool.num_workers() <= 2 && pool.num_tasks() == 0 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn drop_order_is_clean_under_load() {
        // Dropping mid-burst must join the supervisor, finish in-flight
        // tasks, and not hang or panic.
        let pool = DynBranch::with_config(fast_config(1, 4));
        for _ in 0..100 {
            pool.submit(|| thread::sleep(Duration::from_millis(1)));
        }
        drop(pool);
    }

    #[test]
    fn fixed_size_config_is_valid() {
        let pool = DynBranch::with_config(fast_config(2, 2));
        pool.submit(|| {});
        assert!(pool.wait_tasks(Duration::from_secs(5)));
    }

    #[test]
    #[should_panic(expected = "must not exceed max_workers")]
    fn inverted_config_rejected() {
        let _ = DynBranch::with_config(fast_config(4, 2));
    }
}
