//! End-to-end scenarios for the adaptive worker-pool engine.
//!
//! These drive the composed surface the way an embedding server would:
//! bursts, urgent bypass, quiescence under load, autoscale up and down,
//! and teardown with work in flight.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use branchpool::{DynBranch, DynBranchConfig, Task, WaitStrategy, WorkBranch};

fn config(min: usize, max: usize) -> DynBranchConfig {
    DynBranchConfig {
        min_workers: min,
        max_workers: max,
        wait_strategy: WaitStrategy::Blocking,
        idle_timeout: Duration::from_millis(100),
        tick_interval: Duration::from_millis(100),
    }
}

/// Poll until `cond` holds or the deadline passes; panics on timeout.
fn wait_until(what: &str, deadline: Duration, mut cond: impl FnMut() -> bool) {
    let end = Instant::now() + deadline;
    while !cond() {
        assert!(Instant::now() < end, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

/// 100 sleeping tasks across a [2,4] pool finish well under the sequential
/// wall time, and the pool ends inside its bounds.
#[test]
fn burst_of_sleepers_quiesces_quickly() {
    let pool = DynBranch::with_config(config(2, 4));
    let done = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    for _ in 0..100 {
        let done = Arc::clone(&done);
        pool.submit(move || {
            thread::sleep(Duration::from_millis(10));
            done.fetch_add(1, Ordering::Relaxed);
        });
    }

    assert!(pool.wait_tasks(Duration::from_secs(10)));
    let elapsed = start.elapsed();

    assert_eq!(done.load(Ordering::Relaxed), 100);
    assert_eq!(pool.num_tasks(), 0);
    assert!(
        elapsed < Duration::from_millis(1500),
        "100×10ms across ≥2 workers took {elapsed:?}"
    );
    let workers = pool.num_workers();
    assert!(
        (2..=4).contains(&workers),
        "worker count {workers} outside configured bounds"
    );
}

/// On a single-worker branch, an urgent submission begins before every
/// queued normal, but cannot preempt the normal already in progress.
#[test]
fn urgent_bypasses_queued_normals() {
    let branch = WorkBranch::new(1, WaitStrategy::Blocking);
    let order = Arc::new(Mutex::new(Vec::new()));

    // Pin the worker inside the first task while the rest queue up.
    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    {
        let order = Arc::clone(&order);
        branch.submit(move || {
            gate_rx.recv().unwrap();
            order.lock().unwrap().push(1);
        });
    }
    for i in 2..=5 {
        let order = Arc::clone(&order);
        branch.submit(move || order.lock().unwrap().push(i));
    }
    {
        let order = Arc::clone(&order);
        branch.submit_urgent(move || order.lock().unwrap().push(99));
    }

    gate_tx.send(()).unwrap();
    assert!(branch.wait_tasks(Duration::from_secs(10)));

    let order = order.lock().unwrap();
    assert_eq!(order.len(), 6);
    // The in-progress task could not be jumped, but every not-yet-popped
    // normal could.
    assert_eq!(order[0], 1);
    assert_eq!(order[1], 99);
    assert_eq!(&order[2..], &[2, 3, 4, 5]);
}

/// A burst drives the worker count up toward max within the control
/// cadence; idleness brings it back down to min.
#[test]
fn autoscale_rises_then_falls() {
    let pool = DynBranch::with_config(config(1, 8));

    // Near-no-op tasks: long enough for the 1 ms control passes to see
    // the backlog, short enough to stay a burst.
    for _ in 0..1000 {
        pool.submit(|| thread::sleep(Duration::from_millis(1)));
    }

    wait_until("scale-up under burst", Duration::from_secs(5), || {
        pool.num_workers() >= 4
    });
    assert!(pool.num_workers() <= 8);

    assert!(pool.wait_tasks(Duration::from_secs(30)));
    wait_until("scale-down after idle", Duration::from_secs(10), || {
        pool.num_workers() == 1
    });
}

/// The quiescence barrier times out on a stuck task, recovers, and
/// succeeds once the task is released.
#[test]
fn barrier_timeout_then_success() {
    let pool = DynBranch::with_config(config(2, 2));
    let (signal_tx, signal_rx) = mpsc::channel::<()>();

    pool.submit(move || {
        signal_rx.recv().unwrap();
    });

    assert!(!pool.wait_tasks(Duration::from_millis(200)));

    signal_tx.send(()).unwrap();
    assert!(pool.wait_tasks(Duration::from_secs(5)));
    assert_eq!(pool.num_tasks(), 0);
}

/// A sequence group preserves internal order whatever the worker count.
#[test]
fn sequence_order_is_worker_count_independent() {
    let pool = DynBranch::with_config(config(2, 8));

    // Keep other workers busy so interleaving would show if it existed.
    for _ in 0..50 {
        pool.submit(|| thread::sleep(Duration::from_millis(1)));
    }

    let log = Arc::new(Mutex::new(String::new()));
    let tasks: Vec<Task> = ["a", "b", "c"]
        .into_iter()
        .map(|letter| {
            let log = Arc::clone(&log);
            Box::new(move || log.lock().unwrap().push_str(letter)) as Task
        })
        .collect();
    pool.submit_sequence(tasks);

    assert!(pool.wait_tasks(Duration::from_secs(10)));
    assert_eq!(*log.lock().unwrap(), "abc");
}

/// Teardown with tasks in flight: every started task completes, nothing is
/// aborted, and the drop returns only once the workers are gone.
#[test]
fn teardown_waits_for_inflight_tasks() {
    let started = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));

    {
        let branch = WorkBranch::new(20, WaitStrategy::Blocking);
        for _ in 0..20 {
            let started = Arc::clone(&started);
            let completed = Arc::clone(&completed);
            branch.submit(move || {
                started.fetch_add(1, Ordering::Relaxed);
                thread::sleep(Duration::from_millis(100));
                completed.fetch_add(1, Ordering::Relaxed);
            });
        }

        // All 20 must be in flight before teardown begins.
        wait_until("all tasks in flight", Duration::from_secs(5), || {
            started.load(Ordering::Relaxed) == 20
        });
        // Branch drops here, mid-flight.
    }

    assert_eq!(
        completed.load(Ordering::Relaxed),
        20,
        "teardown returned before in-flight tasks finished"
    );
}

/// Future-bearing submissions deliver values, unit results, and panics
/// through their handles under concurrent load.
#[test]
fn futures_under_load() {
    let pool = DynBranch::with_config(config(1, 4));

    let values: Vec<_> = (0..50usize)
        .map(|i| pool.submit_future(move || i * 2))
        .collect();
    let unit = pool.submit_future(|| ());
    let failing = pool.submit_urgent_future(|| -> u32 { panic!("deliberate") });

    for (i, handle) in values.into_iter().enumerate() {
        assert_eq!(handle.wait().unwrap(), i * 2);
    }
    assert!(unit.wait().is_ok());
    assert!(matches!(
        failing.wait(),
        Err(branchpool::TaskError::Panicked { .. })
    ));

    // The pool is still healthy after the panic.
    let probe = pool.submit_future(|| "alive");
    assert_eq!(probe.wait().unwrap(), "alive");
}

/// Producers on many threads, mixed priorities, with a runtime limit
/// update mid-burst: everything runs exactly once.
#[test]
fn concurrent_producers_with_limit_update() {
    let pool = Arc::new(DynBranch::with_config(config(1, 8)));
    let counter = Arc::new(AtomicUsize::new(0));
    let producers = 4;
    let per_producer = 250;

    let handles: Vec<_> = (0..producers)
        .map(|_| {
            let pool = Arc::clone(&pool);
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                for i in 0..per_producer {
                    let counter = Arc::clone(&counter);
                    if i % 7 == 0 {
                        pool.submit_urgent(move || {
                            counter.fetch_add(1, Ordering::Relaxed);
                        });
                    } else {
                        pool.submit(move || {
                            counter.fetch_add(1, Ordering::Relaxed);
                        });
                    }
                }
            })
        })
        .collect();

    pool.set_worker_limits(2, 4, Duration::from_millis(100));

    for h in handles {
        h.join().unwrap();
    }
    assert!(pool.wait_tasks(Duration::from_secs(30)));
    assert_eq!(counter.load(Ordering::Relaxed), producers * per_producer);

    let stats = pool.stats();
    assert_eq!(stats.tasks_executed, (producers * per_producer) as u64);
    assert_eq!(stats.tasks_panicked, 0);
}
