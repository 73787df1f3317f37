use crate::context;
use crate::errors::SpawnError;
use crate::pump::{Interest, SourceId};
use crate::runtime::carrier::Carrier;
use crate::runtime::{Builder, Runtime, StealAware};
use crate::task::{Status, Task};
use crate::test_utils::*;
use rstest::rstest;
use static_assertions::assert_impl_all;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

assert_impl_all!(Carrier: Send, Sync);
assert_impl_all!(Runtime: Send, Sync);

/// Spawn N tasks that all overlap, let them exit, and check the recycle
/// caches: the local cache fills to its cap, the rest spills to the
/// engine-wide cache, and the running count returns to zero.
#[rstest]
#[case::no_local_cache(0)]
#[case::small_cache(8)]
#[case::cache_larger_than_load(200)]
fn spawn_exit_round_trip_recycles_tasks(#[case] cache_size: usize) {
    const TASKS: usize = 100;

    let runtime = Builder::new()
        .worker_threads(1)
        .task_cache_size(cache_size)
        .try_build()
        .unwrap();
    let engine = runtime.engine().clone();

    let handles: Vec<_> = (0..TASKS)
        .map(|i| {
            runtime.spawn(move || {
                // overlap all tasks so none is recycled while spawning
                crate::sleep(Duration::from_millis(200));
                i
            })
        })
        .collect();
    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.join_timeout(Duration::from_secs(10)).unwrap(), i);
    }

    assert!(wait_until(Duration::from_secs(5), || {
        engine.running_task_count() == 0
    }));
    let expected_local = TASKS.min(cache_size);
    assert!(wait_until(Duration::from_secs(5), || {
        engine.group_task_cache_len() == TASKS - expected_local
    }));
    // the running count drops before the cache return; let the worker go idle
    thread::sleep(Duration::from_millis(100));

    let carriers = engine.worker_carriers();
    assert_eq!(carriers.len(), 1);
    assert_eq!(carriers[0].task_cache_len(), expected_local);
    assert_eq!(engine.group_task_cache_len(), TASKS - expected_local);

    runtime.shutdown().unwrap();
}

/// A spawned task runs synchronously until its first park, then control
/// returns to the spawner before anything else runs.
#[test]
fn first_park_returns_to_parent() {
    let runtime = build_runtime(1);
    let log = EventLog::new();

    let parent_log = log.clone();
    let handle = runtime.spawn(move || {
        parent_log.record("parent-before");
        let child_log = parent_log.clone();
        crate::spawn(move || {
            child_log.record("child-start");
            crate::sleep(Duration::from_millis(20));
            child_log.record("child-end");
        })
        .unwrap();
        parent_log.record("parent-after-spawn");
    });

    handle.join_timeout(Duration::from_secs(5)).unwrap();
    assert!(log.wait_for_len(4, Duration::from_secs(5)));
    assert_eq!(
        log.snapshot(),
        vec![
            "parent-before",
            "child-start",
            "parent-after-spawn",
            "child-end"
        ]
    );

    runtime.shutdown().unwrap();
}

/// One carrier, two runnable tasks: A yields, B runs, A resumes.
#[test]
fn cooperative_yield_runs_other_task_first() {
    let runtime = build_runtime(1);
    let log = EventLog::new();
    let b_submitted = Arc::new(AtomicBool::new(false));

    let a_log = log.clone();
    let a_gate = Arc::clone(&b_submitted);
    let a = runtime.spawn(move || {
        a_log.record("a1");
        while !a_gate.load(Ordering::Acquire) {
            std::hint::spin_loop();
        }
        crate::yield_now();
        a_log.record("a2");
    });

    let b_log = log.clone();
    let b = runtime.spawn(move || {
        b_log.record("b");
    });
    b_submitted.store(true, Ordering::Release);

    a.join_timeout(Duration::from_secs(5)).unwrap();
    b.join_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(log.snapshot(), vec!["a1", "b", "a2"]);

    runtime.shutdown().unwrap();
}

/// Dispatching a parked task's resume entry on another worker steals the
/// task over: identity preserved, only the carrier link changes.
#[test]
fn resume_on_other_worker_steals_task() {
    let runtime = build_runtime(2);
    let engine = runtime.engine().clone();

    let (task_tx, task_rx) = mpsc::channel::<Arc<Task>>();
    let (carrier_tx, carrier_rx) = mpsc::channel::<u64>();
    let handle = runtime.spawn(move || {
        let task = context::try_current_task().unwrap();
        task_tx.send(task).unwrap();
        let carrier = Carrier::current();
        carrier.register_event(SourceId(7), Interest::READABLE);
        carrier.schedule();
        // resumed, possibly on a different carrier
        carrier_tx.send(Carrier::current().id()).unwrap();
    });

    let task = task_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        task.status() == Status::Parked
    }));

    let origin = task.try_carrier().unwrap();
    let origin_worker = origin.worker().unwrap();
    let thief_worker = engine
        .scheduler
        .workers
        .iter()
        .find(|worker| worker.index != origin_worker.index)
        .unwrap();

    let entry = task.resume_entry().unwrap();
    assert!(entry.try_enqueue());
    // pin the entry so the origin cannot win it back at queue level; the
    // task-level steal is what this test is about
    entry.set_steal_enabled(false);
    engine.scheduler.execute_on(thief_worker, entry);

    handle.join_timeout(Duration::from_secs(5)).unwrap();
    let resumed_on = carrier_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_ne!(resumed_on, origin.id());
    assert_eq!(task.steal_count(), 1);
    assert_eq!(task.steal_failure_count(), 0);
    let new_carrier = task.try_carrier().unwrap();
    assert_eq!(new_carrier.id(), resumed_on);

    runtime.shutdown().unwrap();
}

/// A canceled timer's fire is a no-op: the task stays parked past the
/// deadline and only the real wake event resumes it.
#[test]
fn timer_cancel_before_fire_does_not_wake() {
    let runtime = Builder::new()
        .worker_threads(1)
        .high_precision_timer(true)
        .try_build()
        .unwrap();
    let engine = runtime.engine().clone();

    let (task_tx, task_rx) = mpsc::channel::<Arc<Task>>();
    let handle = runtime.spawn(move || {
        let carrier = Carrier::current();
        carrier.register_event(SourceId(11), Interest::READABLE);
        carrier.add_timer(Instant::now() + Duration::from_millis(250));
        task_tx.send(context::try_current_task().unwrap()).unwrap();
        carrier.schedule();
        Carrier::current().cancel_timer();
    });

    let task = task_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        task.status() == Status::Parked
    }));

    let timeout = task.timeout().expect("timer not armed");
    timeout.cancel();
    assert!(timeout.is_canceled());

    // past the deadline: the canceled fire must not have woken the task
    thread::sleep(Duration::from_millis(400));
    assert_eq!(task.status(), Status::Parked);

    assert!(engine.pump().deliver(SourceId(11), Interest::READABLE));
    handle.join_timeout(Duration::from_secs(5)).unwrap();

    runtime.shutdown().unwrap();
}

#[rstest]
#[case::coarse(false)]
#[case::high_precision(true)]
fn sleep_parks_for_at_least_the_duration(#[case] high_precision: bool) {
    let runtime = Builder::new()
        .worker_threads(1)
        .high_precision_timer(high_precision)
        .try_build()
        .unwrap();

    let start = Instant::now();
    let handle = runtime.spawn(|| {
        crate::sleep(Duration::from_millis(30));
    });
    handle.join_timeout(Duration::from_secs(5)).unwrap();
    assert!(start.elapsed() >= Duration::from_millis(30));

    runtime.shutdown().unwrap();
}

/// Canceling a coarse timer removes it from the owning worker's queue.
#[test]
fn coarse_timer_cancel_removes_from_worker_queue() {
    let runtime = build_runtime(1);

    let (tx, rx) = mpsc::channel::<(bool, bool)>();
    let handle = runtime.spawn(move || {
        let carrier = Carrier::current();
        let worker = carrier.worker().unwrap();
        carrier.add_timer(Instant::now() + Duration::from_secs(60));
        let armed = !worker.timers.is_empty();
        carrier.cancel_timer();
        let removed = worker.timers.is_empty();
        tx.send((armed, removed)).unwrap();
    });

    handle.join_timeout(Duration::from_secs(5)).unwrap();
    let (armed, removed) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(armed);
    assert!(removed);

    runtime.shutdown().unwrap();
}

/// Cooperative drain: parked tasks are interrupted and exit, the running
/// count reaches zero, and late results never materialize.
#[test]
fn shutdown_drains_parked_tasks() {
    let runtime = build_runtime(2);
    let engine = runtime.engine().clone();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            runtime.spawn(|| {
                crate::sleep(Duration::from_secs(600));
                "never produced"
            })
        })
        .collect();

    assert!(wait_until(Duration::from_secs(5), || {
        engine.running_task_count() == 4
    }));

    runtime.shutdown().unwrap();

    assert!(engine.has_been_shutdown());
    assert_eq!(engine.running_task_count(), 0);
    for handle in handles {
        assert!(handle.join_timeout(Duration::from_secs(1)).is_err());
    }
}

/// Spawns observe the shutdown flag: rejected for everything but the drain
/// task itself; steals are refused as well.
#[test]
fn spawn_after_shutdown_is_rejected() {
    let runtime = build_runtime(1);
    let engine = runtime.engine().clone();

    let (tx, rx) = mpsc::channel::<SpawnError>();
    let handle = runtime.spawn(move || {
        engine.force_shutdown_flag();
        let refused = crate::spawn(|| {}).unwrap_err();
        tx.send(refused).unwrap();
    });

    handle.join_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        SpawnError::Rejected
    );
}

/// A carrier attached on a foreign thread is an identity holder only.
#[test]
fn attached_carrier_cannot_run_tasks() {
    let result = thread::Builder::new()
        .name("attach-probe".into())
        .spawn(|| {
            let carrier = Carrier::current();
            assert!(!carrier.is_running());
            assert_eq!(crate::spawn(|| {}).unwrap_err(), SpawnError::InvalidState);

            // identity queries still work
            let wrapper = crate::current_thread();
            assert!(wrapper.name().contains("attach-probe"));

            // cooperative hints degrade to their OS equivalents
            crate::yield_now();
            let start = Instant::now();
            crate::sleep(Duration::from_millis(5));
            assert!(start.elapsed() >= Duration::from_millis(5));

            carrier
        })
        .unwrap()
        .join()
        .unwrap();

    // the attach guard destroyed the carrier when its thread exited
    assert!(wait_until(Duration::from_secs(5), || result.is_terminated()));
}

/// Per-thread destroy on OS-thread exit: no carrier leaks from short-lived
/// attached threads.
#[test]
fn carrier_destroyed_on_thread_exit() {
    let (tx, rx) = mpsc::channel::<Arc<Carrier>>();
    thread::spawn(move || {
        tx.send(Carrier::current()).unwrap();
    })
    .join()
    .unwrap();

    let carrier = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(wait_until(Duration::from_secs(5), || carrier.is_terminated()));
}

/// An unregistered source's late readiness must not wake anything.
#[test]
fn late_readiness_does_not_wake_after_unregister() {
    let runtime = build_runtime(1);
    let engine = runtime.engine().clone();
    let pump_engine = runtime.engine().clone();

    let handle = runtime.spawn(move || {
        let carrier = Carrier::current();
        carrier.register_event(SourceId(21), Interest::READABLE);
        carrier.unregister_event();
        // late notification for the stale registration
        assert!(!pump_engine.pump().deliver(SourceId(21), Interest::READABLE));
    });
    handle.join_timeout(Duration::from_secs(5)).unwrap();

    // and a delivery with no registration at all is a no-op
    assert!(!engine.pump().deliver(SourceId(22), Interest::WRITABLE));

    runtime.shutdown().unwrap();
}

/// Readiness delivery wakes the registered task through the standard path.
#[test]
fn readiness_delivery_resumes_parked_task() {
    let runtime = build_runtime(1);
    let engine = runtime.engine().clone();

    let (task_tx, task_rx) = mpsc::channel::<Arc<Task>>();
    let handle = runtime.spawn(move || {
        let carrier = Carrier::current();
        task_tx.send(context::try_current_task().unwrap()).unwrap();
        carrier.register_event(SourceId(31), Interest::WRITABLE);
        carrier.schedule();
        "woke"
    });

    let task = task_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        task.status() == Status::Parked
    }));
    assert!(task.register_event_time() > 0);
    assert!(engine.pump().deliver(SourceId(31), Interest::WRITABLE));
    assert_eq!(handle.join_timeout(Duration::from_secs(5)).unwrap(), "woke");
    // the exit path clears the interest
    assert!(wait_until(Duration::from_secs(5), || {
        task.register_event_time() == 0
    }));

    runtime.shutdown().unwrap();
}

/// While a handed-off worker's thread is stuck in a syscall, siblings drain
/// its queue.
#[test]
fn handed_off_worker_queue_is_drained_by_siblings() {
    let runtime = build_runtime(2);
    let engine = runtime.engine().clone();

    let (tx, rx) = mpsc::channel::<usize>();
    let blocker = runtime.spawn(move || {
        let carrier = Carrier::current();
        carrier.hand_off();
        tx.send(carrier.worker().unwrap().index).unwrap();
        // simulated blocking syscall: occupies the carrier without parking
        thread::sleep(Duration::from_millis(150));
    });

    let blocked_index = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let blocked_worker = &engine.scheduler.workers[blocked_index];
    assert!(blocked_worker.has_been_handoff());

    // dispatched round-robin, some of these land on the blocked worker's
    // queue; the sibling must steal and finish them well before it unblocks
    let quick: Vec<_> = (0..6).map(|i| runtime.spawn(move || i)).collect();
    for (i, handle) in quick.into_iter().enumerate() {
        assert_eq!(handle.join_timeout(Duration::from_millis(120)).unwrap(), i);
    }

    blocker.join_timeout(Duration::from_secs(5)).unwrap();
    runtime.shutdown().unwrap();
}

/// Exit-path law: every spawned task exits exactly once and the counters
/// agree.
#[test]
fn counters_track_the_exit_path_law() {
    const TASKS: u64 = 16;
    let runtime = build_runtime(1);
    let engine = runtime.engine().clone();

    let handles: Vec<_> = (0..TASKS).map(|_| runtime.spawn(|| ())).collect();
    for handle in handles {
        handle.join_timeout(Duration::from_secs(5)).unwrap();
    }
    assert!(wait_until(Duration::from_secs(5), || {
        engine.running_task_count() == 0
    }));

    let carriers = engine.worker_carriers();
    assert_eq!(carriers.len(), 1);
    let counter = carriers[0].counter();
    // completion is counted just after the running count drops
    assert!(wait_until(Duration::from_secs(5), || {
        counter.complete_task_count() == TASKS
    }));
    assert_eq!(counter.create_task_count(), TASKS);
    // every task needs at least one switch in and one out
    assert!(counter.switch_count() >= 2 * TASKS);

    // liveness counters advance with the switches
    assert!(carriers[0].sched_tick() >= 2 * TASKS);
    carriers[0].record_observed_tick();

    runtime.shutdown().unwrap();
}

/// `current()` resolves through the running task, so nested spawns see the
/// same carrier and tasks see their own identity.
#[test]
fn current_carrier_resolves_through_running_task() {
    let runtime = build_runtime(1);

    let handle = runtime.spawn(|| {
        let outer_carrier = Carrier::current().id();
        let outer_thread = crate::current_thread();
        let (inner_carrier, inner_thread) = {
            let (tx, rx) = mpsc::channel();
            crate::spawn(move || {
                tx.send((Carrier::current().id(), crate::current_thread()))
                    .unwrap();
            })
            .unwrap();
            rx.recv().unwrap()
        };
        assert_eq!(outer_carrier, inner_carrier);
        assert_ne!(outer_thread, inner_thread);
    });

    handle.join_timeout(Duration::from_secs(5)).unwrap();
    runtime.shutdown().unwrap();
}
