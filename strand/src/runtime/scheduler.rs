//! Worker threads and their runqueues.
//!
//! Each worker owns a FIFO injector as its runqueue. Dispatch is directed —
//! any thread may push to any worker's queue — and idle workers steal from
//! siblings in a per-worker shuffled order. A stolen entry that is not
//! steal-enabled is pushed back to its owner: the steal decision for the
//! *task* is made by the resume entry itself when it runs (see
//! [`super::carrier::ResumeEntry`]), the queue-level check only keeps pinned
//! entries on their thread.

use crate::context;
use crate::runtime::carrier::Carrier;
use crate::runtime::engine::Engine;
use crate::runtime::{Entry, RuntimeConfig, StealAware};
use crate::task::Target;
use crate::timer::{TimerQueue, Timeout};
use anyhow::{Result, anyhow};
use crossbeam_deque::{Injector, Steal};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, OnceLock};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

// Safety net for steal latency: an idle worker re-scans sibling queues at
// this cadence even when nothing signals it (a busy sibling never signals
// anyone). Directed pushes still wake the owner immediately.
const IDLE_PARK_TIMEOUT: Duration = Duration::from_millis(50);

pub(crate) struct Worker {
    pub(crate) index: usize,

    /// Directed FIFO runqueue. `Injector` because entries are pushed from
    /// arbitrary threads (wakers, timers) and stolen by idle siblings.
    queue: Injector<Entry>,

    /// Coarse timer queue, used in low-precision mode.
    pub(crate) timers: TimerQueue,

    /// Set when the worker's thread is presumed stuck in a blocking syscall;
    /// siblings drain its queue and the worker exits once the engine is idle.
    handed_off: AtomicBool,

    signaled: Mutex<bool>,
    wakeup: Condvar,

    thread_id: OnceLock<ThreadId>,

    /// Sibling visit order for stealing, shuffled per worker to reduce
    /// contention.
    steal_order: Vec<usize>,
}

impl Worker {
    fn new(index: usize, worker_count: usize) -> Self {
        let mut steal_order: Vec<usize> = (0..worker_count).filter(|&i| i != index).collect();
        fastrand::shuffle(&mut steal_order);
        Worker {
            index,
            queue: Injector::new(),
            timers: TimerQueue::new(),
            handed_off: AtomicBool::new(false),
            signaled: Mutex::new(false),
            wakeup: Condvar::new(),
            thread_id: OnceLock::new(),
            steal_order,
        }
    }

    pub(crate) fn push(&self, entry: Entry) {
        self.queue.push(entry);
        self.signal();
    }

    pub(crate) fn queue_length(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn has_been_handoff(&self) -> bool {
        self.handed_off.load(Ordering::Acquire)
    }

    /// Wake the worker if it is parked.
    pub(crate) fn signal(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.wakeup.notify_one();
    }

    pub(crate) fn process_timers(&self) {
        self.timers.process_due(Instant::now());
    }

    fn park_until(&self, deadline: Option<Instant>) {
        let mut signaled = self.signaled.lock();
        if !*signaled {
            match deadline {
                Some(deadline) => {
                    let _ = self.wakeup.wait_until(&mut signaled, deadline);
                }
                None => self.wakeup.wait(&mut signaled),
            }
        }
        *signaled = false;
    }

    /// Pop from the local queue, then try to steal from siblings.
    fn next_entry(&self, scheduler: &Scheduler) -> Option<Entry> {
        loop {
            match self.queue.steal() {
                Steal::Success(entry) => return Some(entry),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }
        for &victim_index in &self.steal_order {
            let victim = &scheduler.workers[victim_index];
            match victim.queue.steal() {
                Steal::Success(entry) => {
                    if entry.is_steal_enabled() {
                        return Some(entry);
                    }
                    // pinned to its owner; hand it back
                    victim.push(entry);
                }
                // don't spin on an empty or contended victim
                Steal::Empty | Steal::Retry => {}
            }
        }
        None
    }
}

pub(crate) struct Scheduler {
    pub(crate) workers: Vec<Arc<Worker>>,
    by_thread: DashMap<ThreadId, Arc<Worker>>,
    next_rr: AtomicUsize,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Scheduler {
    pub(crate) fn new(cfg: &RuntimeConfig) -> Self {
        let workers = (0..cfg.worker_threads)
            .map(|index| Arc::new(Worker::new(index, cfg.worker_threads)))
            .collect();
        Scheduler {
            workers,
            by_thread: DashMap::new(),
            next_rr: AtomicUsize::new(0),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn one OS thread per worker and wait until every worker has
    /// registered itself and built its carrier.
    pub(crate) fn start(self: &Arc<Self>, engine: &Arc<Engine>) -> Result<()> {
        let startup = Arc::new(Barrier::new(self.workers.len() + 1));
        let mut handles = self.handles.lock();
        for worker in &self.workers {
            let engine = Arc::clone(engine);
            let scheduler = Arc::clone(self);
            let worker = Arc::clone(worker);
            let startup = Arc::clone(&startup);
            let name = format!("{}-worker-{}", engine.cfg().thread_name, worker.index);
            let handle = thread::Builder::new()
                .name(name)
                .spawn(move || worker_loop(engine, scheduler, worker, startup))?;
            handles.push(handle);
        }
        drop(handles);
        startup.wait();
        Ok(())
    }

    /// Dispatch an entry to any worker, round-robin.
    pub(crate) fn execute(&self, entry: Entry) -> Result<()> {
        if self.workers.is_empty() {
            return Err(anyhow!("scheduler has no workers"));
        }
        let index = self.next_rr.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.push_to(&self.workers[index], entry);
        Ok(())
    }

    pub(crate) fn execute_on(&self, worker: &Arc<Worker>, entry: Entry) {
        self.push_to(worker, entry);
    }

    /// Dispatch an entry to the worker bound to `thread`, best-effort: a
    /// handed-off or exited worker falls back to round-robin.
    pub(crate) fn execute_with_worker_thread(&self, entry: Entry, thread: ThreadId) -> Result<()> {
        match self.by_thread.get(&thread) {
            Some(worker) => {
                let worker = Arc::clone(&worker);
                self.push_to(&worker, entry);
                Ok(())
            }
            None => self.execute(entry),
        }
    }

    fn push_to(&self, worker: &Arc<Worker>, entry: Entry) {
        worker.push(entry);
        // the owner's thread is presumed stuck in a syscall; a sibling has
        // to pick this up
        if worker.has_been_handoff() {
            self.signal_all();
        }
    }

    pub(crate) fn add_timer(&self, timeout: Arc<Timeout>, thread: ThreadId) {
        match self.by_thread.get(&thread) {
            Some(worker) => {
                worker.timers.add(timeout);
                // re-evaluate the park deadline
                worker.signal();
            }
            None => {
                debug_assert!(false, "timer registered from a non-worker thread");
                tracing::warn!("dropping timer registered from a non-worker thread");
            }
        }
    }

    pub(crate) fn cancel_timer(&self, timeout: &Arc<Timeout>, thread: ThreadId) {
        if let Some(worker) = self.by_thread.get(&thread) {
            worker.timers.remove(timeout);
        }
    }

    /// Detach request: the calling worker's thread is about to block in a
    /// syscall. Siblings are woken so its queue drains; the worker exits once
    /// the engine is idle.
    pub(crate) fn hand_off_worker_thread(&self, thread: ThreadId) {
        if let Some(worker) = self.by_thread.get(&thread) {
            worker.handed_off.store(true, Ordering::Release);
            tracing::debug!(worker = worker.index, "worker handed off");
        }
        self.signal_all();
    }

    pub(crate) fn signal_all(&self) {
        for worker in &self.workers {
            worker.signal();
        }
    }

    pub(crate) fn join_all(&self) -> Result<()> {
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            handle
                .join()
                .map_err(|_| anyhow!("worker thread panicked"))?;
        }
        Ok(())
    }
}

fn worker_loop(
    engine: Arc<Engine>,
    scheduler: Arc<Scheduler>,
    worker: Arc<Worker>,
    startup: Arc<Barrier>,
) {
    let thread_id = thread::current().id();
    worker
        .thread_id
        .set(thread_id)
        .expect("worker thread started twice");
    scheduler.by_thread.insert(thread_id, Arc::clone(&worker));

    let carrier = Carrier::new_worker(&engine, &worker);
    context::install_worker_carrier(&carrier);
    startup.wait();

    loop {
        worker.process_timers();
        if let Some(entry) = worker.next_entry(&scheduler) {
            entry.run();
            continue;
        }
        let drained = engine.running_task_count() == 0 && worker.queue.is_empty();
        if drained && (engine.has_been_shutdown() || worker.has_been_handoff()) {
            break;
        }
        let cap = Instant::now() + IDLE_PARK_TIMEOUT;
        let deadline = worker.timers.next_deadline().map_or(cap, |d| d.min(cap));
        worker.park_until(Some(deadline));
    }

    tracing::debug!(worker = worker.index, "worker exiting");
    carrier.destroy();
    engine.unregister_carrier(carrier.id());
    scheduler.by_thread.remove(&thread_id);
    context::clear_current_task();
}

/// Queue entry that creates one task on whatever carrier runs it.
pub(crate) struct SpawnEntry {
    name: String,
    target: Mutex<Option<Target>>,
    steal_enabled: AtomicBool,
}

impl SpawnEntry {
    pub(crate) fn new(name: &str, target: Target) -> Self {
        SpawnEntry {
            name: name.to_string(),
            target: Mutex::new(Some(target)),
            steal_enabled: AtomicBool::new(true),
        }
    }

    /// A spawn entry that must run on the worker it was dispatched to.
    pub(crate) fn new_pinned(name: &str, target: Target) -> Self {
        SpawnEntry {
            name: name.to_string(),
            target: Mutex::new(Some(target)),
            steal_enabled: AtomicBool::new(false),
        }
    }
}

impl StealAware for SpawnEntry {
    fn run(&self) {
        let Some(target) = self.target.lock().take() else {
            debug_assert!(false, "spawn entry dispatched twice");
            return;
        };
        if let Err(error) = context::current_carrier().spawn(target, &self.name) {
            tracing::warn!(task = %self.name, %error, "spawn entry rejected");
        }
    }

    fn is_steal_enabled(&self) -> bool {
        self.steal_enabled.load(Ordering::Acquire)
    }

    fn set_steal_enabled(&self, enabled: bool) {
        self.steal_enabled.store(enabled, Ordering::Release);
    }
}
