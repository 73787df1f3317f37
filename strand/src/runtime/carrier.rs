//! The carrier: a scheduler instance pinned to one OS thread.
//!
//! A carrier owns the tasks multiplexed onto its thread and controls their
//! life cycle: it spawns them, context-switches into them, parks them, hands
//! their resume entries to the scheduler, and recycles them on exit. It also
//! keeps the thread-local scheduling state — the current task, the task
//! cache, the critical-section flag — and the deferred work (pending timer,
//! yielding task) drained by the resume epilog.
//!
//! Get the per-thread instance with [`Carrier::current`].

use crate::context;
use crate::coro::{self, StealResult};
use crate::counter::CarrierCounter;
use crate::errors::SpawnError;
use crate::pump::{Interest, SourceId};
use crate::runtime::engine::Engine;
use crate::runtime::scheduler::Worker;
use crate::runtime::StealAware;
use crate::task::{SHUTDOWN_TASK_NAME, Status, Target, Task};
use crate::timer::Timeout;
use crate::utils::{CriticalGuard, now_nanos};
use std::cell::{Cell, RefCell};
use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Instant;

static NEXT_CARRIER_ID: AtomicU64 = AtomicU64::new(1);

pub struct Carrier {
    id: u64,
    engine: Arc<Engine>,
    thread_id: ThreadId,
    thread_name: String,

    /// None for attach-only carriers built on foreign threads. Those serve as
    /// identity holders and cannot run tasks.
    worker: Option<Arc<Worker>>,

    /// The run-loop task: wraps this thread's native context and executes the
    /// worker loop. `yield_to(thread_task)` means "return to the scheduler".
    thread_task: Arc<Task>,

    current: RefCell<Arc<Task>>,
    task_cache: RefCell<Vec<Arc<Task>>>,
    is_in_critical: Cell<bool>,
    switch_timestamp: Cell<u64>,

    /// Deferred work drained by the resume epilog.
    yielding_task: RefCell<Option<Arc<Task>>>,
    pending_timer: RefCell<Option<Arc<Timeout>>>,

    /// Liveness counters read by an external monitor.
    sched_tick: AtomicU64,
    last_sched_tick: AtomicU64,

    terminated: AtomicBool,
    counter: CarrierCounter,
}

// Safety: the non-Sync fields (`current`, `task_cache`, `is_in_critical`,
// `switch_timestamp`, `yielding_task`, `pending_timer`) are only touched by
// the task currently executing on this carrier. Only one task executes at a
// time and the switch protocol's permit lock orders the hand-offs between
// their backing threads, so accesses are serialized even though they come
// from different OS threads. Cross-thread paths (`wakeup_task`, counters,
// status queries) use only atomics and immutable fields.
unsafe impl Send for Carrier {}
unsafe impl Sync for Carrier {}

impl Carrier {
    /// The carrier bound to the calling OS thread, lazily building an
    /// attach-only one for threads the runtime does not own.
    pub fn current() -> Arc<Carrier> {
        context::current_carrier()
    }

    /// Build the carrier for a worker thread. Must be called on that thread.
    pub(crate) fn new_worker(engine: &Arc<Engine>, worker: &Arc<Worker>) -> Arc<Carrier> {
        Self::new(engine, Some(Arc::clone(worker)))
    }

    /// Build an attach-only carrier for the calling foreign thread.
    pub(crate) fn new_attached(engine: &Arc<Engine>) -> Arc<Carrier> {
        Self::new(engine, None)
    }

    fn new(engine: &Arc<Engine>, worker: Option<Arc<Worker>>) -> Arc<Carrier> {
        let thread = thread::current();
        let thread_name = thread.name().unwrap_or("<unnamed>").to_string();
        let thread_task = Task::new_thread_task(engine, &format!("thread: {thread_name}"));
        let carrier = Arc::new(Carrier {
            id: NEXT_CARRIER_ID.fetch_add(1, Ordering::Relaxed),
            engine: Arc::clone(engine),
            thread_id: thread.id(),
            thread_name,
            worker,
            thread_task: Arc::clone(&thread_task),
            current: RefCell::new(Arc::clone(&thread_task)),
            task_cache: RefCell::new(Vec::new()),
            is_in_critical: Cell::new(false),
            switch_timestamp: Cell::new(0),
            yielding_task: RefCell::new(None),
            pending_timer: RefCell::new(None),
            sched_tick: AtomicU64::new(0),
            last_sched_tick: AtomicU64::new(0),
            terminated: AtomicBool::new(false),
            counter: CarrierCounter::default(),
        });
        thread_task.set_carrier(&carrier);
        engine.register_carrier(&carrier);
        carrier
    }

    /// Carrier id; also its ordering key.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub(crate) fn worker(&self) -> Option<Arc<Worker>> {
        self.worker.clone()
    }

    pub(crate) fn thread_task(&self) -> Arc<Task> {
        Arc::clone(&self.thread_task)
    }

    /// The task currently executing on this carrier's thread. Kept correct by
    /// [`Carrier::yield_to`] being the single entry point to any task.
    pub fn get_current_task(&self) -> Arc<Task> {
        self.current.borrow().clone()
    }

    pub(crate) fn is_in_critical(&self) -> bool {
        self.is_in_critical.get()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    fn is_current(&self) -> bool {
        std::ptr::eq(Arc::as_ptr(&context::current_carrier()), self)
    }

    // ----------------------------------------------- lifecycle

    /// Create (or recycle) a task and run it to its first park. The spawn
    /// call itself executes the new task synchronously until it suspends;
    /// control then returns here through the first-park chain.
    pub(crate) fn spawn(
        self: &Arc<Self>,
        target: Target,
        name: &str,
    ) -> Result<Arc<Task>, SpawnError> {
        if self.worker.is_none() {
            return Err(SpawnError::InvalidState);
        }
        if self.engine.has_been_shutdown() && name != SHUTDOWN_TASK_NAME {
            return Err(SpawnError::Rejected);
        }
        let task;
        {
            let _critical = CriticalGuard::enter(&self.is_in_critical);
            self.counter.incr_create_task_count();
            task = match self.task_from_cache() {
                Some(task) => task,
                None => Task::new_task(&self.engine, self),
            };
            task.reset(target, Some(self.get_current_task()), name);
            self.engine.incr_running_tasks();
        }
        self.yield_to(&task);
        self.run_epilog();
        Ok(task)
    }

    /// The only exit path of a task.
    pub(crate) fn task_exit(&self) {
        debug_assert!(self.is_current());
        let current = self.get_current_task();
        debug_assert!(!current.is_thread_task());
        current.set_status(Status::Zombie);
        self.engine.decr_running_tasks();

        self.count_execution_time();
        self.switch_timestamp.set(0);

        self.unregister_event();
        self.return_task_to_cache(Arc::clone(&current));

        // reset the thread wrapper after caching: current-thread queries may
        // still resolve through it during teardown
        current.reset_thread_wrapper();
        self.counter.incr_complete_task_count();

        // a pending shutdown raise lands here; reschedule explicitly rather
        // than returning into the dead frame
        self.schedule();
    }

    fn task_from_cache(self: &Arc<Self>) -> Option<Arc<Task>> {
        debug_assert!(self.is_current());
        if let Some(task) = self.task_cache.borrow_mut().pop() {
            return Some(task);
        }
        if self.engine.has_been_shutdown() {
            return None;
        }
        let task = self.engine.pop_group_task_cache()?;
        let owned = task
            .try_carrier()
            .is_some_and(|carrier| Arc::ptr_eq(&carrier, self));
        if !owned && self.steal(&task) != StealResult::Success {
            self.engine.push_group_task_cache(task);
            return None;
        }
        debug_assert!(
            task.try_carrier()
                .is_some_and(|carrier| Arc::ptr_eq(&carrier, self))
        );
        Some(task)
    }

    fn return_task_to_cache(&self, task: Arc<Task>) {
        // tasks of a shut-down engine are not worth recycling globally
        let mut cache = self.task_cache.borrow_mut();
        if cache.len() >= self.engine.cfg().task_cache_size && !self.engine.has_been_shutdown() {
            drop(cache);
            self.engine.push_group_task_cache(task);
        } else {
            cache.push(task);
        }
    }

    /// Bookkeeping performed on the run-loop task after every resume into it.
    pub(crate) fn run_epilog(&self) {
        self.process_pending_timer();
        self.process_yield();
    }

    /// Drain and free the recycled tasks and the run-loop task.
    pub(crate) fn destroy(&self) {
        for task in self.task_cache.borrow_mut().drain(..) {
            task.release();
        }
        self.thread_task.release();
        *self.pending_timer.borrow_mut() = None;
        self.terminated.store(true, Ordering::Release);
    }

    // ------------------------------------------  scheduling

    /// Park the current task and let the scheduler pick the next one.
    /// Typically called when a resource is not ready.
    pub fn schedule(&self) {
        debug_assert!(self.is_current());
        let current = self.get_current_task();
        self.count_execution_time();
        if current.status() == Status::Runnable {
            current.set_status(Status::Parked);
        }
        match current.take_parent() {
            Some(parent) => {
                debug_assert!(parent.is_runnable());
                debug_assert!(
                    parent
                        .try_carrier()
                        .is_some_and(|c| std::ptr::eq(Arc::as_ptr(&c), self))
                );
                // only the first park goes back to the parent: user code
                // after the spawn continues synchronously
                self.yield_to(&parent);
            }
            None => {
                let entry = current
                    .resume_entry()
                    .expect("schedule() called on the run-loop task");
                debug_assert!(!current.is_thread_task());
                // forbid steals until the switch-out completes, then publish
                // the entry as fair game for any carrier
                current.acquire_steal_lock();
                entry.set_steal_enabled(true);
                self.yield_to(&self.thread_task());
            }
        }
        // `self` may be stale here: the task can resume on a different
        // carrier after a steal. Re-derive everything.
        let carrier = context::current_carrier();
        if carrier.engine.has_been_shutdown()
            && !current.is_thread_task()
            && current.name() != SHUTDOWN_TASK_NAME
        {
            current.ctx().check_pending();
        }
    }

    /// Dispatch `task`'s resume entry on this carrier's worker. Best-effort:
    /// the scheduler may run it elsewhere, in which case the entry steals the
    /// task over. At most one dispatch is in flight per park.
    pub(crate) fn wakeup_task(&self, task: &Arc<Task>) {
        debug_assert!(!task.is_thread_task());
        debug_assert!(
            task.try_carrier()
                .is_some_and(|c| std::ptr::eq(Arc::as_ptr(&c), self))
        );
        let Some(entry) = task.resume_entry() else {
            debug_assert!(false, "waking a task that has no resume entry");
            return;
        };
        if entry.try_enqueue() {
            task.update_enqueue_time();
            if let Err(error) = self
                .engine
                .scheduler
                .execute_with_worker_thread(entry, self.thread_id)
            {
                tracing::warn!(task = %task.name(), %error, "failed to dispatch resume entry");
            }
        }
    }

    /// Move a suspended task's ownership to this carrier.
    pub(crate) fn steal(self: &Arc<Self>, task: &Arc<Task>) -> StealResult {
        // The shutdown task relies on the running count to decide when a
        // worker may exit; no new ownership during a drain.
        if self.engine.has_been_shutdown() {
            return StealResult::FailByStatus;
        }
        debug_assert!(self.is_current());
        debug_assert!(!task.is_thread_task());
        if task
            .try_carrier()
            .is_some_and(|carrier| Arc::ptr_eq(&carrier, self))
        {
            return StealResult::Success;
        }
        // wait out the window between "entry published" and "switch-out
        // complete"; it is a few instructions wide
        while task.steal_lock().load(Ordering::Acquire) != 0 {
            std::hint::spin_loop();
        }
        debug_assert!(!task.has_parent());
        match task.ctx().try_steal() {
            StealResult::Success => {
                task.incr_steal_count();
                task.set_carrier(self);
                StealResult::Success
            }
            failure => {
                task.incr_steal_failure_count();
                failure
            }
        }
    }

    /// The ONLY entry point to a task; keeps `current` correct.
    ///
    /// Returns false without switching when the target is a zombie.
    pub(crate) fn yield_to(&self, task: &Arc<Task>) -> bool {
        debug_assert!(self.is_current());
        debug_assert!(
            task.try_carrier()
                .is_some_and(|c| std::ptr::eq(Arc::as_ptr(&c), self))
        );
        debug_assert!(!Arc::ptr_eq(task, &self.get_current_task()));

        self.sched_tick.fetch_add(1, Ordering::Relaxed);

        if task.status() == Status::Zombie {
            self.unregister_event_for(task);
            return false;
        }

        let from = self.current.replace(Arc::clone(task));
        self.counter.incr_switch_count();
        self.switch_timestamp.set(now_nanos());
        debug_assert!(!self.is_in_critical.get());
        coro::switch_to(&from, task);
        // `from` may have been stolen while suspended; the carrier to query
        // from here on is the current one, never `self`.
        debug_assert!(Arc::ptr_eq(
            &context::current_carrier().get_current_task(),
            &from
        ));
        debug_assert!(!from.carrier().is_in_critical());
        true
    }

    /// Cooperative hint: give other runnable tasks on this carrier a turn.
    pub fn yield_now(&self) {
        if !self.engine.cfg().high_precision_timer
            && let Some(worker) = &self.worker
        {
            worker.process_timers();
        }
        let current = self.get_current_task();
        if !current.is_thread_task() {
            if self.task_queue_length() > 0 {
                debug_assert!(self.yielding_task.borrow().is_none());
                *self.yielding_task.borrow_mut() = Some(current);
                // defer the re-enqueue to the epilog: waking up before the
                // switch-out completes would let another worker steal a
                // still-running stack
                self.schedule();
            }
        } else {
            thread::yield_now();
        }
    }

    fn process_yield(&self) {
        // Usually runs on the run-loop task; a task that yielded during its
        // first-park chain gets re-enqueued from its parent's epilog instead.
        let yielding = self.yielding_task.borrow_mut().take();
        if let Some(task) = yielding {
            self.wakeup_task(&task);
        }
    }

    // ------------------------------------------------ IO

    /// Register the current task's interest in a readiness source.
    ///
    /// The blocking wrapper re-checks in a loop:
    /// ```text
    /// while op_not_ready() {
    ///     carrier.register_event(source, Interest::READABLE);
    ///     carrier.schedule();
    /// }
    /// ```
    pub fn register_event(&self, source: SourceId, interest: Interest) {
        if !interest.is_empty() {
            self.engine.pump().register(&self.get_current_task(), source, interest);
        }
    }

    /// Clear the current task's interest before a non-IO park or task exit,
    /// so a late readiness notification cannot wake an unrelated
    /// reincarnation.
    pub fn unregister_event(&self) {
        self.unregister_event_for(&self.get_current_task());
    }

    fn unregister_event_for(&self, task: &Arc<Task>) {
        if task.source().is_some() {
            task.set_source(None);
        }
    }

    // ------------------------------------------------ timer support

    /// Arm a deadline for the current task, used for timed waits and sleeps.
    pub fn add_timer(&self, deadline: Instant) {
        let task = self.get_current_task();
        let timeout = Arc::new(Timeout::new(Arc::clone(&task), deadline));
        task.set_timeout(Some(Arc::clone(&timeout)));

        if self.engine.cfg().high_precision_timer {
            if task.is_thread_task() {
                self.schedule_in_timer(timeout);
            } else {
                // registering with the timer service from an arbitrary task
                // could park again; delegate to the run-loop task's epilog
                *self.pending_timer.borrow_mut() = Some(timeout);
            }
        } else {
            self.engine.scheduler.add_timer(timeout, self.thread_id);
        }
    }

    /// Cancel the timer armed by [`Carrier::add_timer`].
    pub fn cancel_timer(&self) {
        if let Some(timeout) = self.get_current_task().take_timeout() {
            timeout.cancel();
            if !self.engine.cfg().high_precision_timer {
                self.engine.scheduler.cancel_timer(&timeout, self.thread_id);
            }
        }
        *self.pending_timer.borrow_mut() = None;
    }

    fn process_pending_timer(&self) {
        if self.engine.cfg().high_precision_timer
            && let Some(timeout) = self.pending_timer.borrow_mut().take()
        {
            self.schedule_in_timer(timeout);
        }
    }

    fn schedule_in_timer(&self, timeout: Arc<Timeout>) {
        let _critical = CriticalGuard::enter(&self.is_in_critical);
        if timeout.deadline() > Instant::now() {
            self.engine.timer_service().schedule(timeout);
        } else if !timeout.is_canceled() {
            timeout.task().unpark();
        }
    }

    // ----------------------------------------------- status fetch

    /// Whether the carrier is busy running a task (as opposed to sitting in
    /// its scheduler loop).
    pub fn is_running(&self) -> bool {
        !Arc::ptr_eq(&self.get_current_task(), &self.thread_task)
    }

    pub(crate) fn task_queue_length(&self) -> usize {
        self.worker
            .as_ref()
            .map(|worker| worker.queue_length())
            .unwrap_or(0)
    }

    pub fn running_task_count(&self) -> usize {
        self.engine.running_task_count()
    }

    pub fn counter(&self) -> &CarrierCounter {
        &self.counter
    }

    pub fn sched_tick(&self) -> u64 {
        self.sched_tick.load(Ordering::Relaxed)
    }

    /// Racy unless the carrier is idle; tests only.
    #[cfg(test)]
    pub(crate) fn task_cache_len(&self) -> usize {
        self.task_cache.borrow().len()
    }

    /// Record the tick an external monitor last observed.
    pub fn record_observed_tick(&self) {
        self.last_sched_tick
            .store(self.sched_tick(), Ordering::Relaxed);
    }

    pub(crate) fn signal_worker(&self) {
        if let Some(worker) = &self.worker {
            worker.signal();
        }
    }

    // -----------------------------------------------  retake

    /// Ask the scheduler to detach this carrier's worker from its OS thread
    /// for the duration of a presumed blocking syscall.
    pub fn hand_off(&self) {
        debug_assert!(self.worker.is_some(), "attach-only carriers have no worker");
        self.engine.scheduler.hand_off_worker_thread(self.thread_id);
    }

    // ----------------------------------------------- accounting

    fn count_execution_time(&self) {
        let since = self.switch_timestamp.get();
        if since != 0 {
            self.counter
                .add_execution_nanos(now_nanos().saturating_sub(since));
        }
    }

    pub(crate) fn count_enqueue_time(&self, enqueued_at: u64) {
        if enqueued_at != 0 {
            self.counter
                .add_enqueue_nanos(now_nanos().saturating_sub(enqueued_at));
        }
    }
}

impl PartialEq for Carrier {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Carrier {}

impl PartialOrd for Carrier {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Carrier {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.id.cmp(&other.id)
    }
}

impl fmt::Display for Carrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Carrier on {}", self.thread_name)
    }
}

impl fmt::Debug for Carrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Carrier")
            .field("id", &self.id)
            .field("thread", &self.thread_name)
            .field("terminated", &self.is_terminated())
            .finish_non_exhaustive()
    }
}

/// Closure-with-state enqueued into a worker's runqueue; dispatching it
/// resumes exactly one parked task, stealing it over to the dispatching
/// carrier when necessary.
pub(crate) struct ResumeEntry {
    task: Arc<Task>,
    /// Incarnation this entry was built for; a dispatch for a recycled task
    /// is dead on arrival.
    generation: u64,
    steal_enabled: AtomicBool,
    /// Set while the entry sits in a queue; guarantees at most one dispatch
    /// per park.
    queued: AtomicBool,
}

impl ResumeEntry {
    pub(crate) fn new(task: Arc<Task>) -> Self {
        debug_assert!(!task.is_thread_task());
        let generation = task.generation();
        ResumeEntry {
            task,
            generation,
            steal_enabled: AtomicBool::new(true),
            queued: AtomicBool::new(false),
        }
    }

    pub(crate) fn try_enqueue(&self) -> bool {
        self.queued
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl StealAware for ResumeEntry {
    fn run(&self) {
        let current = context::current_carrier();
        self.queued.store(false, Ordering::Release);
        let task = &self.task;
        if task.generation() != self.generation {
            return; // the task was recycled under this entry
        }

        /*
         * task.carrier cannot change under us here: parking always publishes
         * through this entry and each enqueue has exactly one consumer, so no
         * other thread is racing to steal this task.
         */
        let source = task.try_carrier();
        let stolen_from = match &source {
            Some(source_carrier) if !Arc::ptr_eq(source_carrier, &current) => {
                match current.steal(task) {
                    StealResult::Success => Some(Arc::clone(source_carrier)),
                    result => {
                        if result != StealResult::FailByContention {
                            // not retryable; keep the task on its carrier
                            self.set_steal_enabled(false);
                        }
                        source_carrier.wakeup_task(task);
                        return;
                    }
                }
            }
            Some(_) => None,
            None => {
                // the owning carrier's worker exited; adopt the orphan
                match current.steal(task) {
                    StealResult::Success => None,
                    result => {
                        tracing::warn!(
                            task = %task.name(),
                            ?result,
                            "failed to adopt a task whose carrier is gone"
                        );
                        return;
                    }
                }
            }
        };

        // a handed-off worker with nothing left to run may now exit
        if let Some(source_carrier) = stolen_from
            && let Some(worker) = source_carrier.worker()
            && worker.has_been_handoff()
            && current.engine().running_task_count() == 0
        {
            worker.signal();
        }

        current.count_enqueue_time(task.take_enqueue_time());
        if task.status() == Status::Parked {
            task.set_status(Status::Runnable);
        }
        current.yield_to(task);
        current.run_epilog();
    }

    fn is_steal_enabled(&self) -> bool {
        self.steal_enabled.load(Ordering::Acquire)
    }

    fn set_steal_enabled(&self, enabled: bool) {
        self.steal_enabled.store(enabled, Ordering::Release);
    }
}
