//! Task: a coroutine with scheduling metadata.
//!
//! A task couples a [`Context`] with its status, its owning carrier, the
//! single-use parent link used by the first-park chain, the resume entry that
//! re-enters it through a worker queue, and its I/O and timer bookkeeping.
//! Exited tasks are recycled: `reset` re-creates a logically new task on the
//! same context.

use crate::coro::Context;
use crate::pump::SourceId;
use crate::runtime::carrier::{Carrier, ResumeEntry};
use crate::runtime::engine::Engine;
use crate::timer::Timeout;
use crate::utils::now_nanos;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Name of the distinguished task that drains a worker during engine
/// shutdown. The only task that may be spawned after shutdown.
pub(crate) const SHUTDOWN_TASK_NAME: &str = "strand-shutdown";

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_THREAD_WRAPPER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity value answering "what thread am I on?" for code running inside a
/// task. Distinct from any OS thread identity: a task keeps its `TaskThread`
/// across steals, and a recycled task gets a fresh one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskThread {
    id: u64,
    name: String,
}

impl TaskThread {
    pub(crate) fn new(name: &str) -> Self {
        TaskThread {
            id: NEXT_THREAD_WRAPPER_ID.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
        }
    }

    /// Identity for a plain OS thread observed outside any task.
    pub(crate) fn for_os_thread() -> Self {
        let current = std::thread::current();
        TaskThread {
            id: NEXT_THREAD_WRAPPER_ID.fetch_add(1, Ordering::Relaxed),
            name: current.name().unwrap_or("<unnamed>").to_string(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Status {
    Runnable = 0,
    Parked = 1,
    Zombie = 2,
}

impl Status {
    fn from_u8(raw: u8) -> Status {
        match raw {
            0 => Status::Runnable,
            1 => Status::Parked,
            2 => Status::Zombie,
            _ => unreachable!("invalid task status"),
        }
    }
}

/// The closure a task incarnation executes.
pub(crate) type Target = Box<dyn FnOnce() + Send + 'static>;

pub struct Task {
    id: u64,
    ctx: Context,
    is_thread_task: bool,
    status: AtomicU8,
    engine: Weak<Engine>,

    /// The carrier currently owning this task. Written only at construction
    /// and by a successful steal. Weak: carriers own their tasks through the
    /// caches, not the other way around.
    carrier: RwLock<Weak<Carrier>>,

    name: Mutex<String>,

    /// The task that entered this one during a first-park chain. Single-use:
    /// cleared at the first `schedule()`.
    parent: Mutex<Option<Arc<Task>>>,

    /// Re-entry point through a worker queue. None for run-loop tasks.
    resume_entry: Mutex<Option<Arc<ResumeEntry>>>,

    target: Mutex<Option<Target>>,
    thread_wrapper: Mutex<Option<TaskThread>>,

    /// Active deadline record, if any.
    timeout: Mutex<Option<Arc<Timeout>>>,

    /// Channel (readiness source) this task is waiting on, if any.
    source: Mutex<Option<SourceId>>,
    register_event_time: AtomicU64,

    enqueue_time: AtomicU64,

    /// Bumped by every reset. A resume entry carries the generation it was
    /// built for, so an entry left over from a previous incarnation is dead
    /// on dispatch instead of spuriously resuming the recycled task.
    generation: AtomicU64,

    /// Non-zero while a steal is forbidden: between "resume entry published"
    /// and "context fully suspended". Cleared by the context under its
    /// control lock.
    steal_lock: AtomicU32,
    steal_count: AtomicU32,
    steal_failure_count: AtomicU32,
}

impl Task {
    /// Allocate a task bound to `carrier` and start its backing context.
    pub(crate) fn new_task(engine: &Arc<Engine>, carrier: &Arc<Carrier>) -> Arc<Task> {
        let id = NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed);
        let task = Arc::new(Task {
            id,
            ctx: Context::for_task(),
            is_thread_task: false,
            status: AtomicU8::new(Status::Runnable as u8),
            engine: Arc::downgrade(engine),
            carrier: RwLock::new(Arc::downgrade(carrier)),
            name: Mutex::new(String::new()),
            parent: Mutex::new(None),
            resume_entry: Mutex::new(None),
            target: Mutex::new(None),
            thread_wrapper: Mutex::new(None),
            timeout: Mutex::new(None),
            source: Mutex::new(None),
            register_event_time: AtomicU64::new(0),
            enqueue_time: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            steal_lock: AtomicU32::new(0),
            steal_count: AtomicU32::new(0),
            steal_failure_count: AtomicU32::new(0),
        });
        task.ctx.bind(
            Arc::downgrade(&task),
            format!("{}-task-{}", engine.cfg().thread_name, id),
            engine.cfg().thread_stack_size,
        );
        engine.track_task(&task);
        task
    }

    /// The run-loop task of a carrier, wrapping the carrier thread's native
    /// context. Never enters a worker queue and is never stolen.
    pub(crate) fn new_thread_task(engine: &Arc<Engine>, name: &str) -> Arc<Task> {
        let task = Arc::new(Task {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            ctx: Context::native(),
            is_thread_task: true,
            status: AtomicU8::new(Status::Runnable as u8),
            engine: Arc::downgrade(engine),
            carrier: RwLock::new(Weak::new()),
            name: Mutex::new(name.to_string()),
            parent: Mutex::new(None),
            resume_entry: Mutex::new(None),
            target: Mutex::new(None),
            thread_wrapper: Mutex::new(Some(TaskThread::new(name))),
            timeout: Mutex::new(None),
            source: Mutex::new(None),
            register_event_time: AtomicU64::new(0),
            enqueue_time: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            steal_lock: AtomicU32::new(0),
            steal_count: AtomicU32::new(0),
            steal_failure_count: AtomicU32::new(0),
        });
        engine.track_task(&task);
        task
    }

    /// Re-create a logically new task on this context. The caller owns the
    /// task (fresh allocation or cache hit with `carrier == self`).
    pub(crate) fn reset(
        self: &Arc<Self>,
        target: Target,
        parent: Option<Arc<Task>>,
        name: &str,
    ) {
        debug_assert!(!self.is_thread_task);
        *self.name.lock() = name.to_string();
        self.set_status(Status::Runnable);
        *self.target.lock() = Some(target);
        *self.parent.lock() = parent;
        *self.thread_wrapper.lock() = Some(TaskThread::new(name));
        self.generation.fetch_add(1, Ordering::AcqRel);
        *self.resume_entry.lock() = Some(Arc::new(ResumeEntry::new(self.clone())));
        self.enqueue_time.store(0, Ordering::Relaxed);
        self.steal_lock.store(0, Ordering::Relaxed);
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub(crate) fn ctx(&self) -> &Context {
        &self.ctx
    }

    pub(crate) fn is_thread_task(&self) -> bool {
        self.is_thread_task
    }

    pub(crate) fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: Status) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub(crate) fn is_runnable(&self) -> bool {
        self.status() == Status::Runnable
    }

    /// The owning carrier. Panics if the carrier has been torn down; use
    /// [`Task::try_carrier`] on recycle paths where that is expected.
    pub(crate) fn carrier(&self) -> Arc<Carrier> {
        self.try_carrier().expect("task's carrier has been destroyed")
    }

    pub(crate) fn try_carrier(&self) -> Option<Arc<Carrier>> {
        self.carrier.read().upgrade()
    }

    /// Reparent to a new carrier. Only a successful steal calls this.
    pub(crate) fn set_carrier(&self, carrier: &Arc<Carrier>) {
        *self.carrier.write() = Arc::downgrade(carrier);
    }

    pub(crate) fn take_parent(&self) -> Option<Arc<Task>> {
        self.parent.lock().take()
    }

    pub(crate) fn has_parent(&self) -> bool {
        self.parent.lock().is_some()
    }

    pub(crate) fn resume_entry(&self) -> Option<Arc<ResumeEntry>> {
        self.resume_entry.lock().clone()
    }

    pub(crate) fn take_target(&self) -> Option<Target> {
        self.target.lock().take()
    }

    pub(crate) fn thread_wrapper(&self) -> Option<TaskThread> {
        self.thread_wrapper.lock().clone()
    }

    /// Cleared after the task is returned to a cache so that current-thread
    /// queries during teardown do not observe a recycled identity.
    pub(crate) fn reset_thread_wrapper(&self) {
        *self.thread_wrapper.lock() = None;
    }

    pub(crate) fn timeout(&self) -> Option<Arc<Timeout>> {
        self.timeout.lock().clone()
    }

    pub(crate) fn set_timeout(&self, timeout: Option<Arc<Timeout>>) {
        *self.timeout.lock() = timeout;
    }

    pub(crate) fn take_timeout(&self) -> Option<Arc<Timeout>> {
        self.timeout.lock().take()
    }

    pub(crate) fn source(&self) -> Option<SourceId> {
        *self.source.lock()
    }

    pub(crate) fn set_source(&self, source: Option<SourceId>) {
        *self.source.lock() = source;
        if source.is_some() {
            self.register_event_time.store(now_nanos(), Ordering::Relaxed);
        } else {
            self.register_event_time.store(0, Ordering::Relaxed);
        }
    }

    /// When the current I/O interest was registered; 0 when there is none.
    pub(crate) fn register_event_time(&self) -> u64 {
        self.register_event_time.load(Ordering::Relaxed)
    }

    pub(crate) fn update_enqueue_time(&self) {
        self.enqueue_time.store(now_nanos(), Ordering::Relaxed);
    }

    pub(crate) fn take_enqueue_time(&self) -> u64 {
        self.enqueue_time.swap(0, Ordering::Relaxed)
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn steal_lock(&self) -> &AtomicU32 {
        &self.steal_lock
    }

    pub(crate) fn acquire_steal_lock(&self) {
        self.steal_lock.store(1, Ordering::Release);
    }

    pub(crate) fn incr_steal_count(&self) {
        self.steal_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_steal_failure_count(&self) {
        self.steal_failure_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn steal_count(&self) -> u32 {
        self.steal_count.load(Ordering::Relaxed)
    }

    pub(crate) fn steal_failure_count(&self) -> u32 {
        self.steal_failure_count.load(Ordering::Relaxed)
    }

    /// Wake a parked task through the standard path: enqueue its resume entry
    /// on its owning carrier's worker. Waking the run-loop task signals the
    /// worker directly.
    pub(crate) fn unpark(self: &Arc<Self>) {
        if self.is_thread_task {
            if let Some(carrier) = self.try_carrier() {
                carrier.signal_worker();
            }
        } else if let Some(carrier) = self.try_carrier() {
            carrier.wakeup_task(self);
        }
    }

    /// Drop everything that keeps the context and its peers alive. Called
    /// when the task is freed for good (carrier destroy, engine drain), not
    /// on recycling.
    pub(crate) fn release(&self) {
        self.ctx.release();
        *self.resume_entry.lock() = None;
        *self.target.lock() = None;
        *self.parent.lock() = None;
        *self.timeout.lock() = None;
        *self.source.lock() = None;
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.upgrade() {
            engine.untrack_task(self.id);
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name.lock())
            .field("status", &self.status())
            .field("is_thread_task", &self.is_thread_task)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Task: Send, Sync);
    assert_impl_all!(TaskThread: Send, Sync, Clone);

    #[test]
    fn thread_wrapper_identities_are_unique() {
        let a = TaskThread::new("a");
        let b = TaskThread::new("a");
        assert_ne!(a, b);
        assert_eq!(a.name(), b.name());
    }

    #[test]
    fn status_round_trips() {
        for status in [Status::Runnable, Status::Parked, Status::Zombie] {
            assert_eq!(Status::from_u8(status as u8), status);
        }
    }
}
