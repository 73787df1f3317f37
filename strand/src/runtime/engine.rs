//! Process-wide runtime state shared by all carriers of one runtime: the
//! scheduler, the running-task counter, the engine-wide task cache, the
//! shutdown flag, the shared timer service, and the event pump.

use crate::context;
use crate::pump::EventPump;
use crate::runtime::carrier::Carrier;
use crate::runtime::scheduler::{Scheduler, SpawnEntry};
use crate::runtime::RuntimeConfig;
use crate::task::{SHUTDOWN_TASK_NAME, Status, Task};
use crate::timer::TimerService;
use anyhow::Result;
use crossbeam_queue::SegQueue;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

pub(crate) struct Engine {
    cfg: RuntimeConfig,
    pub(crate) scheduler: Arc<Scheduler>,

    /// Number of live non-thread tasks across all carriers.
    running_tasks: AtomicUsize,

    /// Overflow of the per-carrier recycle caches. Multi-producer,
    /// multi-consumer; a carrier popping a foreign task steals it first.
    group_task_cache: SegQueue<Arc<Task>>,

    has_been_shutdown: AtomicBool,

    /// Every task ever allocated and still alive, by id. Shutdown walks this
    /// to raise the pending interrupt on live tasks.
    tracker: DashMap<u64, Weak<Task>>,

    /// Live carriers by id, for monitoring and teardown.
    carriers: DashMap<u64, Arc<Carrier>>,

    /// High-precision timer service, started on first use.
    timer_service: OnceLock<TimerService>,

    pump: EventPump,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("running_tasks", &self.running_task_count())
            .field("has_been_shutdown", &self.has_been_shutdown())
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub(crate) fn new(cfg: RuntimeConfig) -> Arc<Engine> {
        let scheduler = Arc::new(Scheduler::new(&cfg));
        Arc::new(Engine {
            cfg,
            scheduler,
            running_tasks: AtomicUsize::new(0),
            group_task_cache: SegQueue::new(),
            has_been_shutdown: AtomicBool::new(false),
            tracker: DashMap::new(),
            carriers: DashMap::new(),
            timer_service: OnceLock::new(),
            pump: EventPump::new(),
        })
    }

    /// The process-root engine backing lazily-attached foreign threads. It
    /// has no workers and is never shut down.
    pub(crate) fn root() -> &'static Arc<Engine> {
        static ROOT: OnceLock<Arc<Engine>> = OnceLock::new();
        ROOT.get_or_init(|| Engine::new(RuntimeConfig::attach_only()))
    }

    pub(crate) fn start_workers(self: &Arc<Self>) -> Result<()> {
        self.scheduler.start(self)
    }

    pub(crate) fn cfg(&self) -> &RuntimeConfig {
        &self.cfg
    }

    pub(crate) fn pump(&self) -> &EventPump {
        &self.pump
    }

    pub(crate) fn timer_service(&self) -> &TimerService {
        self.timer_service
            .get_or_init(|| TimerService::start(&self.cfg.thread_name))
    }

    pub(crate) fn has_been_shutdown(&self) -> bool {
        self.has_been_shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn running_task_count(&self) -> usize {
        self.running_tasks.load(Ordering::Acquire)
    }

    pub(crate) fn incr_running_tasks(&self) {
        self.running_tasks.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn decr_running_tasks(&self) {
        let prev = self.running_tasks.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "running task count underflow");
        // the last exit during a drain unblocks idle workers
        if prev == 1 && self.has_been_shutdown() {
            self.scheduler.signal_all();
        }
    }

    pub(crate) fn pop_group_task_cache(&self) -> Option<Arc<Task>> {
        self.group_task_cache.pop()
    }

    pub(crate) fn push_group_task_cache(&self, task: Arc<Task>) {
        self.group_task_cache.push(task);
    }

    #[cfg(test)]
    pub(crate) fn group_task_cache_len(&self) -> usize {
        self.group_task_cache.len()
    }

    #[cfg(test)]
    pub(crate) fn worker_carriers(&self) -> Vec<Arc<Carrier>> {
        self.carriers
            .iter()
            .filter(|entry| entry.value().worker().is_some())
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Flip the shutdown flag without draining; spawn/steal rejection tests
    /// only.
    #[cfg(test)]
    pub(crate) fn force_shutdown_flag(&self) {
        self.has_been_shutdown.store(true, Ordering::Release);
        self.scheduler.signal_all();
    }

    pub(crate) fn track_task(&self, task: &Arc<Task>) {
        self.tracker.insert(task.id(), Arc::downgrade(task));
    }

    pub(crate) fn untrack_task(&self, id: u64) {
        self.tracker.remove(&id);
    }

    pub(crate) fn register_carrier(&self, carrier: &Arc<Carrier>) {
        self.carriers.insert(carrier.id(), Arc::clone(carrier));
    }

    pub(crate) fn unregister_carrier(&self, id: u64) {
        self.carriers.remove(&id);
    }

    /// Build an attach-only carrier for a thread the runtime does not own.
    pub(crate) fn attach_current_thread(self: &Arc<Self>) -> Arc<Carrier> {
        Carrier::new_attached(self)
    }

    /// Cooperative drain. New spawns and new steals are rejected from here
    /// on; a distinguished shutdown task on each worker raises the pending
    /// interrupt on that carrier's live tasks; workers exit once the running
    /// count reaches zero.
    pub(crate) fn shutdown(self: &Arc<Self>) -> Result<()> {
        if self.has_been_shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::debug!("engine shutting down");
        for worker in &self.scheduler.workers {
            let engine = Arc::clone(self);
            let entry = Arc::new(SpawnEntry::new_pinned(
                SHUTDOWN_TASK_NAME,
                Box::new(move || engine.raise_pending_interrupts()),
            ));
            self.scheduler.execute_on(worker, entry);
        }
        self.scheduler.signal_all();
        self.scheduler.join_all()?;

        // free recycled tasks parked in the engine-wide cache
        while let Some(task) = self.group_task_cache.pop() {
            task.release();
        }
        if let Some(service) = self.timer_service.get() {
            service.stop();
        }
        Ok(())
    }

    /// Body of the per-worker shutdown task: raise the pending interrupt on
    /// every live task owned by the carrier this runs on, and wake the parked
    /// ones so they observe it.
    fn raise_pending_interrupts(&self) {
        let carrier = context::current_carrier();
        let current = context::try_current_task();
        for item in self.tracker.iter() {
            let Some(task) = item.value().upgrade() else {
                continue;
            };
            if task.is_thread_task() || task.status() == Status::Zombie {
                continue;
            }
            if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, &task)) {
                continue;
            }
            let Some(owner) = task.try_carrier() else {
                continue;
            };
            if !Arc::ptr_eq(&owner, &carrier) {
                continue;
            }
            task.ctx().set_pending_interrupt();
            task.unpark();
        }
    }
}
