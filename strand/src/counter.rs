use std::sync::atomic::{AtomicU64, Ordering};

/// Per-carrier scheduling counters.
///
/// Updated by the carrier on its own execution path; read by anyone (an
/// external monitor, tests). All counters are monotonic.
#[derive(Debug, Default)]
pub struct CarrierCounter {
    switch_count: AtomicU64,
    create_task_count: AtomicU64,
    complete_task_count: AtomicU64,
    enqueue_count: AtomicU64,
    total_enqueue_nanos: AtomicU64,
    execution_count: AtomicU64,
    total_execution_nanos: AtomicU64,
}

impl CarrierCounter {
    pub(crate) fn incr_switch_count(&self) {
        self.switch_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_create_task_count(&self) {
        self.create_task_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_complete_task_count(&self) {
        self.complete_task_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_enqueue_nanos(&self, nanos: u64) {
        self.enqueue_count.fetch_add(1, Ordering::Relaxed);
        self.total_enqueue_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    pub(crate) fn add_execution_nanos(&self, nanos: u64) {
        self.execution_count.fetch_add(1, Ordering::Relaxed);
        self.total_execution_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    pub fn switch_count(&self) -> u64 {
        self.switch_count.load(Ordering::Relaxed)
    }

    pub fn create_task_count(&self) -> u64 {
        self.create_task_count.load(Ordering::Relaxed)
    }

    pub fn complete_task_count(&self) -> u64 {
        self.complete_task_count.load(Ordering::Relaxed)
    }

    pub fn enqueue_count(&self) -> u64 {
        self.enqueue_count.load(Ordering::Relaxed)
    }

    pub fn total_enqueue_nanos(&self) -> u64 {
        self.total_enqueue_nanos.load(Ordering::Relaxed)
    }

    pub fn execution_count(&self) -> u64 {
        self.execution_count.load(Ordering::Relaxed)
    }

    pub fn total_execution_nanos(&self) -> u64 {
        self.total_execution_nanos.load(Ordering::Relaxed)
    }
}
