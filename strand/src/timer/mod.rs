//! Deadline support for parked tasks.
//!
//! A [`Timeout`] is a per-task deadline record. Firing one wakes its task
//! through the standard unpark path; a canceled fire is a no-op. In
//! low-precision mode timeouts live in the owning worker's [`TimerQueue`] and
//! are processed on each scheduler pass; in high-precision mode they go to
//! the engine's shared [`TimerService`] thread.

use crate::task::Task;
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;

#[derive(Debug)]
pub(crate) struct Timeout {
    task: Arc<Task>,
    deadline: Instant,
    canceled: AtomicBool,
}

impl Timeout {
    pub(crate) fn new(task: Arc<Task>, deadline: Instant) -> Self {
        Timeout {
            task,
            deadline,
            canceled: AtomicBool::new(false),
        }
    }

    pub(crate) fn task(&self) -> &Arc<Task> {
        &self.task
    }

    pub(crate) fn deadline(&self) -> Instant {
        self.deadline
    }

    pub(crate) fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Wake the owning task, unless canceled in the meantime.
    pub(crate) fn fire(&self) {
        if !self.is_canceled() {
            self.task.unpark();
        }
    }
}

/// Min-heap entry ordered by deadline.
struct Deadline(Arc<Timeout>);

impl PartialEq for Deadline {
    fn eq(&self, other: &Self) -> bool {
        self.0.deadline == other.0.deadline
    }
}

impl Eq for Deadline {}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; invert to pop the earliest deadline.
        other.0.deadline.cmp(&self.0.deadline)
    }
}

/// Coarse per-worker timer queue, processed by the worker loop and by
/// cooperative yields.
#[derive(Default)]
pub(crate) struct TimerQueue {
    heap: Mutex<BinaryHeap<Deadline>>,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        TimerQueue::default()
    }

    pub(crate) fn add(&self, timeout: Arc<Timeout>) {
        self.heap.lock().push(Deadline(timeout));
    }

    /// Drop a canceled timeout from the queue. Rebuilds the heap; cancel is
    /// rare compared to add/fire.
    pub(crate) fn remove(&self, timeout: &Arc<Timeout>) {
        let mut heap = self.heap.lock();
        let retained: BinaryHeap<Deadline> = heap
            .drain()
            .filter(|entry| !Arc::ptr_eq(&entry.0, timeout))
            .collect();
        *heap = retained;
    }

    /// Fire every due timeout. Returns how many fired.
    pub(crate) fn process_due(&self, now: Instant) -> usize {
        let mut fired = 0;
        loop {
            let due = {
                let mut heap = self.heap.lock();
                match heap.peek() {
                    Some(entry) if entry.0.deadline <= now => heap.pop(),
                    _ => None,
                }
            };
            match due {
                // fire outside the lock: unpark takes scheduler paths
                Some(entry) => {
                    entry.0.fire();
                    fired += 1;
                }
                None => break,
            }
        }
        fired
    }

    /// Earliest pending deadline, skipping already-canceled entries at the
    /// top of the heap.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        let mut heap = self.heap.lock();
        while let Some(entry) = heap.peek() {
            if entry.0.is_canceled() {
                heap.pop();
                continue;
            }
            return Some(entry.0.deadline);
        }
        None
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }
}

struct ServiceShared {
    heap: Mutex<BinaryHeap<Deadline>>,
    wakeup: Condvar,
    shutdown: AtomicBool,
}

/// Shared high-precision timer service: one dedicated thread sleeping until
/// the earliest deadline.
pub(crate) struct TimerService {
    shared: Arc<ServiceShared>,
}

impl TimerService {
    pub(crate) fn start(thread_name: &str) -> Self {
        let shared = Arc::new(ServiceShared {
            heap: Mutex::new(BinaryHeap::new()),
            wakeup: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let worker = Arc::clone(&shared);
        thread::Builder::new()
            .name(format!("{thread_name}-timer"))
            .spawn(move || Self::run(worker))
            .expect("failed to spawn timer service thread");
        TimerService { shared }
    }

    pub(crate) fn schedule(&self, timeout: Arc<Timeout>) {
        self.shared.heap.lock().push(Deadline(timeout));
        self.shared.wakeup.notify_one();
    }

    pub(crate) fn stop(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wakeup.notify_one();
    }

    fn run(shared: Arc<ServiceShared>) {
        let mut heap = shared.heap.lock();
        loop {
            if shared.shutdown.load(Ordering::Acquire) {
                return;
            }
            match heap.peek().map(|entry| entry.0.deadline) {
                None => shared.wakeup.wait(&mut heap),
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline <= now {
                        let entry = heap.pop().expect("peeked entry vanished");
                        // fire outside the lock: unpark takes scheduler paths
                        drop(heap);
                        entry.0.fire();
                        heap = shared.heap.lock();
                    } else {
                        let _ = shared.wakeup.wait_until(&mut heap, deadline);
                    }
                }
            }
        }
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.stop();
    }
}
