//! Thread-local carrier registry.
//!
//! Every OS thread that touches the runtime has a current task: worker
//! threads install their run-loop task at startup, task backing threads
//! install their task before the first resume, and any other thread gets an
//! attach-only carrier built lazily on first use. The current carrier is
//! always derived from the current task — after a steal, the task points at
//! its new carrier and this lookup follows it.

use crate::runtime::carrier::Carrier;
use crate::runtime::engine::Engine;
use crate::task::Task;
use std::cell::RefCell;
use std::sync::Arc;

thread_local! {
    static CURRENT_TASK: RefCell<Option<Arc<Task>>> = const { RefCell::new(None) };

    /// Present only on lazily-attached threads; destroys the attach-only
    /// carrier when the OS thread exits.
    static ATTACH_GUARD: RefCell<Option<AttachGuard>> = const { RefCell::new(None) };
}

struct AttachGuard {
    carrier: Arc<Carrier>,
}

impl Drop for AttachGuard {
    fn drop(&mut self) {
        self.carrier.destroy();
        self.carrier.engine().unregister_carrier(self.carrier.id());
        // TLS teardown order is unspecified; the slot may already be gone.
        let _ = CURRENT_TASK.try_with(|slot| {
            if let Ok(mut slot) = slot.try_borrow_mut() {
                *slot = None;
            }
        });
    }
}

pub(crate) fn set_current_task(task: Option<Arc<Task>>) {
    CURRENT_TASK.with(|slot| *slot.borrow_mut() = task);
}

pub(crate) fn try_current_task() -> Option<Arc<Task>> {
    CURRENT_TASK.with(|slot| slot.borrow().clone())
}

/// The carrier bound to the calling OS thread, creating an attach-only one
/// on first use for threads the runtime does not own.
pub(crate) fn current_carrier() -> Arc<Carrier> {
    if let Some(task) = try_current_task() {
        return task.carrier();
    }
    let carrier = Engine::root().attach_current_thread();
    set_current_task(Some(carrier.thread_task()));
    ATTACH_GUARD.with(|slot| {
        *slot.borrow_mut() = Some(AttachGuard {
            carrier: Arc::clone(&carrier),
        });
    });
    carrier
}

/// Install a worker carrier's run-loop task on the calling thread. No attach
/// guard: the worker loop destroys its carrier on exit.
pub(crate) fn install_worker_carrier(carrier: &Arc<Carrier>) {
    debug_assert!(try_current_task().is_none(), "thread already has a carrier");
    set_current_task(Some(carrier.thread_task()));
}

pub(crate) fn clear_current_task() {
    set_current_task(None);
}
