//! Carrier core of a user-space M:N coroutine runtime.
//!
//! Lightweight tasks are multiplexed onto a pool of worker threads, each
//! driven by a [`Carrier`] — the per-thread scheduler that owns its tasks'
//! life cycle, context-switches cooperatively between them, and interlocks
//! with the work-stealing scheduler, the timer services, and the I/O
//! readiness pump.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! let runtime = strand::Builder::new().worker_threads(2).try_build().unwrap();
//!
//! let handle = runtime.spawn(|| {
//!     strand::sleep(Duration::from_millis(5));
//!     42
//! });
//!
//! assert_eq!(handle.join().unwrap(), 42);
//! runtime.shutdown().unwrap();
//! ```

pub(crate) mod context;

pub(crate) mod coro;

mod counter;
pub use counter::CarrierCounter;

mod errors;
pub use errors::{JoinError, SpawnError};

pub(crate) mod pump;
pub use pump::{Interest, SourceId};

pub mod runtime;
pub use runtime::runtime::JoinHandle;
pub use runtime::{Builder, Runtime};
pub use runtime::carrier::Carrier;

pub(crate) mod task;
pub use task::{Task, TaskThread};

pub(crate) mod timer;

pub(crate) mod utils;

#[cfg(test)]
pub(crate) mod test_utils;

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Spawn a task on the calling thread's carrier.
///
/// The new task runs synchronously until its first park, then control
/// returns here. Only valid inside the runtime (on a worker or inside
/// another task); an attach-only carrier refuses with
/// [`SpawnError::InvalidState`]. For submitting work from outside, see
/// [`Runtime::spawn`].
pub fn spawn<F>(f: F) -> Result<Arc<Task>, SpawnError>
where
    F: FnOnce() + Send + 'static,
{
    spawn_named("strand-task", f)
}

/// [`spawn`] with a task name for logs and identity queries.
pub fn spawn_named<F>(name: &str, f: F) -> Result<Arc<Task>, SpawnError>
where
    F: FnOnce() + Send + 'static,
{
    context::current_carrier().spawn(Box::new(f), name)
}

/// Give other runnable tasks on the current carrier a turn.
pub fn yield_now() {
    context::current_carrier().yield_now();
}

/// Park the current task for at least `duration`.
///
/// Outside a task this falls back to blocking the OS thread.
pub fn sleep(duration: Duration) {
    let carrier = context::current_carrier();
    if carrier.get_current_task().is_thread_task() {
        std::thread::sleep(duration);
        return;
    }
    carrier.add_timer(Instant::now() + duration);
    carrier.schedule();
    // the task may have resumed on a different carrier
    Carrier::current().cancel_timer();
}

/// Identity of the logical thread of execution: the task's wrapper when
/// called inside a task, the OS thread otherwise.
pub fn current_thread() -> TaskThread {
    if let Some(task) = context::try_current_task()
        && let Some(wrapper) = task.thread_wrapper()
    {
        return wrapper;
    }
    TaskThread::for_os_thread()
}
