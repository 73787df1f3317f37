use crate::errors::JoinError;
use crate::pump::{Interest, SourceId};
use crate::runtime::engine::Engine;
use crate::runtime::scheduler::SpawnEntry;
use anyhow::{Result, anyhow};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;

/// Default per-carrier recycle cap; overflow spills to the engine-wide cache.
const DEFAULT_TASK_CACHE_SIZE: usize = 20;

/// Prefix for every thread the runtime creates (workers, task contexts, the
/// timer service).
const DEFAULT_THREAD_NAME: &str = "strand";

/// Default name for tasks spawned without one.
const DEFAULT_TASK_NAME: &str = "strand-task";

#[derive(Debug, Clone)]
pub struct Builder {
    /// The number of worker threads.
    ///
    /// Defaults to one worker per CPU core.
    worker_threads: Option<usize>,

    task_cache_size: usize,

    /// false: coarse per-worker timer queues, processed on each scheduler
    /// pass. true: a shared high-precision timer thread, with in-task
    /// registrations deferred to the resume epilog.
    high_precision_timer: bool,

    thread_name: String,

    /// Stack size used for task context threads.
    thread_stack_size: Option<usize>,
}

impl Builder {
    pub fn new() -> Builder {
        Builder {
            worker_threads: None,
            task_cache_size: DEFAULT_TASK_CACHE_SIZE,
            high_precision_timer: false,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
            thread_stack_size: None,
        }
    }

    #[track_caller]
    pub fn worker_threads(mut self, val: usize) -> Self {
        assert!(val > 0, "worker threads cannot be set to 0");
        self.worker_threads = Some(val);
        self
    }

    /// Caps how many exited tasks each carrier keeps for recycling; the
    /// overflow spills into the engine-wide cache where any carrier may
    /// steal them back.
    pub fn task_cache_size(mut self, val: usize) -> Self {
        self.task_cache_size = val;
        self
    }

    pub fn high_precision_timer(mut self, val: bool) -> Self {
        self.high_precision_timer = val;
        self
    }

    /// Sets the name prefix of threads spawned by the runtime.
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        self.thread_name = val.into();
        self
    }

    /// Sets the stack size (in bytes) for task context threads.
    pub fn thread_stack_size(mut self, val: usize) -> Self {
        self.thread_stack_size = Some(val);
        self
    }

    /// Creates the configured [`Runtime`], with its workers started and ready
    /// to accept spawns.
    pub fn try_build(self) -> Result<Runtime> {
        let cfg: RuntimeConfig = self.try_into()?;
        let engine = Engine::new(cfg);
        engine.start_workers()?;
        Ok(Runtime { engine })
    }
}

impl Default for Builder {
    fn default() -> Self {
        Builder::new()
    }
}

#[derive(Debug)]
pub struct Runtime {
    engine: Arc<Engine>,
}

impl Runtime {
    /// Submit a closure to run as a task on some worker.
    pub fn spawn<F, T>(&self, f: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.spawn_named(DEFAULT_TASK_NAME, f)
    }

    /// Submit a named closure; the name shows up in logs and identity
    /// queries.
    pub fn spawn_named<F, T>(&self, name: &str, f: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (sender, receiver) = mpsc::sync_channel(1);
        let target = Box::new(move || {
            let _ = sender.send(f());
        });
        let entry = Arc::new(SpawnEntry::new(name, target));
        if let Err(error) = self.engine.scheduler.execute(entry) {
            tracing::warn!(task = %name, %error, "failed to dispatch spawn");
        }
        JoinHandle { receiver }
    }

    /// Inject readiness for a source, waking the task registered for it.
    /// This is the bridge for whatever produces readiness outside the
    /// runtime (an epoll loop, an outer reactor). Returns whether a task was
    /// woken.
    pub fn deliver_readiness(&self, source: SourceId, readiness: Interest) -> bool {
        self.engine.pump().deliver(source, readiness)
    }

    /// Cooperative drain: reject new work, interrupt live tasks, and join the
    /// workers once the running count reaches zero.
    ///
    /// Must not be called from inside a task of this runtime.
    pub fn shutdown(&self) -> Result<()> {
        self.engine.shutdown()
    }

    #[cfg(test)]
    pub(crate) fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }
}

/// Claim on the result of a spawned task.
#[derive(Debug)]
pub struct JoinHandle<T> {
    receiver: mpsc::Receiver<T>,
}

impl<T> JoinHandle<T> {
    /// Block the calling thread until the task completes.
    pub fn join(self) -> Result<T, JoinError> {
        self.receiver.recv().map_err(|_| JoinError)
    }

    /// Like [`JoinHandle::join`] with an upper bound on the wait.
    pub fn join_timeout(self, timeout: std::time::Duration) -> Result<T, JoinError> {
        self.receiver.recv_timeout(timeout).map_err(|_| JoinError)
    }
}

// Export the builder as a RuntimeConfig object consumed by the engine, the
// scheduler, and task creation.
#[derive(Debug, Clone)]
pub(crate) struct RuntimeConfig {
    pub(crate) worker_threads: usize,
    pub(crate) task_cache_size: usize,
    pub(crate) high_precision_timer: bool,
    pub(crate) thread_name: String,
    pub(crate) thread_stack_size: Option<usize>,
}

impl RuntimeConfig {
    /// Configuration of the process-root engine backing foreign-thread
    /// attach: no workers, defaults otherwise.
    pub(crate) fn attach_only() -> Self {
        RuntimeConfig {
            worker_threads: 0,
            task_cache_size: DEFAULT_TASK_CACHE_SIZE,
            high_precision_timer: false,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
            thread_stack_size: None,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.thread_name.is_empty() {
            return Err(anyhow!("thread_name must not be empty"));
        }
        Ok(())
    }
}

impl TryFrom<Builder> for RuntimeConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        let worker_threads = match builder.worker_threads {
            Some(val) => val,
            None => thread::available_parallelism()?.get(),
        };
        let cfg = RuntimeConfig {
            worker_threads,
            task_cache_size: builder.task_cache_size,
            high_precision_timer: builder.high_precision_timer,
            thread_name: builder.thread_name,
            thread_stack_size: builder.thread_stack_size,
        };
        cfg.validate()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    // RuntimeConfig is cloned and sent into every spawned worker.
    assert_impl_all!(RuntimeConfig: Send, Sync, Clone);
    assert_impl_all!(Runtime: Send, Sync);

    #[test]
    fn builder_defaults_validate() {
        let cfg: RuntimeConfig = Builder::new().try_into().unwrap();
        assert!(cfg.worker_threads > 0);
        assert_eq!(cfg.task_cache_size, DEFAULT_TASK_CACHE_SIZE);
        assert!(!cfg.high_precision_timer);
    }

    #[test]
    #[should_panic(expected = "worker threads cannot be set to 0")]
    fn zero_workers_is_refused() {
        let _ = Builder::new().worker_threads(0);
    }
}
