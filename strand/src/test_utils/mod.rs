use crate::runtime::{Builder, Runtime};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub(crate) fn build_runtime(workers: usize) -> Runtime {
    Builder::new()
        .worker_threads(workers)
        .try_build()
        .expect("failed to build runtime")
}

/// Poll `cond` until it holds or `timeout` elapses. Returns whether it held.
pub(crate) fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}

/// Ordered record of events observed across tasks and threads.
#[derive(Clone, Default)]
pub(crate) struct EventLog {
    events: Arc<Mutex<Vec<String>>>,
}

impl EventLog {
    pub(crate) fn new() -> Self {
        EventLog::default()
    }

    pub(crate) fn record(&self, event: &str) {
        self.events.lock().push(event.to_string());
    }

    pub(crate) fn snapshot(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub(crate) fn wait_for_len(&self, len: usize, timeout: Duration) -> bool {
        wait_until(timeout, || self.len() >= len)
    }
}
