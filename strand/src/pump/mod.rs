//! Readiness delivery for tasks parked on I/O.
//!
//! The pump is the boundary between the carrier and whatever produces
//! readiness (an epoll loop, a test harness, an outer reactor): a task
//! registers interest in a source before parking, and a later `deliver` for
//! that source wakes it. Registrations are one-shot — the blocking wrapper
//! re-registers and re-checks in a loop, so a spurious or stale delivery is
//! harmless.

use crate::task::Task;
use bitflags::bitflags;
use dashmap::DashMap;
use std::sync::{Arc, Weak};

bitflags! {
    /// Readiness interest mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interest: u8 {
        const READABLE = 1;
        const WRITABLE = 1 << 1;
    }
}

/// Opaque token naming a readiness source (a file descriptor, a channel id —
/// the pump does not care).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(pub u64);

struct Registration {
    task: Weak<Task>,
    interest: Interest,
}

#[derive(Default)]
pub(crate) struct EventPump {
    registrations: DashMap<SourceId, Registration>,
}

impl EventPump {
    pub(crate) fn new() -> Self {
        EventPump::default()
    }

    /// Register `task` as the wakeup target for `source`. Replaces any prior
    /// registration for the same source.
    pub(crate) fn register(&self, task: &Arc<Task>, source: SourceId, interest: Interest) {
        task.set_source(Some(source));
        self.registrations.insert(
            source,
            Registration {
                task: Arc::downgrade(task),
                interest,
            },
        );
    }

    /// Deliver readiness for `source`. Returns true if a task was woken.
    ///
    /// The wake is suppressed when the registered task no longer points back
    /// at this source: the task unregistered (or exited and was recycled)
    /// after this readiness was produced, and waking the reincarnation would
    /// be wrong.
    pub(crate) fn deliver(&self, source: SourceId, readiness: Interest) -> bool {
        let Some((_, registration)) = self.registrations.remove(&source) else {
            return false;
        };
        let Some(task) = registration.task.upgrade() else {
            return false;
        };
        if task.source() != Some(source) || !registration.interest.intersects(readiness) {
            return false;
        }
        task.unpark();
        true
    }
}
