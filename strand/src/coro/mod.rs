//! The low-level coroutine context primitive.
//!
//! A [`Context`] is the suspendable half of a task: something that can be
//! switched away from, switched into, stolen by another carrier while
//! suspended, and handed a pending interrupt that fires at its next resume.
//!
//! This implementation backs every task context with a dedicated OS thread
//! running a trampoline loop, and backs every carrier's run-loop context with
//! the carrier thread itself. A switch hands a run permit to the target and
//! blocks on the source's permit, so exactly one side of any context executes
//! at a time — the observable contract is the same as a stackful register
//! switch, without any architecture-specific code.

use crate::context;
use crate::task::Task;
use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Weak;
use std::thread;

/// Outcome of an attempt to reparent a suspended context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StealResult {
    Success,
    /// The context is mid-switch or its control lock is held. Retryable.
    FailByContention,
    /// The context is not in a stealable state (never started, released, or
    /// the engine is draining). Not retryable.
    FailByStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    /// Created but never entered.
    Created,
    /// Currently executing, or granted the permit to execute.
    Running,
    /// Fully switched out; registers (here: the backing thread) are at rest.
    Suspended,
    /// Released; the backing thread has exited or will exit on next wake.
    Done,
}

struct Control {
    permit: bool,
    state: RunState,
}

/// Unwind payload raised into a task when its context observes a pending
/// interrupt at resume. The trampoline converts it into the task-exit path.
pub(crate) struct TaskInterrupted;

/// Unwind payload raised into a suspended context when it is released while
/// parked. Terminates the backing thread.
struct ContextReleased;

pub(crate) struct Context {
    control: Mutex<Control>,
    wakeup: Condvar,
    pending_interrupt: AtomicBool,
    released: AtomicBool,
    native: bool,
}

impl Context {
    /// Wrap the calling OS thread. The context is considered running from the
    /// start; it suspends the real thread when switched away from.
    pub(crate) fn native() -> Self {
        Self::new(true, RunState::Running)
    }

    /// A context for a task, to be backed by a trampoline thread once
    /// [`Context::bind`] is called.
    pub(crate) fn for_task() -> Self {
        Self::new(false, RunState::Created)
    }

    fn new(native: bool, state: RunState) -> Self {
        Context {
            control: Mutex::new(Control {
                permit: false,
                state,
            }),
            wakeup: Condvar::new(),
            pending_interrupt: AtomicBool::new(false),
            released: AtomicBool::new(false),
            native,
        }
    }

    /// Start the backing thread for a task context. Must be called exactly
    /// once, after the owning task has been allocated (the trampoline reaches
    /// this context through the task).
    pub(crate) fn bind(&self, task: Weak<Task>, name: String, stack_size: Option<usize>) {
        debug_assert!(!self.native, "native contexts are bound to their thread");
        let mut builder = thread::Builder::new().name(name);
        if let Some(size) = stack_size {
            builder = builder.stack_size(size);
        }
        builder
            .spawn(move || trampoline(task))
            .expect("failed to spawn task context thread");
    }

    /// Grant the run permit to this context. Called by the outgoing side of a
    /// switch; the target's thread resumes once it observes the permit.
    fn resume(&self) {
        let mut control = self.control.lock();
        control.state = RunState::Running;
        control.permit = true;
        self.wakeup.notify_one();
    }

    /// Park the calling thread until this context's permit is granted.
    /// Returns false if the context was released instead.
    fn await_ready(&self) -> bool {
        let mut control = self.control.lock();
        while !control.permit {
            if self.released.load(Ordering::Acquire) {
                return false;
            }
            self.wakeup.wait(&mut control);
        }
        control.permit = false;
        control.state = RunState::Running;
        true
    }

    /// Suspend the current context: publish the suspended state, clear the
    /// owning task's steal lock, and block until resumed.
    ///
    /// The steal lock is cleared only after the state is visibly Suspended,
    /// which is what makes the spin in [`Context::try_steal`] callers safe:
    /// once the lock reads zero, the context is at rest.
    fn suspend(&self, steal_lock: &AtomicU32) {
        let mut control = self.control.lock();
        control.state = RunState::Suspended;
        steal_lock.store(0, Ordering::Release);
        while !control.permit {
            if self.released.load(Ordering::Acquire) {
                drop(control);
                panic::panic_any(ContextReleased);
            }
            self.wakeup.wait(&mut control);
        }
        // The permit may have been granted before we got here (the resumer
        // ran ahead); consuming it re-enters Running either way, in the same
        // critical section that published Suspended, so a steal can never
        // observe a suspended state on a running context.
        control.permit = false;
        control.state = RunState::Running;
    }

    /// Validate that this context may be reparented to the calling carrier.
    ///
    /// With thread-backed contexts there is nothing to move — the stack stays
    /// on its backing thread — so a steal reduces to checking, under the
    /// control lock, that the context is fully suspended.
    pub(crate) fn try_steal(&self) -> StealResult {
        if self.native {
            return StealResult::FailByStatus;
        }
        match self.control.try_lock() {
            None => StealResult::FailByContention,
            Some(control) => match control.state {
                RunState::Suspended => StealResult::Success,
                RunState::Running => StealResult::FailByContention,
                RunState::Created | RunState::Done => StealResult::FailByStatus,
            },
        }
    }

    pub(crate) fn set_pending_interrupt(&self) {
        self.pending_interrupt.store(true, Ordering::Release);
    }

    /// Raise the pending interrupt, if any, into the current task. Consumes
    /// the interrupt so it fires at most once.
    pub(crate) fn check_pending(&self) {
        if self.pending_interrupt.swap(false, Ordering::AcqRel) {
            panic::panic_any(TaskInterrupted);
        }
    }

    /// Release the context. A suspended backing thread wakes up and exits;
    /// late steal attempts fail by status.
    pub(crate) fn release(&self) {
        self.released.store(true, Ordering::Release);
        {
            let mut control = self.control.lock();
            control.state = RunState::Done;
        }
        self.wakeup.notify_all();
    }
}

/// The sole suspension point of the runtime: switch the flow of execution
/// from one task's context to another's.
///
/// After this returns in `from`'s frame, `from` may be owned by a different
/// carrier (it may have been stolen while suspended); callers must re-derive
/// the current carrier instead of touching captured state.
pub(crate) fn switch_to(from: &Task, to: &Task) {
    to.ctx().resume();
    from.ctx().suspend(from.steal_lock());
}

/// Body of a task context's backing thread.
///
/// Each pass of the outer loop runs one incarnation of the task: take the
/// target installed by `reset`, run it, then walk the task-exit path. The
/// exit path only returns here once the context has been reset and resumed as
/// a fresh incarnation; if that fresh incarnation is resumed with a pending
/// interrupt it must exit as well, hence the inner loop.
fn trampoline(task: Weak<Task>) {
    let Some(task) = task.upgrade() else { return };
    context::set_current_task(Some(task.clone()));

    if !task.ctx().await_ready() {
        return; // released before first run
    }

    loop {
        if let Some(target) = task.take_target() {
            match panic::catch_unwind(AssertUnwindSafe(target)) {
                Ok(()) => {}
                Err(payload) if payload.is::<ContextReleased>() => return,
                Err(payload) => {
                    if !payload.is::<TaskInterrupted>() {
                        tracing::error!(task = %task.name(), "task terminated by panic");
                    }
                    // interrupted or panicked: fall through to the exit path
                }
            }
        } else {
            debug_assert!(false, "task context resumed without a target");
        }

        loop {
            let exited = panic::catch_unwind(AssertUnwindSafe(|| {
                task.carrier().task_exit();
            }));
            match exited {
                // Resumed as a fresh incarnation; a new target awaits.
                Ok(()) => break,
                Err(payload) if payload.is::<TaskInterrupted>() => {
                    // The fresh incarnation was told to die on resume.
                    continue;
                }
                Err(payload) if payload.is::<ContextReleased>() => return,
                Err(_) => {
                    debug_assert!(false, "task exit path panicked");
                    return;
                }
            }
        }
    }
}
