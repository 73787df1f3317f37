/// Why a spawn request was refused.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    /// The owning engine has been shut down; no new tasks are accepted.
    #[error("carrier has been shut down")]
    Rejected,

    /// The carrier was created by attaching a foreign thread. It serves as an
    /// identity holder only; it has no worker and cannot reach the scheduler.
    #[error("carrier is attach-only and cannot run tasks")]
    InvalidState,
}

/// The task behind a [`JoinHandle`](crate::JoinHandle) went away without
/// producing a result: it panicked, or the runtime was shut down underneath
/// it.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("task was canceled or panicked before producing a result")]
pub struct JoinError;
