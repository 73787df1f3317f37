pub(crate) mod guard;
pub(crate) use guard::CriticalGuard;

use std::sync::OnceLock;
use std::time::Instant;

/// Monotonic nanoseconds since the first call in this process. Used for
/// enqueue-latency and execution-time accounting where a zero value means
/// "not recorded".
pub(crate) fn now_nanos() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    // The first caller observes 0ns elapsed, which collides with the "not
    // recorded" sentinel. Shift everything by one so real timestamps are
    // always non-zero.
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_nanos_is_monotonic_and_nonzero() {
        let a = now_nanos();
        let b = now_nanos();
        assert!(a > 0);
        assert!(b >= a);
    }
}
