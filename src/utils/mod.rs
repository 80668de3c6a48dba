//! Small synchronization helpers shared by the runtime.
//!
//! User actions never run while one of the runtime's locks is held, but a
//! predicate or callback may still panic on a thread that later touches a
//! lock. A poisoned lock carries no broken invariant for the structures
//! guarded here, so the helpers recover the guard instead of propagating
//! the poison.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Locks `mutex`, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Blocks on `condvar` until notified.
pub(crate) fn wait<'a, T>(condvar: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    condvar.wait(guard).unwrap_or_else(PoisonError::into_inner)
}

/// Blocks on `condvar` until notified or `timeout` elapses.
pub(crate) fn wait_timeout<'a, T>(
    condvar: &Condvar,
    guard: MutexGuard<'a, T>,
    timeout: Duration,
) -> MutexGuard<'a, T> {
    match condvar.wait_timeout(guard, timeout) {
        Ok((guard, _)) => guard,
        Err(poisoned) => poisoned.into_inner().0,
    }
}

/// A point in time a bounded wait gives up at.
///
/// Timeouts too large for `Instant` to represent mean "never".
#[derive(Clone, Copy, Debug)]
pub(crate) struct Deadline(Option<Instant>);

impl Deadline {
    pub(crate) fn after(timeout: Duration) -> Self {
        Self(Instant::now().checked_add(timeout))
    }

    pub(crate) fn instant(&self) -> Option<Instant> {
        self.0
    }

    pub(crate) fn has_passed(&self) -> bool {
        self.0.is_some_and(|at| Instant::now() >= at)
    }

    /// Time left, `Duration::MAX` when unbounded, zero once passed.
    pub(crate) fn remaining(&self) -> Duration {
        match self.0 {
            Some(at) => at.saturating_duration_since(Instant::now()),
            None => Duration::MAX,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbounded_deadline_never_passes() {
        let deadline = Deadline::after(Duration::MAX);

        assert!(deadline.instant().is_none());
        assert!(!deadline.has_passed());
        assert_eq!(deadline.remaining(), Duration::MAX);
    }

    #[test]
    fn test_zero_deadline_has_passed() {
        let deadline = Deadline::after(Duration::ZERO);

        assert!(deadline.has_passed());
        assert_eq!(deadline.remaining(), Duration::ZERO);
    }
}
