use crate::utils::{Deadline, lock, wait_timeout};

use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// A result that becomes available at some point, observed by polling.
///
/// Implementors must make `is_done` cheap and non-blocking; it is evaluated
/// repeatedly by monitors.
pub trait AsyncResult {
    type Output;
    type Error;

    /// Whether the result is available.
    fn is_done(&self) -> bool;

    /// Takes the result out.
    ///
    /// Returns `None` if the result is not available yet or was already
    /// taken.
    fn take(&self) -> Option<Result<Self::Output, Self::Error>>;
}

enum Slot<T, E> {
    Pending,
    Ready(Result<T, E>),
    Taken,
}

struct Inner<T, E> {
    slot: Mutex<Slot<T, E>>,
    condvar: Condvar,
}

/// A single-assignment completion cell.
///
/// The producer completes it once with [`complete`](Self::complete) (or
/// [`succeed`](Self::succeed) / [`fail`](Self::fail)); consumers either block
/// with [`wait_timeout`](Self::wait_timeout) or hand it to
/// `ConcurrencyService::resolve_async`. Clones share the same cell.
pub struct Promise<T, E> {
    inner: Arc<Inner<T, E>>,
}

impl<T, E> Promise<T, E> {
    /// Creates a pending promise.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(Slot::Pending),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Creates an already completed promise.
    pub fn ready(result: Result<T, E>) -> Self {
        let promise = Self::new();
        promise.complete(result);
        promise
    }

    /// Completes the promise.
    ///
    /// Returns `false`, dropping `result`, if it was already completed.
    pub fn complete(&self, result: Result<T, E>) -> bool {
        {
            let mut slot = lock(&self.inner.slot);
            if !matches!(*slot, Slot::Pending) {
                return false;
            }

            *slot = Slot::Ready(result);
        }

        self.inner.condvar.notify_all();
        true
    }

    pub fn succeed(&self, value: T) -> bool {
        self.complete(Ok(value))
    }

    pub fn fail(&self, error: E) -> bool {
        self.complete(Err(error))
    }

    /// Waits up to `timeout` for the promise to complete.
    ///
    /// Returns whether it completed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Deadline::after(timeout);
        let mut slot = lock(&self.inner.slot);

        while matches!(*slot, Slot::Pending) {
            if deadline.has_passed() {
                return false;
            }

            slot = wait_timeout(&self.inner.condvar, slot, deadline.remaining());
        }

        true
    }
}

impl<T, E> AsyncResult for Promise<T, E> {
    type Output = T;
    type Error = E;

    fn is_done(&self) -> bool {
        !matches!(*lock(&self.inner.slot), Slot::Pending)
    }

    fn take(&self) -> Option<Result<T, E>> {
        let mut slot = lock(&self.inner.slot);

        match std::mem::replace(&mut *slot, Slot::Taken) {
            Slot::Ready(result) => Some(result),
            Slot::Pending => {
                *slot = Slot::Pending;
                None
            }
            Slot::Taken => None,
        }
    }
}

impl<T, E> Clone for Promise<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, E> Default for Promise<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> fmt::Debug for Promise<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match *lock(&self.inner.slot) {
            Slot::Pending => "pending",
            Slot::Ready(_) => "ready",
            Slot::Taken => "taken",
        };

        f.debug_struct("Promise").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;

    #[test]
    fn test_complete_once() {
        let promise = Promise::<i32, ()>::new();

        assert!(!promise.is_done());
        assert!(promise.take().is_none());

        assert!(promise.succeed(1));
        assert!(!promise.succeed(2));
        assert!(promise.is_done());

        assert_eq!(promise.take(), Some(Ok(1)));
        assert_eq!(promise.take(), None);
        assert!(promise.is_done());
    }

    #[test]
    fn test_wait_timeout_across_threads() {
        let promise = Promise::<&'static str, ()>::new();
        assert!(!promise.wait_timeout(Duration::from_millis(5)));

        let producer = promise.clone();
        let handle = thread::spawn(move || producer.fail(()));

        assert!(promise.wait_timeout(Duration::from_secs(5)));
        assert_eq!(promise.take(), Some(Err(())));
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_wait_unbounded_on_completed_promise() {
        let promise = Promise::<u8, ()>::ready(Ok(3));

        assert!(promise.wait_timeout(Duration::MAX));
    }
}
