use crate::runtime::worker::{Worker, WorkerId};

use std::cell::RefCell;
use std::thread;

/// Occupant of the thread-local worker slot.
///
/// Dropping a foreign worker's slot (on thread exit) releases its
/// termination latch, which is how foreign workers are observed to finish.
/// Owned workers release their latch themselves.
struct WorkerSlot {
    worker: Worker,
    release_on_drop: bool,
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        if self.release_on_drop {
            self.worker.mark_terminated();
        }
    }
}

thread_local! {
    /// Worker handle of the current thread.
    ///
    /// Installed by the service for owned workers before their action runs,
    /// and lazily for any other thread on first access.
    static CURRENT_WORKER: RefCell<Option<WorkerSlot>> = const { RefCell::new(None) };
}

/// Returns the current thread's worker, registering a foreign worker if the
/// thread has none yet.
pub(crate) fn current_worker() -> Worker {
    CURRENT_WORKER
        .try_with(|cell| {
            let mut slot = cell.borrow_mut();
            slot.get_or_insert_with(|| WorkerSlot {
                worker: Worker::foreign(thread::current()),
                release_on_drop: true,
            })
            .worker
            .clone()
        })
        // Thread-local storage is being torn down; hand out an unregistered
        // handle rather than failing.
        .unwrap_or_else(|_| Worker::foreign(thread::current()))
}

/// Returns the id of the current thread's worker without registering one.
pub(crate) fn current_worker_id() -> Option<WorkerId> {
    CURRENT_WORKER
        .try_with(|cell| cell.borrow().as_ref().map(|slot| slot.worker.id()))
        .ok()
        .flatten()
}

/// Runs `f` with `worker` installed as the current thread's worker.
///
/// The previous occupant is restored afterwards. The installed worker's
/// latch is *not* released on exit; the caller decides when the worker is
/// finished.
pub(crate) fn enter_worker<R>(worker: Worker, f: impl FnOnce() -> R) -> R {
    CURRENT_WORKER.with(|cell| {
        let prev = cell.replace(Some(WorkerSlot {
            worker,
            release_on_drop: false,
        }));

        let out = f();

        cell.replace(prev);

        out
    })
}
