use super::platform::sys_terminate;
use crate::fault::FaultHandler;
use crate::runtime::context;
use crate::utils::{Deadline, lock, wait, wait_timeout};

use std::fmt;
use std::hash::{Hash, Hasher};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle, Thread};
use std::time::Duration;

/// Source of worker identities.
static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

/// Sequence used to name spawned workers.
static NEXT_WORKER_SEQ: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(u64);

impl WorkerId {
    fn next() -> Self {
        Self(NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw identifier.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How a worker came to be known by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    /// Spawned by the service around a supplied action.
    Owned,
    /// A thread the runtime did not create.
    Foreign,
}

struct WorkerInner {
    id: WorkerId,
    name: String,
    kind: WorkerKind,

    /// Cooperative interrupt request.
    interrupted: AtomicBool,

    /// Termination latch, guarded by `condvar`.
    terminated: Mutex<bool>,
    condvar: Condvar,

    /// Thread to unpark when an interrupt is delivered.
    thread: Mutex<Option<Thread>>,

    /// Join handle of an owned worker. Taken when the worker is abandoned.
    join: Mutex<Option<JoinHandle<()>>>,

    /// Handler inherited from the spawning worker, if any.
    fault_handler: Mutex<Option<FaultHandler>>,
}

/// Handle to a worker.
///
/// Handles are cheap to clone and compare by identity.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl Worker {
    fn with_kind(name: String, kind: WorkerKind, thread: Option<Thread>) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                id: WorkerId::next(),
                name,
                kind,
                interrupted: AtomicBool::new(false),
                terminated: Mutex::new(false),
                condvar: Condvar::new(),
                thread: Mutex::new(thread),
                join: Mutex::new(None),
                fault_handler: Mutex::new(None),
            }),
        }
    }

    /// Creates the handle of a worker the service is about to spawn.
    pub(crate) fn owned(name: String) -> Self {
        Self::with_kind(name, WorkerKind::Owned, None)
    }

    /// Creates the handle of a thread the runtime did not spawn.
    pub(crate) fn foreign(thread: Thread) -> Self {
        let name = match thread.name() {
            Some(name) => name.to_owned(),
            None => format!("{:?}", thread.id()),
        };

        Self::with_kind(name, WorkerKind::Foreign, Some(thread))
    }

    /// Returns the handle of the calling thread.
    ///
    /// Threads the runtime did not spawn are registered as foreign workers on
    /// first call; they are marked terminated when the thread exits.
    pub fn current() -> Worker {
        context::current_worker()
    }

    /// Process-unique id.
    pub fn id(&self) -> WorkerId {
        self.inner.id
    }

    /// Thread name for owned workers, the OS thread name (or a generated
    /// one) for foreign workers.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether the service spawned this worker.
    pub fn kind(&self) -> WorkerKind {
        self.inner.kind
    }

    /// Whether this handle refers to the calling thread.
    pub fn is_current(&self) -> bool {
        context::current_worker_id() == Some(self.id())
    }

    /// Delivers a cooperative interrupt.
    ///
    /// The flag stays set until the worker observes it through
    /// [`interrupted`](Self::interrupted) or an interruptible wait.
    pub fn interrupt(&self) {
        self.inner.interrupted.store(true, Ordering::Release);

        if let Some(thread) = lock(&self.inner.thread).as_ref() {
            thread.unpark();
        }
    }

    /// Reads the interrupt flag without clearing it.
    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::Acquire)
    }

    /// Clears the interrupt flag, returning whether it was set.
    pub fn interrupted(&self) -> bool {
        self.inner.interrupted.swap(false, Ordering::AcqRel)
    }

    /// Whether the worker's action (or foreign thread) has finished.
    pub fn is_terminated(&self) -> bool {
        *lock(&self.inner.terminated)
    }

    /// Waits up to `timeout` for the worker to terminate.
    ///
    /// Returns `true` if the worker has terminated.
    pub fn join_timeout(&self, timeout: Duration) -> bool {
        let deadline = Deadline::after(timeout);
        let mut terminated = lock(&self.inner.terminated);

        while !*terminated {
            if deadline.has_passed() {
                return false;
            }

            terminated = wait_timeout(&self.inner.condvar, terminated, deadline.remaining());
        }

        true
    }

    /// Waits for the worker to terminate.
    pub fn join(&self) {
        let mut terminated = lock(&self.inner.terminated);

        while !*terminated {
            terminated = wait(&self.inner.condvar, terminated);
        }
    }

    /// The fault handler attached to this worker, if any.
    pub fn fault_handler(&self) -> Option<FaultHandler> {
        lock(&self.inner.fault_handler).clone()
    }

    /// Attaches a fault handler to this worker.
    ///
    /// The handler is part of the environment key, so changing it moves
    /// subsequent lookups for this worker to a different environment.
    pub fn set_fault_handler(&self, handler: FaultHandler) {
        *lock(&self.inner.fault_handler) = Some(handler);
    }

    /// Creates a non-owning handle.
    pub fn downgrade(&self) -> WeakWorker {
        WeakWorker {
            id: self.id(),
            name: self.inner.name.clone(),
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub(crate) fn attach_thread(&self, thread: Thread) {
        *lock(&self.inner.thread) = Some(thread);
    }

    pub(crate) fn attach_join(&self, handle: JoinHandle<()>) {
        *lock(&self.inner.join) = Some(handle);
    }

    /// Releases the termination latch and wakes every joiner.
    pub(crate) fn mark_terminated(&self) {
        let mut terminated = lock(&self.inner.terminated);
        *terminated = true;
        self.inner.condvar.notify_all();
    }

    /// Drops the join handle, detaching the OS thread.
    ///
    /// Returns `false` if there was nothing to detach.
    pub(crate) fn detach(&self) -> bool {
        lock(&self.inner.join).take().is_some()
    }

    /// Terminates the OS thread behind an owned worker without its
    /// cooperation.
    ///
    /// The join handle is consumed whether or not the request succeeds.
    ///
    /// # Safety
    ///
    /// UNSAFE, LAST RESORT. The target thread is stopped wherever it happens
    /// to be: locks it holds stay locked, destructors may not run and shared
    /// state may be left half-updated. On Unix the request is delivered with
    /// `pthread_cancel`, which unwinds the thread at its next cancellation
    /// point; unwinding through Rust frames this way is undefined behavior
    /// unless those frames hold nothing to drop. The caller must accept that
    /// the rest of the process may observe corrupted state afterwards.
    pub(crate) unsafe fn force_terminate(&self) -> io::Result<()> {
        let handle = lock(&self.inner.join).take();

        match handle {
            Some(handle) => unsafe { sys_terminate(&handle) },
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                "worker has no joinable thread",
            )),
        }
    }
}

/// Builds the deterministic name of a spawned worker:
/// `<group>-<action type>_<seq>`, without the group prefix when no group is
/// given.
pub(crate) fn spawn_name<F>(group: Option<&str>) -> String {
    let seq = NEXT_WORKER_SEQ.fetch_add(1, Ordering::Relaxed);
    let action = std::any::type_name::<F>();

    match group {
        Some(group) => format!("{group}-{action}_{seq}"),
        None => format!("{action}_{seq}"),
    }
}

impl PartialEq for Worker {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Worker {}

impl Hash for Worker {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("kind", &self.kind())
            .finish()
    }
}

/// Non-owning worker handle.
///
/// Holding a `WeakWorker` does not keep the worker's bookkeeping alive.
#[derive(Clone)]
pub struct WeakWorker {
    id: WorkerId,
    name: String,
    inner: Weak<WorkerInner>,
}

impl WeakWorker {
    pub fn upgrade(&self) -> Option<Worker> {
        self.inner.upgrade().map(|inner| Worker { inner })
    }

    /// Process-unique id.
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Name of the worker, kept for reporting after it is gone.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for WeakWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakWorker")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// Sleeps on the calling thread until `duration` elapses or `worker` is
/// interrupted.
///
/// Returns `false`, clearing the flag, if the worker was interrupted before
/// or during the sleep.
pub(crate) fn interruptible_sleep(worker: &Worker, duration: Duration) -> bool {
    if worker.interrupted() {
        return false;
    }

    let deadline = Deadline::after(duration);

    loop {
        if deadline.has_passed() {
            return true;
        }

        thread::park_timeout(deadline.remaining());

        if worker.interrupted() {
            return false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_name_with_and_without_group() {
        let plain = spawn_name::<fn()>(None);
        let grouped = spawn_name::<fn()>(Some("io"));

        assert!(plain.starts_with("fn()_"));
        assert!(grouped.starts_with("io-fn()_"));

        let seq = |name: &str| name.rsplit('_').next().unwrap().parse::<u64>().unwrap();
        assert!(seq(&grouped) > seq(&plain));
    }

    #[test]
    fn test_interrupted_clears_flag() {
        let worker = Worker::owned("w".to_owned());

        assert!(!worker.interrupted());
        worker.interrupt();
        assert!(worker.is_interrupted());
        assert!(worker.interrupted());
        assert!(!worker.is_interrupted());
    }

    #[test]
    fn test_join_timeout_observes_termination() {
        let worker = Worker::owned("w".to_owned());
        assert!(!worker.join_timeout(Duration::from_millis(5)));

        let remote = worker.clone();
        let handle = thread::spawn(move || remote.mark_terminated());

        assert!(worker.join_timeout(Duration::from_secs(5)));
        handle.join().unwrap();
    }

    #[test]
    fn test_weak_worker_does_not_keep_worker_alive() {
        let worker = Worker::owned("w".to_owned());
        let weak = worker.downgrade();

        assert_eq!(weak.upgrade(), Some(worker.clone()));
        drop(worker);
        assert!(weak.upgrade().is_none());
        assert_eq!(weak.name(), "w");
    }

    #[test]
    fn test_interruptible_sleep() {
        let worker = Worker::current();

        assert!(interruptible_sleep(&worker, Duration::from_millis(5)));

        worker.interrupt();
        assert!(!interruptible_sleep(&worker, Duration::from_secs(10)));
        assert!(!worker.is_interrupted());
    }

    #[test]
    fn test_unbounded_waits_do_not_overflow() {
        let worker = Worker::owned("w".to_owned());

        let remote = worker.clone();
        let handle = thread::spawn(move || remote.mark_terminated());
        assert!(worker.join_timeout(Duration::MAX));
        handle.join().unwrap();

        let current = Worker::current();
        let interrupter = current.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            interrupter.interrupt();
        });

        assert!(!interruptible_sleep(&current, Duration::MAX));
        handle.join().unwrap();
    }
}
