use super::entry::{TimeoutEntry, TimeoutHandle};
use crate::fault::{Fault, FaultHandler};
use crate::runtime::worker::Worker;
use crate::utils::{Deadline, lock, wait, wait_timeout};

use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Width of a deadline bucket. Deadlines are rounded up to the next tick, so
/// an action never fires before its requested time.
const TICK: Duration = Duration::from_millis(1);

/// Tick of deadlines too far out to ever fire.
const NEVER: u64 = u64::MAX;

/// State shared between registrants, cancellation handles and the
/// background worker.
pub(crate) struct Shared {
    state: Mutex<State>,

    /// Wakes the background worker when a sooner deadline is registered or
    /// the registry shuts down.
    condvar: Condvar,

    /// Origin of the tick clock.
    epoch: Instant,
}

#[derive(Default)]
struct State {
    /// Wake tick → actions due at that tick, in registration order.
    buckets: BTreeMap<u64, Vec<TimeoutEntry>>,

    /// Entry id → wake tick, for cancellation.
    index: HashMap<u64, u64>,

    next_id: u64,

    /// Tick the background worker is currently sleeping until, if any.
    sleeping_until: Option<u64>,

    shutdown: bool,
}

impl Shared {
    /// Tick of the deadline `delay` from now. Deadlines beyond what
    /// `Instant` can represent land in the last tick, which never fires.
    fn tick_after(&self, delay: Duration) -> u64 {
        match Deadline::after(delay).instant() {
            Some(at) => self.tick_for(at),
            None => NEVER,
        }
    }

    fn tick_for(&self, at: Instant) -> u64 {
        let since = at.saturating_duration_since(self.epoch).as_nanos();
        u64::try_from(since.div_ceil(TICK.as_nanos())).unwrap_or(NEVER)
    }

    fn instant_of(&self, tick: u64) -> Option<Instant> {
        if tick == NEVER {
            return None;
        }

        let offset = Duration::from_nanos(tick.saturating_mul(TICK.as_nanos() as u64));
        self.epoch.checked_add(offset)
    }

    /// Removes a pending entry. Returns `false` if it already fired, was
    /// cancelled, or was abandoned.
    pub(crate) fn remove(&self, id: u64) -> bool {
        let mut state = lock(&self.state);

        let Some(tick) = state.index.remove(&id) else {
            return false;
        };

        if let Some(bucket) = state.buckets.get_mut(&tick) {
            bucket.retain(|entry| entry.id != id);
            if bucket.is_empty() {
                state.buckets.remove(&tick);
            }
        }

        true
    }

    pub(crate) fn contains(&self, id: u64) -> bool {
        lock(&self.state).index.contains_key(&id)
    }
}

/// Process-scoped scheduler that fires registered actions at or after a
/// requested deadline.
///
/// The registry is *idle* while no deadline is pending and *armed*
/// otherwise. A single background worker, started on first registration,
/// sleeps until the earliest deadline, fires every action of that bucket in
/// registration order, and re-arms for the next one. Buckets fire in
/// ascending time order.
///
/// Actions run on the background worker. A panicking action is reported to
/// the fault handler of the worker that registered it, tagged with that
/// worker; it never takes the background worker down, and the remaining
/// actions of the bucket still fire.
pub struct DeadlineRegistry {
    shared: Arc<Shared>,

    /// Background worker, once started.
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DeadlineRegistry {
    /// Creates an idle registry. The background worker starts with the first
    /// registration.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                condvar: Condvar::new(),
                epoch: Instant::now(),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Interrupts `worker` once `delay` has elapsed.
    ///
    /// Faults are reported to the worker's own handler, or to
    /// [`FaultHandler::logging`] if it has none.
    pub fn request_interruption(&self, worker: &Worker, delay: Duration) -> TimeoutHandle {
        let handler = worker.fault_handler().unwrap_or_else(FaultHandler::logging);
        self.request_interruption_with(worker, &handler, delay)
    }

    /// Interrupts `worker` once `delay` has elapsed, reporting faults to
    /// `handler`.
    ///
    /// The registration does not keep the worker alive; if every handle to
    /// it is gone when the deadline fires, nothing happens.
    pub fn request_interruption_with(
        &self,
        worker: &Worker,
        handler: &FaultHandler,
        delay: Duration,
    ) -> TimeoutHandle {
        let target = worker.downgrade();

        self.schedule(worker, handler, delay, move || {
            if let Some(worker) = target.upgrade() {
                worker.interrupt();
            }
        })
    }

    /// Runs `action` on the background worker once `delay` has elapsed.
    ///
    /// Registration never fails. After [`shutdown`](Self::shutdown) the
    /// action is abandoned immediately and the returned handle is inert.
    pub fn schedule<F>(
        &self,
        worker: &Worker,
        handler: &FaultHandler,
        delay: Duration,
        action: F,
    ) -> TimeoutHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let tick = self.shared.tick_after(delay);

        let (id, wake) = {
            let mut state = lock(&self.shared.state);

            let id = state.next_id;
            state.next_id += 1;

            if state.shutdown {
                tracing::debug!(worker = %worker.name(), "deadline registry shut down; abandoning deadline");
                return TimeoutHandle {
                    id,
                    shared: Arc::downgrade(&self.shared),
                };
            }

            state.buckets.entry(tick).or_default().push(TimeoutEntry {
                id,
                worker: worker.downgrade(),
                handler: handler.clone(),
                action: Box::new(action),
            });
            state.index.insert(id, tick);

            let wake = state.sleeping_until.is_none_or(|until| tick < until);
            (id, wake)
        };

        self.ensure_started();

        if wake {
            self.shared.condvar.notify_all();
        }

        tracing::debug!(worker = %worker.name(), ?delay, id, "deadline registered");

        TimeoutHandle {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Number of deadlines waiting to fire.
    pub fn pending(&self) -> usize {
        lock(&self.shared.state).index.len()
    }

    /// Whether at least one deadline is waiting to fire.
    pub fn is_armed(&self) -> bool {
        self.pending() > 0
    }

    /// Stops the background worker. Deadlines that have not fired yet are
    /// abandoned and never fire.
    pub fn shutdown(&self) {
        let abandoned = {
            let mut state = lock(&self.shared.state);
            state.shutdown = true;

            let abandoned = state.index.len();
            state.buckets.clear();
            state.index.clear();
            abandoned
        };

        self.shared.condvar.notify_all();

        if let Some(handle) = lock(&self.worker).take() {
            // A deadline action may shut the registry down from the
            // background worker itself.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }

        if abandoned > 0 {
            tracing::debug!(abandoned, "deadline registry shut down with pending deadlines");
        }
    }

    /// Starts the background worker if it is not running yet.
    ///
    /// A failed start is logged and retried on the next registration; the
    /// entries already registered stay armed. A worker that exited is
    /// replaced.
    fn ensure_started(&self) {
        let mut worker = lock(&self.worker);
        if worker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        if lock(&self.shared.state).shutdown {
            return;
        }

        let shared = Arc::clone(&self.shared);

        match thread::Builder::new()
            .name("enviro-deadline".to_owned())
            .spawn(move || run(&shared))
        {
            Ok(handle) => *worker = Some(handle),
            Err(err) => tracing::error!(%err, "failed to start deadline worker"),
        }
    }
}

impl Default for DeadlineRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DeadlineRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Background loop of the deadline worker.
fn run(shared: &Shared) {
    let mut state = lock(&shared.state);

    loop {
        if state.shutdown {
            return;
        }

        let Some(&tick) = state.buckets.keys().next() else {
            state.sleeping_until = None;
            state = wait(&shared.condvar, state);
            continue;
        };

        let now = Instant::now();

        match shared.instant_of(tick) {
            Some(wake_at) if wake_at > now => {
                state.sleeping_until = Some(tick);
                state = wait_timeout(&shared.condvar, state, wake_at - now);
                continue;
            }
            Some(_) => {}
            None => {
                state.sleeping_until = Some(tick);
                state = wait(&shared.condvar, state);
                continue;
            }
        }

        state.sleeping_until = None;

        let bucket = state.buckets.remove(&tick).unwrap_or_default();
        for entry in &bucket {
            state.index.remove(&entry.id);
        }

        drop(state);
        fire(bucket);
        state = lock(&shared.state);
    }
}

/// Fires every action of a bucket, in registration order.
fn fire(bucket: Vec<TimeoutEntry>) {
    for entry in bucket {
        let TimeoutEntry {
            id,
            worker,
            handler,
            action,
        } = entry;

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(action)) {
            let fault = Fault::from_panic(payload);

            match worker.upgrade() {
                Some(worker) => handler.handle(&worker, &fault),
                None => {
                    tracing::error!(worker = %worker.name(), id, %fault, "deadline action of a dropped worker failed");
                }
            }
        }
    }
}
