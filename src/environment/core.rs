use super::Action;
use super::monitor::{Monitor, Priority};
use crate::fault::{Fault, FaultHandler};
use crate::runtime::context;
use crate::runtime::worker::Worker;
use crate::utils::{Deadline, lock, wait_timeout};

use std::collections::VecDeque;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, SystemTime};

/// Longest single wait on a member worker while flushing, so queued work
/// and monitors keep being serviced during a join.
const JOIN_SLICE: Duration = Duration::from_millis(10);

/// Per-worker-group scheduling context.
///
/// An environment owns three FIFO queues (deferred, eventually, finally), a
/// set of monitors and the workers spawned from it. Nothing drives an
/// environment in the background: its queues are drained and its monitors
/// evaluated whenever a worker visits it through [`flush`](Self::flush),
/// [`poll_monitors`](Self::poll_monitors) or [`destroy`](Self::destroy).
///
/// An environment is destroyed at most once. Afterwards its queues are
/// empty, no monitor remains, and new work pushed into it is discarded.
pub struct Environment {
    /// Worker whose lookup created this environment.
    owner: Worker,

    /// Receives faults raised by queued actions and monitors.
    fault_handler: FaultHandler,

    state: Mutex<State>,

    /// Signaled whenever work is pushed, a member retires, or the
    /// environment is torn down.
    condvar: Condvar,

    /// Sleep between monitor evaluations while waiting for one to fire.
    poll_interval: Duration,

    created: SystemTime,
    destroyed: AtomicBool,

    /// Set while an asynchronous flush is pending.
    flush_scheduled: AtomicBool,
}

#[derive(Default)]
struct State {
    deferred: VecDeque<Action>,
    eventually: VecDeque<Action>,
    finally: VecDeque<Action>,

    monitors: Vec<Monitor>,

    /// Monitors currently taken out for evaluation by some thread.
    evaluating: usize,
    next_monitor_seq: u64,

    threads: Vec<Worker>,
}

impl State {
    fn has_monitors(&self) -> bool {
        !self.monitors.is_empty() || self.evaluating > 0
    }

    fn is_idle(&self) -> bool {
        self.deferred.is_empty()
            && self.eventually.is_empty()
            && self.finally.is_empty()
            && !self.has_monitors()
    }

    /// Picks the next thing a draining worker should do.
    ///
    /// Deferred work goes first, then monitors get a chance to fire, then
    /// eventually work, then finally work.
    fn next_step(&mut self, polled: bool) -> Step {
        if let Some(action) = self.deferred.pop_front() {
            return Step::Run(action);
        }

        if !polled && self.has_monitors() {
            return Step::Poll;
        }

        if let Some(action) = self.eventually.pop_front() {
            return Step::Run(action);
        }

        if let Some(action) = self.finally.pop_front() {
            return Step::Run(action);
        }

        if self.has_monitors() {
            Step::Wait
        } else {
            Step::Done
        }
    }
}

enum Step {
    Run(Action),
    Poll,
    Wait,
    Done,
}

#[derive(Clone, Copy)]
enum Queue {
    Deferred,
    Eventually,
    Finally,
}

/// Snapshot of the work an environment still holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pending {
    pub deferred: usize,
    pub eventually: usize,
    pub finally: usize,
    pub monitors: usize,
    pub threads: usize,
}

impl Pending {
    /// No queued action and no monitor. Member workers are not counted.
    pub fn is_idle(&self) -> bool {
        self.deferred == 0 && self.eventually == 0 && self.finally == 0 && self.monitors == 0
    }
}

impl Environment {
    pub(crate) fn new(owner: Worker, fault_handler: FaultHandler, poll_interval: Duration) -> Self {
        Self {
            owner,
            fault_handler,
            state: Mutex::new(State::default()),
            condvar: Condvar::new(),
            poll_interval,
            created: SystemTime::now(),
            destroyed: AtomicBool::new(false),
            flush_scheduled: AtomicBool::new(false),
        }
    }

    /// Worker whose lookup created this environment.
    pub fn owner(&self) -> &Worker {
        &self.owner
    }

    /// Handler faults of queued actions and monitors are reported to.
    pub fn fault_handler(&self) -> &FaultHandler {
        &self.fault_handler
    }

    /// When this environment was created.
    pub fn start_time(&self) -> SystemTime {
        self.created
    }

    /// Whether the environment was torn down.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Queues an action to run soon, in the same logical turn.
    pub fn push_deferred<F>(&self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.push(Queue::Deferred, Box::new(action));
    }

    /// Queues an action to run when the environment is otherwise idle.
    pub fn push_eventually<F>(&self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.push(Queue::Eventually, Box::new(action));
    }

    /// Queues an action to run once the rest of the work is drained, or at
    /// teardown at the latest.
    pub fn push_finally<F>(&self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.push(Queue::Finally, Box::new(action));
    }

    fn push(&self, queue: Queue, action: Action) {
        {
            let mut state = lock(&self.state);

            if self.is_destroyed() {
                drop(state);
                tracing::warn!(owner = %self.owner.name(), "environment destroyed; discarding action");
                return;
            }

            match queue {
                Queue::Deferred => state.deferred.push_back(action),
                Queue::Eventually => state.eventually.push_back(action),
                Queue::Finally => state.finally.push_back(action),
            }
        }

        self.condvar.notify_all();
    }

    /// Registers a monitor: once `predicate` holds, `callback` runs and the
    /// monitor is discarded.
    ///
    /// Monitors are evaluated cooperatively by whichever worker visits the
    /// environment.
    pub fn monitor<P, C>(&self, priority: Priority, predicate: P, callback: C)
    where
        P: FnMut() -> bool + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        {
            let mut state = lock(&self.state);

            if self.is_destroyed() {
                drop(state);
                tracing::warn!(owner = %self.owner.name(), "environment destroyed; discarding monitor");
                return;
            }

            let seq = state.next_monitor_seq;
            state.next_monitor_seq += 1;

            state.monitors.push(Monitor {
                priority,
                seq,
                predicate: Box::new(predicate),
                callback: Box::new(callback),
            });
        }

        self.condvar.notify_all();
    }

    /// Adds a member worker.
    pub fn push_thread(&self, worker: Worker) {
        let mut state = lock(&self.state);
        if !state.threads.contains(&worker) {
            state.threads.push(worker);
        }
    }

    /// Current member workers.
    pub fn threads(&self) -> Vec<Worker> {
        lock(&self.state).threads.clone()
    }

    /// Whether the owner has exited and no member worker is still running.
    pub(crate) fn is_abandoned(&self) -> bool {
        if !self.owner.is_terminated() {
            return false;
        }

        let mut state = lock(&self.state);
        state.threads.retain(|w| !w.is_terminated());
        state.threads.is_empty()
    }

    /// Tears the environment down without flushing it. Finally actions
    /// still run; everything else queued is discarded.
    pub(crate) fn discard(&self) -> bool {
        self.teardown()
    }

    /// Removes a member worker, typically once it finished.
    pub(crate) fn retire(&self, worker: &Worker) {
        lock(&self.state).threads.retain(|w| w != worker);
        self.condvar.notify_all();
    }

    /// Counts of queued actions, monitors and member workers.
    pub fn pending(&self) -> Pending {
        let state = lock(&self.state);

        Pending {
            deferred: state.deferred.len(),
            eventually: state.eventually.len(),
            finally: state.finally.len(),
            monitors: state.monitors.len() + state.evaluating,
            threads: state.threads.len(),
        }
    }

    /// Wakes every worker waiting on this environment.
    pub(crate) fn wake(&self) {
        self.condvar.notify_all();
    }

    /// Blocks until work is pushed into the environment or `timeout`
    /// elapses. Returns immediately if work is already queued.
    pub(crate) fn park(&self, timeout: Duration) {
        let state = lock(&self.state);

        if state.is_idle() && !self.is_destroyed() {
            let _state = wait_timeout(&self.condvar, state, timeout);
        }
    }

    /// Evaluates every registered monitor once, highest priority first,
    /// running the callbacks of those whose predicate holds.
    ///
    /// Returns how many monitors fired. A predicate that panics is reported
    /// to the fault handler and its monitor discarded.
    pub fn poll_monitors(&self) -> usize {
        let mut batch = {
            let mut state = lock(&self.state);
            if state.monitors.is_empty() {
                return 0;
            }

            let batch = mem::take(&mut state.monitors);
            state.evaluating += batch.len();
            batch
        };

        let taken = batch.len();
        batch.sort_by(Monitor::evaluation_order);

        let mut fired = 0;
        let mut waiting = Vec::with_capacity(taken);

        for mut monitor in batch {
            match panic::catch_unwind(AssertUnwindSafe(|| (monitor.predicate)())) {
                Ok(true) => {
                    fired += 1;
                    self.run(monitor.callback);
                }
                Ok(false) => waiting.push(monitor),
                Err(payload) => self.report(Fault::from_panic(payload)),
            }
        }

        {
            let mut state = lock(&self.state);
            state.evaluating -= taken;

            if !self.is_destroyed() {
                state.monitors.extend(waiting);
            }
        }

        if fired > 0 {
            self.condvar.notify_all();
        }

        fired
    }

    /// Destroys the environment if no other member worker is alive and
    /// nothing is queued or monitored.
    ///
    /// Called when an owned worker's action completes. Returns `true` if
    /// this call destroyed the environment.
    pub fn maybe_shutdown(&self) -> bool {
        let current = context::current_worker_id();

        {
            let mut state = lock(&self.state);
            state.threads.retain(|w| !w.is_terminated());

            let others_alive = state.threads.iter().any(|w| Some(w.id()) != current);
            if others_alive || !state.is_idle() {
                return false;
            }
        }

        self.teardown()
    }

    /// Drains all three queues and joins every member worker.
    ///
    /// Returns `true` if everything was drained and joined before the
    /// deadline. Faults raised by drained actions go to the fault handler.
    /// An interrupt delivered to the flushing worker ends the flush with
    /// `false` and clears the interrupt.
    pub fn flush(&self, timeout: Duration) -> bool {
        let deadline = Deadline::after(timeout);
        let current = Worker::current();

        loop {
            if !self.drain(deadline, &current) {
                return false;
            }

            let next = {
                let mut state = lock(&self.state);
                state.threads.retain(|w| !w.is_terminated());
                state.threads.iter().find(|w| **w != current).cloned()
            };

            let Some(worker) = next else {
                return true;
            };

            if deadline.has_passed() {
                return false;
            }

            let joined = worker.join_timeout(deadline.remaining().min(JOIN_SLICE));

            if current.interrupted() {
                return false;
            }

            if !joined && deadline.has_passed() {
                return false;
            }
        }
    }

    /// Runs queued work and fires monitors until nothing is left or the
    /// deadline passes.
    ///
    /// Work that completes only after the deadline counts as a timeout.
    fn drain(&self, deadline: Deadline, current: &Worker) -> bool {
        let mut polled = false;

        loop {
            let mut state = lock(&self.state);

            if deadline.has_passed() {
                return state.is_idle();
            }

            match state.next_step(polled) {
                Step::Run(action) => {
                    drop(state);
                    self.run(action);
                    polled = false;

                    if deadline.has_passed() {
                        return false;
                    }
                }
                Step::Poll => {
                    drop(state);
                    let fired = self.poll_monitors();
                    polled = fired == 0;

                    if fired > 0 && deadline.has_passed() {
                        return false;
                    }
                }
                Step::Wait => {
                    let wait = self.poll_interval.min(deadline.remaining());
                    drop(wait_timeout(&self.condvar, state, wait));
                    polled = false;

                    if current.interrupted() {
                        return false;
                    }
                }
                Step::Done => return true,
            }
        }
    }

    /// Best-effort teardown: flushes within `timeout`, then destroys the
    /// environment regardless.
    ///
    /// Finally actions still queued run at teardown even if the flush timed
    /// out; deferred and eventually actions still queued are discarded.
    /// Returns whether the flush completed cleanly.
    pub fn destroy(&self, timeout: Duration) -> bool {
        if self.is_destroyed() {
            return true;
        }

        let clean = self.flush(timeout);
        if !clean {
            tracing::warn!(owner = %self.owner.name(), ?timeout, "environment did not drain before teardown");
        }

        self.teardown();
        clean
    }

    /// Requests a flush without blocking the caller.
    ///
    /// The flush runs on a short-lived helper thread. At most one scheduled
    /// flush is pending at a time; further requests are coalesced.
    pub fn schedule_flush(self: &Arc<Self>, timeout: Duration) {
        if self.is_destroyed() || self.flush_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }

        let env = Arc::clone(self);
        let name = format!("{}-flush", self.owner.name());

        let spawned = thread::Builder::new().name(name).spawn(move || {
            let drained = env.flush(timeout);
            env.flush_scheduled.store(false, Ordering::Release);

            tracing::debug!(owner = %env.owner.name(), drained, "scheduled flush finished");
        });

        if let Err(err) = spawned {
            self.flush_scheduled.store(false, Ordering::Release);
            tracing::warn!(owner = %self.owner.name(), %err, "failed to schedule environment flush");
        }
    }

    /// Marks the environment destroyed and empties it.
    ///
    /// Returns `false` if it was already destroyed.
    fn teardown(&self) -> bool {
        let (finally, discarded) = {
            let mut state = lock(&self.state);

            if self.destroyed.swap(true, Ordering::AcqRel) {
                return false;
            }

            let finally = mem::take(&mut state.finally);
            let discarded = state.deferred.len() + state.eventually.len() + state.monitors.len();

            state.deferred.clear();
            state.eventually.clear();
            state.monitors.clear();
            state.threads.clear();

            (finally, discarded)
        };

        self.condvar.notify_all();

        if discarded > 0 {
            tracing::warn!(owner = %self.owner.name(), discarded, "environment destroyed with pending work");
        }

        for action in finally {
            self.run(action);
        }

        tracing::debug!(owner = %self.owner.name(), "environment destroyed");
        true
    }

    /// Runs an action, routing a panic to the fault handler.
    fn run(&self, action: Action) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(action)) {
            self.report(Fault::from_panic(payload));
        }
    }

    fn report(&self, fault: Fault) {
        self.fault_handler.handle(&Worker::current(), &fault);
    }
}
