use super::builder::{Config, ServiceBuilder};
use super::context;
use super::resolver::Resolver;
use crate::deadline::{DeadlineRegistry, TimeoutHandle};
use crate::environment::{Environment, EnvironmentRegistry, Priority};
use crate::error::{Error, Result};
use crate::fault::{Fault, FaultHandler};
use crate::runtime::worker::core::{interruptible_sleep, spawn_name};
use crate::runtime::worker::Worker;
use crate::sync::AsyncResult;
use crate::utils::Deadline;

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, SystemTime};

/// Entry point for spawning workers, flushing and killing them, and tying
/// asynchronous results back into environments.
///
/// Cloning is cheap; clones share the same registries.
#[derive(Clone)]
pub struct ConcurrencyService {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    environments: Arc<EnvironmentRegistry>,
    deadlines: OnceLock<DeadlineRegistry>,
    resolver: OnceLock<Resolver>,
    shut_down: AtomicBool,
}

impl ConcurrencyService {
    /// Creates a service with the default configuration.
    pub fn new() -> Self {
        Self::from_config(Config::default())
    }

    pub fn builder() -> ServiceBuilder {
        ServiceBuilder::new()
    }

    /// The process-wide service, created with the default configuration on
    /// first use.
    pub fn global() -> &'static ConcurrencyService {
        static GLOBAL: OnceLock<ConcurrencyService> = OnceLock::new();
        GLOBAL.get_or_init(ConcurrencyService::new)
    }

    pub(crate) fn with_config(config: Config) -> Result<Self> {
        let wants_resolver = config.dedicated_resolver;
        let service = Self::from_config(config);

        if wants_resolver {
            service.start_resolver()?;
        }

        Ok(service)
    }

    fn from_config(config: Config) -> Self {
        let environments = Arc::new(EnvironmentRegistry::new(config.monitor_poll_interval));

        Self {
            inner: Arc::new(Inner {
                config,
                environments,
                deadlines: OnceLock::new(),
                resolver: OnceLock::new(),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    fn start_resolver(&self) -> Result<()> {
        let config = &self.inner.config;

        if !config.multithreaded {
            tracing::debug!("multithreading disabled; resolving on the calling worker");
            return Ok(());
        }

        let resolver = Resolver::start(
            &self.inner.environments,
            config.fault_handler.clone(),
            config.monitor_poll_interval,
            config.thread_flush_time,
        )?;

        // Only `with_config` starts a resolver, once per service.
        if let Err(duplicate) = self.inner.resolver.set(resolver) {
            tracing::warn!(worker = %duplicate.worker().name(), "resolver already running; stopping the new one");
        }

        Ok(())
    }

    pub fn environments(&self) -> &EnvironmentRegistry {
        &self.inner.environments
    }

    /// The deadline registry, started lazily on first use.
    pub fn deadlines(&self) -> &DeadlineRegistry {
        self.inner.deadlines.get_or_init(DeadlineRegistry::new)
    }

    pub fn is_multithreaded(&self) -> bool {
        self.inner.config.multithreaded
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// The handler faults of `worker` are reported to: its own, or the
    /// service default.
    pub fn fault_handler_for(&self, worker: &Worker) -> FaultHandler {
        worker
            .fault_handler()
            .unwrap_or_else(|| self.inner.config.fault_handler.clone())
    }

    /// The environment of `worker` under its fault handler, created if
    /// absent.
    pub fn environment_of(&self, worker: &Worker) -> Arc<Environment> {
        let handler = self.fault_handler_for(worker);
        self.inner.environments.get(worker, &handler)
    }

    pub fn current_environment(&self) -> Arc<Environment> {
        self.environment_of(&Worker::current())
    }

    /// When the environment of `worker` was created.
    pub fn environment_start_time(&self, worker: &Worker) -> SystemTime {
        self.environment_of(worker).start_time()
    }

    /// Shorthand for [`spawn_worker`](Self::spawn_worker) without a group.
    pub fn spawn<F>(&self, action: F) -> Result<Worker>
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn_worker(None, action)
    }

    /// Runs `action` on a new worker that joins the caller's environment.
    ///
    /// The worker inherits the caller's fault handler, and is named
    /// `<group>-<action type>_<n>`. A panic in `action` is reported to that
    /// handler. When multithreading is disabled, `action` runs to completion
    /// before this returns, and the returned worker is already terminated.
    pub fn spawn_worker<F>(&self, group: Option<&str>, action: F) -> Result<Worker>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_shut_down() {
            return Err(Error::ShutDown);
        }

        let parent = Worker::current();
        let handler = self.fault_handler_for(&parent);
        let env = self.inner.environments.get(&parent, &handler);

        let name = spawn_name::<F>(group);
        let child = Worker::owned(name.clone());
        child.set_fault_handler(handler.clone());

        env.push_thread(child.clone());
        self.inner.environments.adopt(&env, &child);

        let job = Job {
            worker: child.clone(),
            env,
            registry: Arc::clone(&self.inner.environments),
            handler,
            flush_time: self.inner.config.thread_flush_time,
        };

        if !self.is_multithreaded() {
            tracing::debug!(worker = %name, "running worker inline");
            job.run(action);
            return Ok(child);
        }

        let runner = child.clone();
        let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
            runner.attach_thread(thread::current());
            job.run(action);
        });

        match spawned {
            Ok(handle) => {
                child.attach_thread(handle.thread().clone());
                child.attach_join(handle);

                tracing::debug!(worker = %name, id = %child.id(), parent = %parent.name(), "worker spawned");
                Ok(child)
            }
            Err(source) => {
                self.inner.environments.release(&child);
                child.mark_terminated();

                tracing::error!(worker = %name, error = %source, "failed to spawn worker");
                Err(Error::Spawn { name, source })
            }
        }
    }

    /// Ties `result` back into a worker's environment.
    ///
    /// If `result` is already done, the matching callback runs on the caller
    /// before this returns. Otherwise a low-priority monitor is registered on
    /// the resolving environment: the dedicated resolver's if one is
    /// configured, the caller's otherwise. The callback then runs whenever
    /// that environment is flushed after `result` completes.
    pub fn resolve_async<R, S, F>(&self, result: R, on_success: S, on_failure: F)
    where
        R: AsyncResult + Send + Sync + 'static,
        S: FnOnce(R::Output) + Send + 'static,
        F: FnOnce(R::Error) + Send + 'static,
    {
        if result.is_done() {
            deliver(&result, on_success, on_failure);
            return;
        }

        let resolver = match self.inner.resolver.get() {
            Some(resolver) => resolver.worker().clone(),
            None => Worker::current(),
        };
        let env = self.environment_of(&resolver);

        let result = Arc::new(result);
        let probe = Arc::clone(&result);

        env.monitor(
            Priority::Low,
            move || probe.is_done(),
            move || deliver(&*result, on_success, on_failure),
        );
    }

    /// Drains the environment of `worker` and joins its member workers.
    ///
    /// Flushing the current worker blocks for up to `timeout` and reports
    /// whether everything completed. Flushing any other worker schedules the
    /// flush on a helper thread and returns `false` at once, even if that
    /// flush later succeeds. A worker with no environment flushes trivially.
    pub fn flush(&self, worker: &Worker, timeout: Duration) -> bool {
        let env = self.inner.environments.find(worker);

        if worker.is_current() {
            return env.is_none_or(|env| env.flush(timeout));
        }

        if let Some(env) = env {
            env.schedule_flush(timeout);
        }

        false
    }

    /// Stops `worker`, escalating as needed.
    ///
    /// First the environment `worker` owns is destroyed and the worker is
    /// joined, both within `timeout`; success returns `true`. Otherwise the
    /// worker is interrupted and given the configured grace period. If it
    /// still runs, it is forcibly terminated when that was allowed at build
    /// time, or detached and abandoned. Every escalated outcome returns
    /// `false`.
    pub fn kill(&self, worker: &Worker, timeout: Duration) -> bool {
        if self.finish_job(worker, timeout) {
            self.inner.environments.release(worker);
            return true;
        }

        tracing::warn!(worker = %worker.name(), ?timeout, "worker did not finish in time; interrupting");
        worker.interrupt();

        if worker.is_current() {
            return false;
        }

        let stopped = worker.join_timeout(self.inner.config.kill_grace);
        self.inner.environments.release(worker);

        if !stopped {
            self.terminate(worker);
        }

        false
    }

    fn finish_job(&self, worker: &Worker, timeout: Duration) -> bool {
        let deadline = Deadline::after(timeout);

        let clean = match self.inner.environments.owned_by(worker) {
            Some(env) => {
                let clean = env.destroy(timeout);
                self.inner.environments.evict(&env);
                clean
            }
            None => true,
        };

        if worker.is_current() {
            return clean;
        }

        let joined = worker.is_terminated() || worker.join_timeout(deadline.remaining());

        clean && joined
    }

    fn terminate(&self, worker: &Worker) {
        if !self.inner.config.forced_termination {
            if worker.detach() {
                tracing::error!(worker = %worker.name(), "worker ignored its interrupt; abandoning its thread");
            } else {
                tracing::error!(worker = %worker.name(), "worker ignored its interrupt and has no thread to abandon");
            }
            return;
        }

        tracing::error!(worker = %worker.name(), "worker ignored its interrupt; forcing termination");

        // SAFETY: forced termination is only configured through
        // `ServiceBuilder::allow_forced_termination`, whose caller accepted
        // its contract.
        if let Err(err) = unsafe { worker.force_terminate() } {
            tracing::error!(worker = %worker.name(), error = %err, "forced termination failed");
        }
    }

    /// Sleeps the current worker for `duration`.
    ///
    /// Returns `false` if the worker was interrupted, before or during the
    /// sleep; the interrupt is consumed.
    pub fn try_sleep(&self, duration: Duration) -> bool {
        interruptible_sleep(&Worker::current(), duration)
    }

    /// Interrupts the current worker once `delay` has elapsed.
    pub fn schedule_interruption(&self, delay: Duration) -> TimeoutHandle {
        let current = Worker::current();
        let handler = self.fault_handler_for(&current);

        self.deadlines()
            .request_interruption_with(&current, &handler, delay)
    }

    /// Runs `action` on the deadline worker once `delay` has elapsed.
    ///
    /// A panic in `action` is reported to the caller's fault handler.
    pub fn run_timeout<F>(&self, delay: Duration, action: F) -> TimeoutHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let current = Worker::current();
        let handler = self.fault_handler_for(&current);

        self.deadlines().schedule(&current, &handler, delay, action)
    }

    /// Queues `action` on the current environment's deferred queue.
    pub fn run_deferred<F>(&self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.current_environment().push_deferred(action);
    }

    pub fn run_eventually<F>(&self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.current_environment().push_eventually(action);
    }

    pub fn run_finally<F>(&self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.current_environment().push_finally(action);
    }

    /// Stops accepting workers, abandons pending deadlines and stops the
    /// dedicated resolver. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        self.deadlines().shutdown();

        if let Some(resolver) = self.inner.resolver.get() {
            resolver.stop();
            self.inner.environments.evict(resolver.environment());
        }

        tracing::info!("concurrency service shut down");
    }
}

impl Default for ConcurrencyService {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a spawned worker needs to run and clean up after itself.
struct Job {
    worker: Worker,
    env: Arc<Environment>,
    registry: Arc<EnvironmentRegistry>,
    handler: FaultHandler,
    flush_time: Duration,
}

impl Job {
    fn run<F>(self, action: F)
    where
        F: FnOnce(),
    {
        let Job {
            worker,
            env,
            registry,
            handler,
            flush_time,
        } = self;

        let _terminated = TerminateOnExit(worker.clone());

        context::enter_worker(worker.clone(), || {
            tracing::trace!(worker = %worker.name(), "worker started");

            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(action)) {
                handler.handle(&worker, &Fault::from_panic(payload));
            }

            if let Some(own) = registry.owned_by(&worker) {
                if !own.destroy(flush_time) {
                    tracing::warn!(worker = %worker.name(), "worker environment did not drain before exit");
                }
                registry.evict(&own);
            }

            registry.release(&worker);

            if env.maybe_shutdown() {
                registry.evict(&env);
            }
        });

        tracing::trace!(worker = %worker.name(), "worker finished");
    }
}

/// Releases a worker's termination latch when dropped, unwinding included.
struct TerminateOnExit(Worker);

impl Drop for TerminateOnExit {
    fn drop(&mut self) {
        self.0.mark_terminated();
    }
}

fn deliver<R, S, F>(result: &R, on_success: S, on_failure: F)
where
    R: AsyncResult,
    S: FnOnce(R::Output),
    F: FnOnce(R::Error),
{
    match result.take() {
        Some(Ok(value)) => on_success(value),
        Some(Err(error)) => on_failure(error),
        None => tracing::warn!("asynchronous result was already taken; no callback invoked"),
    }
}
