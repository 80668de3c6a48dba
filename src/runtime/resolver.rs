use super::context;
use crate::environment::{Environment, EnvironmentRegistry};
use crate::error::{Error, Result};
use crate::fault::FaultHandler;
use crate::runtime::worker::Worker;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// Longest idle wait between checks of the stop flag.
const IDLE_PARK: Duration = Duration::from_millis(100);

/// A worker dedicated to evaluating the monitors of its own environment.
///
/// Asynchronous results are attached to the resolver's environment instead
/// of the caller's, so they resolve without the caller ever visiting its
/// environment.
pub(crate) struct Resolver {
    worker: Worker,
    env: Arc<Environment>,
    stop: Arc<AtomicBool>,
    join_timeout: Duration,
}

impl Resolver {
    pub(crate) fn start(
        registry: &EnvironmentRegistry,
        handler: FaultHandler,
        poll_interval: Duration,
        join_timeout: Duration,
    ) -> Result<Self> {
        let name = "enviro-resolver".to_owned();

        let worker = Worker::owned(name.clone());
        worker.set_fault_handler(handler.clone());

        let env = registry.get(&worker, &handler);
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let worker = worker.clone();
            let env = Arc::clone(&env);
            let stop = Arc::clone(&stop);

            thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    worker.attach_thread(thread::current());

                    context::enter_worker(worker.clone(), || {
                        while !stop.load(Ordering::Acquire) {
                            if env.flush(poll_interval) {
                                env.park(IDLE_PARK);
                            }
                        }
                    });

                    worker.mark_terminated();
                })
                .map_err(|source| Error::Spawn { name, source })?
        };

        worker.attach_thread(handle.thread().clone());
        worker.attach_join(handle);

        tracing::debug!(worker = %worker.name(), "resolver started");

        Ok(Self {
            worker,
            env,
            stop,
            join_timeout,
        })
    }

    pub(crate) fn worker(&self) -> &Worker {
        &self.worker
    }

    pub(crate) fn environment(&self) -> &Arc<Environment> {
        &self.env
    }

    /// Stops the resolver loop and waits for it to exit. Idempotent.
    pub(crate) fn stop(&self) {
        if self.stop.swap(true, Ordering::AcqRel) {
            return;
        }

        self.worker.interrupt();
        self.env.wake();

        if !self.worker.join_timeout(self.join_timeout) {
            tracing::warn!(worker = %self.worker.name(), "resolver did not stop in time");
        }
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        self.stop();
    }
}
