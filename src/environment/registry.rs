use super::core::Environment;
use crate::fault::{Fault, FaultHandler};
use crate::runtime::worker::{Worker, WorkerId};
use crate::utils::lock;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Structural cache key: a worker identity plus the identity of its fault
/// handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnvKey {
    pub worker: WorkerId,
    pub handler: FaultHandler,
}

impl EnvKey {
    pub fn new(worker: &Worker, handler: &FaultHandler) -> Self {
        Self {
            worker: worker.id(),
            handler: handler.clone(),
        }
    }
}

/// Lazily-populated cache mapping `(worker, fault handler)` to its
/// [`Environment`].
///
/// Every mutation goes through one internal lock. A destroyed environment is
/// treated as absent, so the next lookup for its key creates a fresh one.
pub struct EnvironmentRegistry {
    environments: Mutex<HashMap<EnvKey, Arc<Environment>>>,

    /// Monitor poll interval handed to every environment created here.
    poll_interval: Duration,
}

impl EnvironmentRegistry {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            environments: Mutex::new(HashMap::new()),
            poll_interval,
        }
    }

    /// Returns the environment cached for `(worker, handler)`, creating it if
    /// absent.
    ///
    /// Creating an environment also sweeps the cache: destroyed environments
    /// are dropped, and environments whose owner and members have all
    /// exited are torn down.
    ///
    /// Creation never fails. If the worker has already terminated or is
    /// interrupted, `handler` is invoked with the corresponding fault before
    /// the new environment is returned.
    pub fn get(&self, worker: &Worker, handler: &FaultHandler) -> Arc<Environment> {
        let key = EnvKey::new(worker, handler);

        let (env, abandoned) = {
            let mut environments = lock(&self.environments);

            if let Some(env) = environments.get(&key) {
                if !env.is_destroyed() {
                    return Arc::clone(env);
                }
            }

            let abandoned = take_abandoned(&mut environments);

            let env = Arc::new(Environment::new(
                worker.clone(),
                handler.clone(),
                self.poll_interval,
            ));
            environments.insert(key, Arc::clone(&env));
            (env, abandoned)
        };

        for stale in abandoned {
            stale.discard();
            tracing::debug!(owner = %stale.owner().name(), "discarded environment of exited worker");
        }

        tracing::info!(worker = %worker.name(), id = %worker.id(), "initializing concurrent environment");

        if worker.is_terminated() {
            handler.handle(worker, &Fault::Terminated);
        }

        if worker.is_interrupted() {
            handler.handle(worker, &Fault::Interrupted);
        }

        env
    }

    /// Returns a live environment `worker` is associated with, under any
    /// fault handler. The environment the worker owns is preferred.
    pub fn find(&self, worker: &Worker) -> Option<Arc<Environment>> {
        let environments = lock(&self.environments);

        let mut found = None;
        for (key, env) in environments.iter() {
            if key.worker != worker.id() || env.is_destroyed() {
                continue;
            }

            if env.owner() == worker {
                return Some(Arc::clone(env));
            }

            found.get_or_insert_with(|| Arc::clone(env));
        }

        found
    }

    /// Returns a live environment created by a lookup for `worker`.
    pub fn owned_by(&self, worker: &Worker) -> Option<Arc<Environment>> {
        lock(&self.environments)
            .values()
            .find(|env| env.owner() == worker && !env.is_destroyed())
            .cloned()
    }

    /// Associates `worker` with `env`, so that lookups for `worker` under the
    /// environment's fault handler resolve to it.
    pub fn adopt(&self, env: &Arc<Environment>, worker: &Worker) {
        let key = EnvKey::new(worker, env.fault_handler());
        lock(&self.environments).insert(key, Arc::clone(env));
    }

    /// Removes every key resolving to `env`.
    pub fn evict(&self, env: &Arc<Environment>) {
        lock(&self.environments).retain(|_, cached| !Arc::ptr_eq(cached, env));
    }

    /// Drops the associations of `worker` with environments it does not own,
    /// and removes it from their members.
    pub fn release(&self, worker: &Worker) {
        let mut released = Vec::new();

        lock(&self.environments).retain(|key, env| {
            let adopted = key.worker == worker.id() && env.owner() != worker;
            if adopted {
                released.push(Arc::clone(env));
            }
            !adopted
        });

        for env in released {
            env.retire(worker);
        }
    }

    /// Number of cached keys, including keys of adopted workers.
    pub fn len(&self) -> usize {
        lock(&self.environments).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes destroyed and abandoned environments from the cache, returning
/// the abandoned ones still to be torn down.
fn take_abandoned(environments: &mut HashMap<EnvKey, Arc<Environment>>) -> Vec<Arc<Environment>> {
    let mut abandoned: Vec<Arc<Environment>> = Vec::new();

    environments.retain(|_, env| {
        if env.is_destroyed() {
            return false;
        }

        if !env.is_abandoned() {
            return true;
        }

        if !abandoned.iter().any(|seen| Arc::ptr_eq(seen, env)) {
            abandoned.push(Arc::clone(env));
        }
        false
    });

    abandoned
}

impl Default for EnvironmentRegistry {
    fn default() -> Self {
        Self::new(Duration::from_millis(1))
    }
}
