//! Per-worker-group scheduling contexts.
//!
//! An [`Environment`] holds the deferred, eventually and finally queues of a
//! group of workers, the monitors registered against it, and the workers it
//! owns. Environments are created lazily by the [`EnvironmentRegistry`],
//! keyed by `(worker, fault handler)`.
//!
//! It is composed of:
//! - [`core`]: the environment, its queues and its flush/teardown lifecycle,
//! - [`monitor`]: predicate-triggered callbacks and their priorities,
//! - [`registry`]: the keyed, lazily-populated environment cache.

pub(crate) mod core;
pub(crate) mod monitor;
pub(crate) mod registry;

pub use self::core::{Environment, Pending};
pub use monitor::Priority;
pub use registry::{EnvKey, EnvironmentRegistry};

/// A unit of queued work.
pub(crate) type Action = Box<dyn FnOnce() + Send + 'static>;
