//! Environment-scoped worker threads.
//!
//! Every worker thread has an [`Environment`]: three queues of pending
//! actions (deferred, eventually, finally), a set of monitors, and the
//! workers spawned from it. Flushing an environment drains the queues, fires
//! monitors whose predicates hold, and joins the member workers.
//!
//! [`ConcurrencyService`] ties it together: it spawns workers, flushes and
//! kills them, interrupts them on a deadline through the
//! [`DeadlineRegistry`], and resolves [`AsyncResult`]s into callbacks on an
//! environment.

mod error;
mod fault;
mod runtime;
mod utils;

pub mod deadline;
pub mod environment;
pub mod sync;

pub use deadline::{DeadlineRegistry, TimeoutHandle};
pub use environment::{Environment, EnvironmentRegistry, Pending, Priority};
pub use error::{Error, Result};
pub use fault::{Fault, FaultHandler};
pub use runtime::ConcurrencyService;
pub use runtime::builder::{MULTITHREADED_VAR, ServiceBuilder, multithreading_enabled};
pub use runtime::worker::{WeakWorker, Worker, WorkerId, WorkerKind};
pub use sync::{AsyncResult, Promise};
