//! Fault reporting for background work.
//!
//! Errors raised by queued or spawned actions are never rethrown into an
//! unrelated call stack. They are converted into a [`Fault`] and handed to
//! the [`FaultHandler`] attached to the worker or environment the work
//! belongs to.

use crate::runtime::worker::Worker;

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};

use thiserror::Error;

/// An error that escaped a worker's action, or a liveness problem found
/// when an environment was created for a worker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Fault {
    /// The action panicked.
    #[error("action panicked: {message}")]
    Panicked { message: String },

    /// The worker had already terminated when its environment was created.
    #[error("worker had already terminated")]
    Terminated,

    /// The worker was interrupted when its environment was created.
    #[error("worker was interrupted")]
    Interrupted,
}

impl Fault {
    /// Converts a panic payload caught with `catch_unwind` into a fault.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        Fault::Panicked {
            message: panic_message(&*payload),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

type HandlerFn = dyn Fn(&Worker, &Fault) + Send + Sync;

/// Capability invoked with `(worker, fault)` when background work fails.
///
/// Handlers compare and hash by identity: two clones of the same handler are
/// equal, two handlers built from identical closures are not. This makes a
/// handler usable as part of the environment cache key, so that workers
/// sharing a handler share an environment.
#[derive(Clone)]
pub struct FaultHandler(Arc<HandlerFn>);

impl FaultHandler {
    /// Wraps a closure as a fault handler.
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&Worker, &Fault) + Send + Sync + 'static,
    {
        Self(Arc::new(handler))
    }

    /// The process-wide default handler, which reports faults through
    /// `tracing` at error level.
    ///
    /// Every call returns a clone of the same handler.
    pub fn logging() -> Self {
        static LOGGING: OnceLock<FaultHandler> = OnceLock::new();

        LOGGING
            .get_or_init(|| {
                FaultHandler::new(|worker, fault| {
                    tracing::error!(worker = %worker.name(), %fault, "unhandled fault in worker");
                })
            })
            .clone()
    }

    /// Invokes the handler.
    ///
    /// A handler that panics is logged and otherwise ignored; the panic never
    /// reaches the thread reporting the fault.
    pub fn handle(&self, worker: &Worker, fault: &Fault) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| (self.0)(worker, fault)));

        if let Err(payload) = outcome {
            let message = panic_message(&*payload);
            tracing::error!(worker = %worker.name(), %fault, panic = %message, "fault handler panicked");
        }
    }

    fn addr(&self) -> *const () {
        Arc::as_ptr(&self.0).cast::<()>()
    }
}

impl PartialEq for FaultHandler {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for FaultHandler {}

impl Hash for FaultHandler {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl fmt::Debug for FaultHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FaultHandler").field(&self.addr()).finish()
    }
}
