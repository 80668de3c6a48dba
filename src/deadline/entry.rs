use super::registry::Shared;
use crate::environment::Action;
use crate::fault::FaultHandler;
use crate::runtime::worker::WeakWorker;

use std::sync::Weak;

/// A registered deadline action.
///
/// The entry only holds a weak handle to the requesting worker, so a
/// pending deadline never keeps a finished worker's bookkeeping alive.
pub(crate) struct TimeoutEntry {
    pub(crate) id: u64,

    /// Worker the action is attributed to when it faults.
    pub(crate) worker: WeakWorker,

    /// Handler of the requesting worker at registration time.
    pub(crate) handler: FaultHandler,

    pub(crate) action: Action,
}

/// Handle to a registered deadline.
///
/// Firing and cancellation are mutually exclusive: whichever happens first
/// removes the entry, and the other becomes a no-op.
#[derive(Debug, Clone)]
pub struct TimeoutHandle {
    pub(crate) id: u64,
    pub(crate) shared: Weak<Shared>,
}

impl TimeoutHandle {
    /// Cancels the deadline if it has not fired yet.
    ///
    /// Returns `true` if this call removed the pending entry. Cancelling a
    /// deadline that already fired, was already cancelled, or was abandoned by
    /// a shutdown returns `false`.
    pub fn cancel(&self) -> bool {
        match self.shared.upgrade() {
            Some(shared) => shared.remove(self.id),
            None => false,
        }
    }

    /// Whether the deadline is still waiting to fire.
    pub fn is_pending(&self) -> bool {
        match self.shared.upgrade() {
            Some(shared) => shared.contains(self.id),
            None => false,
        }
    }

    /// Converts the handle into a zero-argument cancellation action.
    pub fn into_cancel(self) -> impl FnOnce() + Send + 'static {
        move || {
            self.cancel();
        }
    }
}
