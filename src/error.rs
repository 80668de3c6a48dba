use std::io;

use thiserror::Error;

/// Errors returned by the few fallible operations of the runtime.
///
/// Flush, kill, sleep and result resolution never fail: they report through
/// their boolean result and the fault handler of the worker involved.
#[derive(Debug, Error)]
pub enum Error {
    /// The operating system refused to start a new thread.
    #[error("failed to spawn worker thread `{name}`")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    /// The service was shut down and no longer accepts new workers.
    #[error("concurrency service has been shut down")]
    ShutDown,
}

pub type Result<T> = std::result::Result<T, Error>;
