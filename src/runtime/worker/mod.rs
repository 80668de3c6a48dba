//! Worker handles.
//!
//! A worker is an OS thread tracked by the runtime. Workers are either
//! *owned* (spawned by the service around a supplied action) or *foreign*
//! (any other thread that touches the runtime, registered on first use).
//!
//! It is composed of:
//! - [`core`]: the [`Worker`] handle, its interrupt flag and termination latch,
//! - [`platform`]: the last-resort OS termination used by `kill`.

pub(crate) mod core;
pub(crate) mod platform;

pub use self::core::{WeakWorker, Worker, WorkerId, WorkerKind};
