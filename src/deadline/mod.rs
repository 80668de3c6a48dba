//! Deadline-driven interruption.
//!
//! The [`DeadlineRegistry`] owns one background worker that fires registered
//! actions at or after their requested deadline. It is how timeouts and
//! cooperative interruption are implemented.
//!
//! It is composed of:
//! - [`entry`]: registered deadline actions and their cancellation handles,
//! - [`registry`]: the time-ordered registry and its background loop.

mod entry;
mod registry;

pub use entry::TimeoutHandle;
pub use registry::DeadlineRegistry;
