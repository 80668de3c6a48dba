//! Synchronization primitives bridging blocking and callback-style code.
//!
//! This module provides:
//! - [`AsyncResult`], the interface the service polls when resolving a
//!   result asynchronously,
//! - [`Promise`], a completion cell collaborators complete from any thread.

mod promise;

#[doc(inline)]
pub use promise::{AsyncResult, Promise};
