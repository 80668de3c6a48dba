mod core;
mod resolver;

pub(crate) mod builder;
pub(crate) mod context;
pub(crate) mod worker;

pub use self::core::ConcurrencyService;
