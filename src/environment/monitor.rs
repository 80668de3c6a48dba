use std::cmp::Ordering;

/// Ordering hint among monitors competing within one environment.
///
/// Higher priorities are evaluated first. `Low` is used for
/// asynchronous-result polling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    #[default]
    Low,
    Medium,
    High,
}

/// "When `predicate` holds, run `callback`."
///
/// A monitor is consumed when its callback fires.
pub(crate) struct Monitor {
    pub(crate) priority: Priority,

    /// Registration order, used to break priority ties.
    pub(crate) seq: u64,

    pub(crate) predicate: Box<dyn FnMut() -> bool + Send + 'static>,
    pub(crate) callback: Box<dyn FnOnce() + Send + 'static>,
}

impl Monitor {
    /// Evaluation order: higher priority first, then registration order.
    pub(crate) fn evaluation_order(a: &Monitor, b: &Monitor) -> Ordering {
        b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq))
    }
}
