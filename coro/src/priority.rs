/// Priority level for pooled work.
///
/// Higher priority tasks are picked by worker threads before lower priority
/// ones. Tasks of equal priority run in submission order.
///
/// # Ordering
///
/// `Critical > High > Low` derives `Ord` so priorities can be compared
/// and sorted directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    /// Background work with no latency expectations.
    Low,
    /// Default for coroutine resumptions on the pool.
    #[default]
    High,
    /// Work that should preempt everything else queued.
    Critical,
}

/// Named thread a task or coroutine can be sent to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadKind {
    /// The single frame-ticked thread that owns latent actions.
    Game,
    /// Any thread of the shared worker pool.
    Worker,
}
