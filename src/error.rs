//! Timer engine errors.

/// Errors returned synchronously by the timer API.
///
/// Only the enqueue side of an operation can fail; queued effects are applied
/// unconditionally by the next drain and have no error path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// A parameter is out of range: tick count below
    /// [`MIN_TIMEOUT_TICKS`](crate::MIN_TIMEOUT_TICKS), above
    /// [`MAX_TIMEOUT_TICKS`](crate::MAX_TIMEOUT_TICKS), or a timer id outside
    /// the pool.
    InvalidParameter,
    /// The timer slot has not been created.
    InvalidState,
    /// The node pool has no free slot.
    NoMem,
    /// The calling priority level's operation queue is full. Transient; the
    /// caller may retry after the next drain.
    QueueFull,
    /// A by-design-unreachable scheduler state was observed.
    Internal,
}
