//! Timer node pool.
//!
//! A fixed-capacity arena of timer slots. Slots are linked into the active
//! list by index, never by pointer; a slot is `Free` until created and stays
//! `Allocated` for the lifetime of the scheduler.

use crate::error::Error;

/// Handle to an allocated timer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TimerId(u16);

impl TimerId {
    pub(crate) fn new(index: usize) -> Self {
        TimerId(index as u16)
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }

    /// Raw pool index, for stashing a handle in a context word.
    pub fn into_raw(self) -> u16 {
        self.0
    }

    /// Rebuild a handle from [`into_raw`](Self::into_raw). A handle that was
    /// never minted by `create` is rejected by the API with
    /// [`Error::InvalidState`] or [`Error::InvalidParameter`].
    pub const fn from_raw(raw: u16) -> Self {
        TimerId(raw)
    }
}

/// Expiry behavior of a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Mode {
    /// Fires once, then leaves the active list.
    SingleShot,
    /// Re-arms itself with its periodic interval after every expiry.
    Repeating,
}

/// Timeout callback. Receives the opaque context word passed to `start`.
pub type TimeoutHandler = fn(context: usize);

/// Bridge to an external event queue: hands a fired timeout over instead of
/// running the handler in interrupt context.
pub type ScheduleFn = fn(handler: TimeoutHandler, context: usize) -> Result<(), Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeState {
    Free,
    Allocated,
}

pub(crate) struct TimerNode {
    pub state: NodeState,
    pub mode: Mode,
    pub handler: Option<TimeoutHandler>,
    pub context: usize,
    /// Delta relative to the predecessor in the sorted list; summing deltas
    /// from the head gives absolute ticks from the scheduler baseline.
    pub ticks_to_expire: u32,
    // Staging fields, written by a Start operation and consumed on splice.
    pub ticks_at_start: u32,
    pub ticks_first_interval: u32,
    pub ticks_periodic_interval: u32,
    /// True exactly while the node is a member of the active list.
    pub is_running: bool,
    pub next: Option<TimerId>,
}

impl TimerNode {
    pub(crate) const UNUSED: TimerNode = TimerNode {
        state: NodeState::Free,
        mode: Mode::SingleShot,
        handler: None,
        context: 0,
        ticks_to_expire: 0,
        ticks_at_start: 0,
        ticks_first_interval: 0,
        ticks_periodic_interval: 0,
        is_running: false,
        next: None,
    };
}

/// Claim the first free slot. The caller holds the scheduler lock, so
/// concurrent creation cannot hand out the same slot twice.
pub(crate) fn allocate(
    nodes: &mut [TimerNode],
    mode: Mode,
    handler: TimeoutHandler,
) -> Result<TimerId, Error> {
    for (index, node) in nodes.iter_mut().enumerate() {
        if node.state == NodeState::Free {
            *node = TimerNode::UNUSED;
            node.state = NodeState::Allocated;
            node.mode = mode;
            node.handler = Some(handler);
            return Ok(TimerId::new(index));
        }
    }
    Err(Error::NoMem)
}
