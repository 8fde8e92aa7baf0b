//! Per-priority-level operation queues and the elapsed-ticks FIFO.
//!
//! Every priority level owns one bounded FIFO of pending operations.
//! Producers and the drain routine serialize on the scheduler's
//! critical-section lock, which preserves the load-bearing guarantee:
//! operations issued from one level are applied in the order they were
//! issued.

use heapless::Deque;

use crate::error::Error;
use crate::sched::node::TimerId;

/// A queued request against a timer, applied at the next drain.
pub(crate) enum OpEntry {
    Start {
        id: TimerId,
        /// Counter value sampled when the caller issued the start.
        ticks_at_start: u32,
        ticks_first_interval: u32,
        ticks_periodic_interval: u32,
        context: usize,
    },
    Stop {
        id: TimerId,
    },
    StopAll,
    /// Neutralized by the deletion pass (a later Stop cancelled this entry).
    Nop,
}

pub(crate) struct OpQueue<const Q: usize> {
    ops: Deque<OpEntry, Q>,
}

impl<const Q: usize> OpQueue<Q> {
    pub const EMPTY: Self = Self { ops: Deque::new() };

    pub fn push(&mut self, entry: OpEntry) -> Result<(), Error> {
        self.ops.push_back(entry).map_err(|_| Error::QueueFull)
    }

    pub fn pop(&mut self) -> Option<OpEntry> {
        self.ops.pop_front()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut OpEntry> {
        self.ops.iter_mut()
    }
}

/// Depth-2 FIFO carrying the tick counts consumed by the expiry check over
/// to the drain routine. Producer is the RTC interrupt, consumer the drain;
/// the double buffer keeps them off the same slot. When both slots are
/// occupied the new value is merged into the newest slot, which is lossless
/// because the consumer sums everything it pops.
pub(crate) struct ElapsedFifo {
    slots: [u32; 2],
    read: u8,
    len: u8,
}

impl ElapsedFifo {
    pub const EMPTY: Self = Self {
        slots: [0; 2],
        read: 0,
        len: 0,
    };

    pub fn push(&mut self, ticks: u32) {
        if self.len == 2 {
            let newest = (self.read + 1) % 2;
            self.slots[newest as usize] = self.slots[newest as usize].saturating_add(ticks);
        } else {
            let write = (self.read + self.len) % 2;
            self.slots[write as usize] = ticks;
            self.len += 1;
        }
    }

    pub fn pop(&mut self) -> Option<u32> {
        if self.len == 0 {
            return None;
        }
        let value = self.slots[self.read as usize];
        self.read = (self.read + 1) % 2;
        self.len -= 1;
        Some(value)
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}
