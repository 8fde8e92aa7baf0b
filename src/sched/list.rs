//! Delta-encoded sorted timer list.
//!
//! The active list is a singly linked list of node indices ordered by
//! relative ticks-to-expire: each node's delta counts from its predecessor's
//! expiry, so the cumulative sum from the head gives absolute ticks from the
//! scheduler baseline for every member. Insertion is O(n), but the expiry
//! check only ever compares the head's delta against elapsed ticks, and no
//! member stores a large absolute value that could overflow.

use crate::sched::node::{TimerId, TimerNode};

/// Splice `id` into the sorted list. `ticks_to_expire` on the node must hold
/// the absolute delta from the baseline; it is rewritten to the relative
/// delta as the walk consumes predecessors, and the successor's delta is
/// split around the insertion point so the chain total stays correct.
///
/// Ties insert after existing members, so same-expiry timers fire in the
/// order their operations were processed.
pub(crate) fn insert(nodes: &mut [TimerNode], head: &mut Option<TimerId>, id: TimerId) {
    let mut remaining = nodes[id.index()].ticks_to_expire;
    let mut prev: Option<TimerId> = None;
    let mut cur = *head;

    while let Some(c) = cur {
        let delta = nodes[c.index()].ticks_to_expire;
        if remaining < delta {
            break;
        }
        remaining -= delta;
        prev = cur;
        cur = nodes[c.index()].next;
    }

    if let Some(c) = cur {
        nodes[c.index()].ticks_to_expire -= remaining;
    }
    nodes[id.index()].ticks_to_expire = remaining;
    nodes[id.index()].next = cur;
    match prev {
        Some(p) => nodes[p.index()].next = Some(id),
        None => *head = Some(id),
    }
}

/// Splice `id` out of the list, merging its delta into the successor so the
/// chain total is unchanged. A node that is not a member is left alone.
pub(crate) fn remove(nodes: &mut [TimerNode], head: &mut Option<TimerId>, id: TimerId) {
    let mut prev: Option<TimerId> = None;
    let mut cur = *head;
    while let Some(c) = cur {
        if c == id {
            break;
        }
        prev = cur;
        cur = nodes[c.index()].next;
    }
    if cur.is_none() {
        return;
    }

    let next = nodes[id.index()].next;
    if let Some(n) = next {
        nodes[n.index()].ticks_to_expire += nodes[id.index()].ticks_to_expire;
    }
    match prev {
        Some(p) => nodes[p.index()].next = next,
        None => *head = next,
    }
    nodes[id.index()].next = None;
}

/// Snapshot of the active list as (id, cumulative ticks from baseline), in
/// head order.
pub(crate) fn schedule<const N: usize>(
    nodes: &[TimerNode],
    head: Option<TimerId>,
) -> heapless::Vec<(TimerId, u32), N> {
    let mut out = heapless::Vec::new();
    let mut cumulative = 0u32;
    let mut cur = head;
    while let Some(c) = cur {
        cumulative += nodes[c.index()].ticks_to_expire;
        let _ = out.push((c, cumulative));
        cur = nodes[c.index()].next;
    }
    out
}
