//! The scheduling engine.
//!
//! Control flow: API calls enqueue Start/Stop/StopAll operations on the
//! caller's priority-level queue and pend a software interrupt. The software
//! interrupt handler calls [`AppTimer::process_queues`], which drains all
//! queues in a fixed pass order (deletions, expiry accounting, insertions)
//! and reprograms the compare register. Independently, the RTC interrupt
//! handler calls [`AppTimer::on_rtc_interrupt`] on every compare match or
//! overflow; it fires due handlers and records the ticks it consumed, but
//! leaves all list surgery to the next drain. Splitting "detect and fire"
//! from "unlink and requeue" bounds the time spent at the time-critical
//! priority to one linear scan.
//!
//! A lock-free layout is only sound when NVIC priorities enforce a single
//! producer and a single consumer per queue; that argument does not transfer
//! to a host target, so the whole core sits behind a critical-section mutex.
//! Per-level FIFO order and the deletions-before-insertions pass order are
//! the guarantees callers rely on, and timeout handlers always run with the
//! lock released so they may call `start`/`stop` re-entrantly.

mod list;
mod node;
mod opqueue;

pub use node::{Mode, ScheduleFn, TimeoutHandler, TimerId};

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;

use crate::error::Error;
use crate::rtc::{
    tick_diff, RtcDriver, LEVEL_COUNT, MAX_TIMEOUT_TICKS, MIN_TIMEOUT_TICKS,
    RTC_COMPARE_OFFSET_MIN, RTC_COUNTER_MASK,
};
use node::{NodeState, TimerNode};
use opqueue::{ElapsedFifo, OpEntry, OpQueue};

struct Core<const N: usize, const Q: usize> {
    nodes: [TimerNode; N],
    /// Head of the active list, or `None` when no timer is pending.
    head: Option<TimerId>,
    queues: [OpQueue<Q>; LEVEL_COUNT],
    elapsed: ElapsedFifo,
    /// Counter value up to which expiries have been accounted; the baseline
    /// of every delta in the active list.
    ticks_latest: u32,
    /// Software-tracked counter overflows, extending `now` to 64 bits.
    overflows: u32,
    rtc_running: bool,
}

/// The timer scheduler.
///
/// `MAX_TIMERS` bounds the node pool, `OP_QUEUE_SIZE` bounds each priority
/// level's operation queue. The whole state lives inside the struct; nothing
/// is process-global, so independent instances coexist (one per RTC).
pub struct AppTimer<D: RtcDriver, const MAX_TIMERS: usize, const OP_QUEUE_SIZE: usize> {
    driver: D,
    bridge: Option<ScheduleFn>,
    state: Mutex<CriticalSectionRawMutex, RefCell<Core<MAX_TIMERS, OP_QUEUE_SIZE>>>,
}

impl<D: RtcDriver, const MAX_TIMERS: usize, const OP_QUEUE_SIZE: usize>
    AppTimer<D, MAX_TIMERS, OP_QUEUE_SIZE>
{
    /// Timeout handlers run directly in the RTC interrupt context.
    pub const fn new(driver: D) -> Self {
        Self::build(driver, None)
    }

    /// Timeout handlers are handed to `bridge` for deferred execution on a
    /// cooperative run loop. If the bridge refuses an event, the handler
    /// runs inline as a fallback.
    pub const fn with_bridge(driver: D, bridge: ScheduleFn) -> Self {
        Self::build(driver, Some(bridge))
    }

    const fn build(driver: D, bridge: Option<ScheduleFn>) -> Self {
        Self {
            driver,
            bridge,
            state: Mutex::new(RefCell::new(Core {
                nodes: [TimerNode::UNUSED; MAX_TIMERS],
                head: None,
                queues: [OpQueue::EMPTY; LEVEL_COUNT],
                elapsed: ElapsedFifo::EMPTY,
                ticks_latest: 0,
                overflows: 0,
                rtc_running: false,
            })),
        }
    }

    /// Allocate a timer slot. Slots are never individually freed; the pool
    /// is sized for the peak number of distinct timers.
    pub fn create(&self, mode: Mode, handler: TimeoutHandler) -> Result<TimerId, Error> {
        self.state
            .lock(|cell| node::allocate(&mut cell.borrow_mut().nodes, mode, handler))
    }

    /// Request that `id` start counting `ticks` from now.
    ///
    /// The request is asynchronous: it is applied by the next drain, so the
    /// timer is not necessarily running when this returns. Starting a timer
    /// that is already running is ignored at drain time. `ticks` must lie in
    /// [`MIN_TIMEOUT_TICKS`]..=[`MAX_TIMEOUT_TICKS`]; the upper bound is the
    /// half-range limit of the counter's modular arithmetic.
    pub fn start(&self, id: TimerId, ticks: u32, context: usize) -> Result<(), Error> {
        if !(MIN_TIMEOUT_TICKS..=MAX_TIMEOUT_TICKS).contains(&ticks) {
            return Err(Error::InvalidParameter);
        }
        self.state.lock(|cell| {
            let core = &mut *cell.borrow_mut();
            let node = core
                .nodes
                .get(id.index())
                .ok_or(Error::InvalidParameter)?;
            if node.state != NodeState::Allocated {
                return Err(Error::InvalidState);
            }
            let periodic = match node.mode {
                Mode::Repeating => ticks,
                Mode::SingleShot => 0,
            };
            let level = self.driver.active_level();
            core.queues[level.index()]
                .push(OpEntry::Start {
                    id,
                    ticks_at_start: self.driver.now(),
                    ticks_first_interval: ticks,
                    ticks_periodic_interval: periodic,
                    context,
                })
                .map_err(|e| {
                    warn!("start: op queue full at level {}", level.index());
                    e
                })
        })?;
        self.driver.pend_update();
        Ok(())
    }

    /// Request that `id` stop. Stopping a timer that is not running is a
    /// no-op, not an error. A stop also cancels any start for the same timer
    /// queued earlier from the same priority level, so a start immediately
    /// followed by a stop never fires.
    pub fn stop(&self, id: TimerId) -> Result<(), Error> {
        self.state.lock(|cell| {
            let core = &mut *cell.borrow_mut();
            let node = core
                .nodes
                .get(id.index())
                .ok_or(Error::InvalidParameter)?;
            if node.state != NodeState::Allocated {
                return Err(Error::InvalidState);
            }
            let level = self.driver.active_level();
            core.queues[level.index()]
                .push(OpEntry::Stop { id })
                .map_err(|e| {
                    warn!("stop: op queue full at level {}", level.index());
                    e
                })
        })?;
        self.driver.pend_update();
        Ok(())
    }

    /// Request that every running timer stop. Bulk cancellation with no
    /// per-timer feedback; pending starts queued in the same cycle survive.
    pub fn stop_all(&self) -> Result<(), Error> {
        self.state.lock(|cell| {
            let core = &mut *cell.borrow_mut();
            let level = self.driver.active_level();
            core.queues[level.index()].push(OpEntry::StopAll)
        })?;
        self.driver.pend_update();
        Ok(())
    }

    /// Extended tick counter: counter value plus software-tracked overflows.
    /// Resets when the active list empties and the counter is stopped.
    pub fn now(&self) -> u64 {
        self.state.lock(|cell| {
            let core = cell.borrow();
            ((core.overflows as u64) << 24) | self.driver.now() as u64
        })
    }

    /// Whether `id` is currently a member of the active list. Reflects
    /// drained state only; a queued start or stop is not yet visible here.
    pub fn is_running(&self, id: TimerId) -> Result<bool, Error> {
        self.state.lock(|cell| {
            let core = cell.borrow();
            let node = core
                .nodes
                .get(id.index())
                .ok_or(Error::InvalidParameter)?;
            Ok(node.is_running)
        })
    }

    /// Ticks from now until the next expiry, or `None` when idle.
    pub fn ticks_to_next_expiry(&self) -> Option<u32> {
        self.state.lock(|cell| {
            let core = cell.borrow();
            let head = core.head?;
            let elapsed = tick_diff(self.driver.now(), core.ticks_latest);
            Some(core.nodes[head.index()].ticks_to_expire.saturating_sub(elapsed))
        })
    }

    /// Snapshot of the active list as (id, ticks from the accounting
    /// baseline), soonest first. Deltas between consecutive entries are
    /// exact; the head's remaining time is [`Self::ticks_to_next_expiry`].
    pub fn expiry_schedule(&self) -> heapless::Vec<(TimerId, u32), MAX_TIMERS> {
        self.state.lock(|cell| {
            let core = cell.borrow();
            list::schedule(&core.nodes, core.head)
        })
    }

    /// Expiry check. Call from the RTC interrupt handler on every compare
    /// match or overflow, after clearing the hardware event flags; pass
    /// `overflow = true` when the counter wrapped.
    ///
    /// Fires every due handler (or hands it to the bridge), records the
    /// ticks consumed, and pends the software interrupt so the next drain
    /// performs the unlink/requeue bookkeeping. Handlers run with the
    /// scheduler lock released.
    pub fn on_rtc_interrupt(&self, overflow: bool) {
        let mut fired: heapless::Vec<(TimeoutHandler, usize), MAX_TIMERS> = heapless::Vec::new();

        self.state.lock(|cell| {
            let core = &mut *cell.borrow_mut();
            if overflow {
                core.overflows = core.overflows.wrapping_add(1);
            }

            let elapsed = tick_diff(self.driver.now(), core.ticks_latest);
            let mut remaining = elapsed;
            let mut expired: u32 = 0;
            let mut cur = core.head;
            while let Some(id) = cur {
                let node = &core.nodes[id.index()];
                if node.ticks_to_expire > remaining {
                    break;
                }
                remaining -= node.ticks_to_expire;
                expired += node.ticks_to_expire;
                if let Some(handler) = node.handler {
                    let _ = fired.push((handler, node.context));
                }
                cur = node.next;
            }
            core.elapsed.push(expired);
            trace!("expiry check: elapsed {} fired {}", elapsed, fired.len());
        });

        self.driver.pend_update();

        for (handler, context) in fired {
            match self.bridge {
                Some(schedule) => {
                    if schedule(handler, context).is_err() {
                        warn!("event bridge refused timeout, running handler inline");
                        handler(context);
                    }
                }
                None => handler(context),
            }
        }
    }

    /// The deferred list-update routine. Call from the software interrupt
    /// handler whenever [`RtcDriver::pend_update`] was pended.
    ///
    /// Pass order is load-bearing: deletions are applied before insertions,
    /// so a stop and a start issued concurrently from different levels
    /// deterministically resolve with the stop first.
    pub fn process_queues(&self) {
        self.state.lock(|cell| {
            let core = &mut *cell.borrow_mut();
            let mut changed = false;
            let rtc_was_reset = self.deletions(core, &mut changed);
            self.expiry_accounting(core, rtc_was_reset, &mut changed);
            self.insertions(core, rtc_was_reset, &mut changed);
            if changed {
                self.rearm(core);
            }
        });
    }

    /// Deletion pass: apply every queued Stop/StopAll. Returns whether the
    /// pass emptied the list and reset the counter.
    fn deletions(&self, core: &mut Core<MAX_TIMERS, OP_QUEUE_SIZE>, changed: &mut bool) -> bool {
        let had_members = core.head.is_some();
        let mut any_deletion = false;

        let Core {
            nodes,
            head,
            queues,
            ..
        } = core;
        for queue in queues.iter_mut() {
            // Positions of stops, for cancelling starts queued before them
            // on the same level.
            let mut stops: heapless::Vec<(usize, TimerId), OP_QUEUE_SIZE> = heapless::Vec::new();
            for (pos, entry) in queue.iter_mut().enumerate() {
                if let OpEntry::Stop { id } = entry {
                    let _ = stops.push((pos, *id));
                }
            }

            for (pos, entry) in queue.iter_mut().enumerate() {
                match entry {
                    OpEntry::Start { id, .. } => {
                        if stops.iter().any(|&(spos, sid)| spos > pos && sid == *id) {
                            *entry = OpEntry::Nop;
                        }
                    }
                    OpEntry::Stop { id } => {
                        let id = *id;
                        if nodes[id.index()].is_running {
                            list::remove(nodes, head, id);
                            nodes[id.index()].is_running = false;
                            any_deletion = true;
                        }
                        *entry = OpEntry::Nop;
                    }
                    OpEntry::StopAll => {
                        let mut cur = *head;
                        while let Some(c) = cur {
                            nodes[c.index()].is_running = false;
                            let next = nodes[c.index()].next;
                            nodes[c.index()].next = None;
                            cur = next;
                        }
                        if head.is_some() {
                            any_deletion = true;
                        }
                        *head = None;
                        *entry = OpEntry::Nop;
                    }
                    OpEntry::Nop => {}
                }
            }
        }

        if any_deletion {
            *changed = true;
        }
        if any_deletion && had_members && core.head.is_none() {
            // With no members left, reset the counter so staging values
            // computed in the insertion pass are relative to a known
            // baseline. Elapsed values still in the FIFO predate the reset
            // and are dropped.
            self.driver.stop();
            core.rtc_running = false;
            core.ticks_latest = 0;
            core.elapsed.clear();
            info!("rtc stopped (list emptied by deletions)");
            return true;
        }
        false
    }

    /// Expiry-accounting pass: consume the ticks recorded by the expiry
    /// check, unlink the nodes it fired, and restage repeating timers from
    /// their fire point so the cadence does not drift.
    fn expiry_accounting(
        &self,
        core: &mut Core<MAX_TIMERS, OP_QUEUE_SIZE>,
        rtc_was_reset: bool,
        changed: &mut bool,
    ) {
        let mut total: u32 = 0;
        while let Some(ticks) = core.elapsed.pop() {
            total = total.wrapping_add(ticks) & RTC_COUNTER_MASK;
        }
        if rtc_was_reset || total == 0 {
            return;
        }

        let prev = core.ticks_latest;
        let mut remaining = total;
        let mut expired: u32 = 0;
        let mut restage: heapless::Vec<TimerId, MAX_TIMERS> = heapless::Vec::new();

        while let Some(h) = core.head {
            let delta = core.nodes[h.index()].ticks_to_expire;
            if delta > remaining {
                break;
            }
            remaining -= delta;
            expired += delta;
            core.head = core.nodes[h.index()].next;

            let node = &mut core.nodes[h.index()];
            node.next = None;
            node.ticks_to_expire = 0;
            if node.mode == Mode::Repeating {
                // The handler already ran in the expiry check; the next
                // period is measured from the fire point, not from now.
                node.ticks_at_start = prev.wrapping_add(expired) & RTC_COUNTER_MASK;
                node.ticks_first_interval = node.ticks_periodic_interval;
                let _ = restage.push(h);
            } else {
                node.is_running = false;
            }
            *changed = true;
        }

        // Advance the surviving head by the leftover, keeping every
        // member's absolute expiry fixed while the baseline moves.
        if let Some(h) = core.head {
            core.nodes[h.index()].ticks_to_expire -= remaining;
        }
        core.ticks_latest = prev.wrapping_add(total) & RTC_COUNTER_MASK;

        for id in restage {
            stage_and_insert(&mut core.nodes, &mut core.head, core.ticks_latest, id, false);
            *changed = true;
        }
    }

    /// Insertion pass: splice every queued Start into the sorted list.
    fn insertions(
        &self,
        core: &mut Core<MAX_TIMERS, OP_QUEUE_SIZE>,
        rtc_was_reset: bool,
        changed: &mut bool,
    ) {
        let Core {
            nodes,
            head,
            queues,
            ticks_latest,
            ..
        } = core;
        for queue in queues.iter_mut() {
            while let Some(entry) = queue.pop() {
                if let OpEntry::Start {
                    id,
                    ticks_at_start,
                    ticks_first_interval,
                    ticks_periodic_interval,
                    context,
                } = entry
                {
                    let node = &mut nodes[id.index()];
                    if node.is_running {
                        // Restart of a running timer is ignored.
                        continue;
                    }
                    node.ticks_at_start = ticks_at_start;
                    node.ticks_first_interval = ticks_first_interval;
                    node.ticks_periodic_interval = ticks_periodic_interval;
                    node.context = context;
                    stage_and_insert(nodes, head, *ticks_latest, id, rtc_was_reset);
                    *changed = true;
                }
            }
        }
    }

    /// Compare-update step: after any list mutation, point the hardware at
    /// the new soonest expiry, or shut the counter down when idle.
    fn rearm(&self, core: &mut Core<MAX_TIMERS, OP_QUEUE_SIZE>) {
        match core.head {
            Some(h) => {
                if !core.rtc_running {
                    self.driver.start();
                    core.rtc_running = true;
                    info!("rtc started");
                }
                self.compare_update(core.ticks_latest, core.nodes[h.index()].ticks_to_expire);
            }
            None => {
                if core.rtc_running {
                    self.driver.stop();
                    core.rtc_running = false;
                    info!("rtc stopped (no pending timers)");
                }
                core.ticks_latest = 0;
                core.elapsed.clear();
            }
        }
    }

    /// Reprogram the compare register for a head `head_delta` ticks after
    /// the baseline, never closer than `RTC_COMPARE_OFFSET_MIN` to the
    /// counter. If the counter may have run past the freshly written value
    /// before it latched, force the interrupt instead of missing the match.
    fn compare_update(&self, ticks_latest: u32, head_delta: u32) {
        let pre = self.driver.now();
        let elapsed = tick_diff(pre, ticks_latest);
        let delta = head_delta.max(elapsed.saturating_add(RTC_COMPARE_OFFSET_MIN));
        let target = ticks_latest.wrapping_add(delta) & RTC_COUNTER_MASK;
        self.driver.set_compare(target);

        let post = self.driver.now();
        if tick_diff(post, pre).saturating_add(RTC_COMPARE_OFFSET_MIN) > tick_diff(target, pre) {
            debug!("compare {} written too late, forcing interrupt", target);
            self.driver.pend_rtc();
        }
    }
}

/// Compute a staged node's delta from the baseline and splice it in.
///
/// `ticks_at_start` was sampled when the caller issued the start, which may
/// be before or after the baseline in modular terms. The half-range
/// tie-break decides: a start within half the counter range ahead of the
/// baseline is a forward sample (the interval stretches by the head start),
/// anything else is a sample the baseline has already passed (the interval
/// shrinks by the overshoot, clamped at zero). Intervals are capped at half
/// the range, so the tie-break cannot misclassify.
fn stage_and_insert(
    nodes: &mut [TimerNode],
    head: &mut Option<TimerId>,
    ticks_latest: u32,
    id: TimerId,
    rtc_was_reset: bool,
) {
    let node = &mut nodes[id.index()];
    if rtc_was_reset {
        // The sample predates the counter reset.
        node.ticks_at_start = 0;
    }
    let ahead = tick_diff(node.ticks_at_start, ticks_latest);
    let delta = if ahead <= RTC_COUNTER_MASK / 2 {
        node.ticks_first_interval + ahead
    } else {
        let behind = tick_diff(ticks_latest, node.ticks_at_start);
        node.ticks_first_interval.saturating_sub(behind)
    };
    node.ticks_to_expire = delta;
    node.ticks_at_start = 0;
    node.ticks_first_interval = 0;
    node.is_running = true;
    list::insert(nodes, head, id);
}
