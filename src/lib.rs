#![no_std]

//! Application timer engine
//!
//! A tick-based, multi-user timer scheduler driven by a single free-running
//! 24-bit RTC counter and two interrupt levels, organized into clear
//! architectural layers:
//!
//! - `rtc`: hardware counter adapter (driver trait, tick arithmetic)
//! - `sched`: the scheduling engine (node pool, per-level operation queues,
//!   delta-encoded timer list, deferred list-update routine)
//!
//! Start/stop requests are asynchronous: they enqueue an operation on the
//! caller's priority-level queue and pend a software interrupt; the actual
//! list mutation happens when [`AppTimer::process_queues`] runs. The
//! time-critical expiry check ([`AppTimer::on_rtc_interrupt`]) only detects
//! due timers and fires their handlers; all structural bookkeeping is
//! deferred to the lower-priority drain.

#[cfg(test)]
extern crate std;

// This must go first so the other modules see its macros.
mod fmt;

mod error;
pub mod rtc;
pub mod sched;

pub use error::Error;
pub use rtc::{
    tick_diff, PriorityLevel, RtcDriver, MAX_TIMEOUT_TICKS, MIN_TIMEOUT_TICKS,
    RTC_COMPARE_OFFSET_MIN, RTC_COUNTER_MASK,
};
pub use sched::{AppTimer, Mode, ScheduleFn, TimeoutHandler, TimerId};
