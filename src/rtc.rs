//! Hardware counter adapter.
//!
//! The scheduler never touches the RTC peripheral directly; everything it
//! needs from the hardware is behind [`RtcDriver`], so the same engine runs
//! against the real RTC + software interrupt on target and against a
//! simulated counter in host tests.

/// Width mask of the RTC counter (24 bits on this hardware class).
pub const RTC_COUNTER_MASK: u32 = 0x00FF_FFFF;

/// Minimum safe distance between "now" and a freshly written compare value.
/// A compare value closer than this may not reliably latch a match.
pub const RTC_COMPARE_OFFSET_MIN: u32 = 3;

/// Smallest interval accepted by [`AppTimer::start`](crate::AppTimer::start);
/// anything shorter leaves no margin for safe compare programming.
pub const MIN_TIMEOUT_TICKS: u32 = 5;

/// Largest accepted interval. The modular tie-break used when splicing staged
/// timers into the list assumes no interval exceeds half the counter range.
pub const MAX_TIMEOUT_TICKS: u32 = RTC_COUNTER_MASK / 2;

/// Interrupt priority level of an API caller.
///
/// One operation queue exists per level; operations issued from the same
/// level are applied in FIFO order, operations from different levels have no
/// defined relative order (beyond stops being applied before starts within
/// one drain cycle).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PriorityLevel {
    /// The hardware-timer interrupt level.
    High = 0,
    /// The software-interrupt (drain) level.
    Low = 1,
    /// Non-interrupt context.
    Thread = 2,
}

pub(crate) const LEVEL_COUNT: usize = 3;

impl PriorityLevel {
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// Access to the free-running 24-bit counter and the two interrupt lines the
/// scheduler is built on.
///
/// On an nRF-class target this wraps RTC1 plus a spare software interrupt;
/// `active_level` reads the NVIC active-interrupt state. Implementations for
/// test harnesses back it with plain atomics.
pub trait RtcDriver {
    /// Current counter value, masked to [`RTC_COUNTER_MASK`].
    fn now(&self) -> u32;

    /// Program the compare register.
    fn set_compare(&self, value: u32);

    /// Start the counter. Idempotent.
    fn start(&self);

    /// Stop the counter and reset it to zero. Idempotent.
    fn stop(&self);

    /// Pend the low-priority software interrupt whose handler runs
    /// [`AppTimer::process_queues`](crate::AppTimer::process_queues).
    fn pend_update(&self);

    /// Force the RTC compare interrupt pending, used when a freshly written
    /// compare value may already lie in the past.
    fn pend_rtc(&self);

    /// Priority level of the current execution context.
    fn active_level(&self) -> PriorityLevel;
}

impl<T: RtcDriver> RtcDriver for &T {
    fn now(&self) -> u32 {
        (**self).now()
    }
    fn set_compare(&self, value: u32) {
        (**self).set_compare(value)
    }
    fn start(&self) {
        (**self).start()
    }
    fn stop(&self) {
        (**self).stop()
    }
    fn pend_update(&self) {
        (**self).pend_update()
    }
    fn pend_rtc(&self) {
        (**self).pend_rtc()
    }
    fn active_level(&self) -> PriorityLevel {
        (**self).active_level()
    }
}

/// Wraparound-safe tick difference: `(to - from) mod 2^24`.
///
/// Callers never special-case counter rollover; elapsed time between two
/// counter samples is always `tick_diff(later, earlier)`.
pub fn tick_diff(to: u32, from: u32) -> u32 {
    to.wrapping_sub(from) & RTC_COUNTER_MASK
}
