//! Shared host-side test harness.
//!
//! `SimRtc` backs the driver trait with plain atomics; `Harness` owns a
//! leaked driver/scheduler pair and advances simulated time by jumping from
//! event to event (compare match or counter overflow), delivering the
//! interrupts a real RTC would. Pending software interrupts are serviced
//! after every jump, so the scheduler observes the same interleaving it
//! would on target.

#![allow(dead_code)]

use std::boxed::Box;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::vec::Vec;

use app_timer::{AppTimer, PriorityLevel, RtcDriver, ScheduleFn, RTC_COUNTER_MASK};

const COUNTER_RANGE: u32 = RTC_COUNTER_MASK + 1;

/// Simulated 24-bit RTC. The counter only moves when the harness steps it
/// (or, with `set_auto_advance`, on every `now` read while running, which
/// models a counter that keeps ticking during the drain itself).
pub struct SimRtc {
    counter: AtomicU32,
    compare: AtomicU32,
    auto_advance: AtomicU32,
    running: AtomicBool,
    swi_pending: AtomicBool,
    rtc_pending: AtomicBool,
    level: AtomicU8,
}

impl SimRtc {
    pub const fn new() -> Self {
        SimRtc {
            counter: AtomicU32::new(0),
            compare: AtomicU32::new(0),
            auto_advance: AtomicU32::new(0),
            running: AtomicBool::new(false),
            swi_pending: AtomicBool::new(false),
            rtc_pending: AtomicBool::new(false),
            level: AtomicU8::new(PriorityLevel::Thread as u8),
        }
    }

    pub fn set_auto_advance(&self, ticks: u32) {
        self.auto_advance.store(ticks, Ordering::SeqCst);
    }

    pub fn set_level(&self, level: PriorityLevel) {
        self.level.store(level as u8, Ordering::SeqCst);
    }

    pub fn is_counter_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn counter_masked(&self) -> u32 {
        self.counter.load(Ordering::SeqCst) & RTC_COUNTER_MASK
    }
}

impl RtcDriver for SimRtc {
    fn now(&self) -> u32 {
        let step = self.auto_advance.load(Ordering::SeqCst);
        if step != 0 && self.running.load(Ordering::SeqCst) {
            self.counter.fetch_add(step, Ordering::SeqCst);
        }
        self.counter_masked()
    }

    fn set_compare(&self, value: u32) {
        self.compare.store(value & RTC_COUNTER_MASK, Ordering::SeqCst);
    }

    fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.counter.store(0, Ordering::SeqCst);
    }

    fn pend_update(&self) {
        self.swi_pending.store(true, Ordering::SeqCst);
    }

    fn pend_rtc(&self) {
        self.rtc_pending.store(true, Ordering::SeqCst);
    }

    fn active_level(&self) -> PriorityLevel {
        match self.level.load(Ordering::SeqCst) {
            0 => PriorityLevel::High,
            1 => PriorityLevel::Low,
            _ => PriorityLevel::Thread,
        }
    }
}

pub type TestTimer = AppTimer<&'static SimRtc, 8, 8>;

pub struct Harness {
    pub rtc: &'static SimRtc,
    pub timer: &'static TestTimer,
    time: u64,
}

impl Harness {
    pub fn new() -> Self {
        let rtc: &'static SimRtc = Box::leak(Box::new(SimRtc::new()));
        let timer: &'static TestTimer = Box::leak(Box::new(AppTimer::new(rtc)));
        Harness { rtc, timer, time: 0 }
    }

    pub fn with_bridge(bridge: ScheduleFn) -> Self {
        let rtc: &'static SimRtc = Box::leak(Box::new(SimRtc::new()));
        let timer: &'static TestTimer = Box::leak(Box::new(AppTimer::with_bridge(rtc, bridge)));
        Harness { rtc, timer, time: 0 }
    }

    /// Run pending interrupt handlers until quiescent. The RTC line
    /// preempts the software-interrupt line, as on target.
    pub fn service(&mut self) {
        loop {
            if self.rtc.rtc_pending.swap(false, Ordering::SeqCst) {
                self.timer.on_rtc_interrupt(false);
            } else if self.rtc.swi_pending.swap(false, Ordering::SeqCst) {
                self.timer.process_queues();
            } else {
                break;
            }
        }
    }

    /// Advance simulated time by `ticks`, delivering compare-match and
    /// overflow interrupts at the counter values where the hardware would.
    pub fn advance(&mut self, ticks: u64) {
        self.service();
        let mut remaining = ticks;
        while remaining > 0 {
            if !self.rtc.running.load(Ordering::SeqCst) {
                // Counter is stopped; time passes but nothing fires.
                self.time += remaining;
                SIM_TIME.store(self.time, Ordering::SeqCst);
                return;
            }
            let counter = self.rtc.counter_masked();
            let compare = self.rtc.compare.load(Ordering::SeqCst);

            let to_overflow = (COUNTER_RANGE - counter) as u64;
            let to_compare = {
                let d = compare.wrapping_sub(counter) & RTC_COUNTER_MASK;
                // A compare equal to the current value matches a full
                // revolution from now.
                if d == 0 {
                    COUNTER_RANGE as u64
                } else {
                    d as u64
                }
            };

            let step = remaining.min(to_overflow).min(to_compare);
            self.rtc
                .counter
                .store((counter as u64 + step) as u32 & RTC_COUNTER_MASK, Ordering::SeqCst);
            self.time += step;
            SIM_TIME.store(self.time, Ordering::SeqCst);
            remaining -= step;

            let overflow = step == to_overflow;
            if overflow || step == to_compare {
                self.timer.on_rtc_interrupt(overflow);
            }
            self.service();
        }
    }
}

/// Simulated time of the most recent harness step, readable from handlers.
pub static SIM_TIME: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fire {
    pub context: usize,
    pub at: u64,
}

static FIRED: Mutex<Vec<Fire>> = Mutex::new(Vec::new());

/// Handler that records its context word and the simulated time.
pub fn recording_handler(context: usize) {
    FIRED
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .push(Fire {
            context,
            at: SIM_TIME.load(Ordering::SeqCst),
        });
}

pub fn fires() -> Vec<Fire> {
    FIRED.lock().unwrap_or_else(|e| e.into_inner()).clone()
}

pub fn fires_for(context: usize) -> Vec<Fire> {
    fires().into_iter().filter(|f| f.context == context).collect()
}

static TEST_LOCK: Mutex<()> = Mutex::new(());

/// Serialize tests within a binary (they share the fire log) and reset the
/// shared state. Hold the guard for the whole test.
pub fn begin() -> MutexGuard<'static, ()> {
    let guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    FIRED.lock().unwrap_or_else(|e| e.into_inner()).clear();
    SIM_TIME.store(0, Ordering::SeqCst);
    guard
}
