//! Interrupt gate and timer.
//!
//! Disabling interrupts is the kernel's one atomicity mechanism: with a
//! single CPU and no kernel preemption, a section bracketed by
//! `set_level(Off)` / `set_level(old)` cannot be interleaved with another
//! thread.  Re-enabling advances the simulated clock one tick; when a time
//! slice is configured, expiring slices request a yield that the syscall
//! return path honors.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntLevel {
    Off,
    On,
}

pub struct Interrupt {
    enabled: AtomicBool,
    ticks: AtomicU64,
    yield_pending: AtomicBool,
    time_slice: Option<u64>,
}

impl Interrupt {
    pub fn new(time_slice: Option<u64>) -> Self {
        Self {
            enabled: AtomicBool::new(true),
            ticks: AtomicU64::new(0),
            yield_pending: AtomicBool::new(false),
            time_slice,
        }
    }

    /// Change the interrupt level, returning the previous one.
    pub fn set_level(&self, level: IntLevel) -> IntLevel {
        let enable = level == IntLevel::On;
        let was = self.enabled.swap(enable, Ordering::SeqCst);
        let old = if was { IntLevel::On } else { IntLevel::Off };
        if enable && !was {
            self.one_tick();
        }
        old
    }

    pub fn level(&self) -> IntLevel {
        if self.enabled.load(Ordering::SeqCst) {
            IntLevel::On
        } else {
            IntLevel::Off
        }
    }

    /// Advance the simulated clock.
    pub fn one_tick(&self) {
        let now = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(slice) = self.time_slice {
            if now % slice == 0 {
                trace!(target: "machine", "time slice expired at tick {now}, requesting yield");
                self.yield_pending.store(true, Ordering::SeqCst);
            }
        }
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    /// Consume a pending preemption request.
    pub fn take_yield_request(&self) -> bool {
        self.yield_pending.swap(false, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_level_returns_previous() {
        let gate = Interrupt::new(None);
        assert_eq!(gate.set_level(IntLevel::Off), IntLevel::On);
        assert_eq!(gate.set_level(IntLevel::Off), IntLevel::Off);
        assert_eq!(gate.set_level(IntLevel::On), IntLevel::Off);
    }

    #[test]
    fn reenabling_ticks_the_clock() {
        let gate = Interrupt::new(None);
        let before = gate.ticks();
        gate.set_level(IntLevel::Off);
        gate.set_level(IntLevel::On);
        assert_eq!(gate.ticks(), before + 1);
    }

    #[test]
    fn slice_expiry_requests_yield_once() {
        let gate = Interrupt::new(Some(2));
        gate.one_tick();
        assert!(!gate.take_yield_request());
        gate.one_tick();
        assert!(gate.take_yield_request());
        assert!(!gate.take_yield_request());
    }
}
