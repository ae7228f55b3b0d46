//! The participant's time source.
//!
//! Synchronized participants stamp frames with the coordinated virtual
//! clock; unsynchronized ones free-run on wall clock relative to
//! participant start.

use cosim_types::SimTime;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Instant;

pub(crate) struct TimeProvider {
    synchronized: AtomicBool,
    origin: Instant,
    virtual_now: AtomicI64,
}

impl TimeProvider {
    pub fn new() -> Self {
        Self {
            synchronized: AtomicBool::new(false),
            origin: Instant::now(),
            virtual_now: AtomicI64::new(0),
        }
    }

    /// Switch to the coordinated virtual clock. Called when a simulation
    /// task is configured.
    pub fn set_synchronized(&self) {
        self.synchronized.store(true, Ordering::Release);
    }

    /// Advance the virtual clock. Called by the dispatch thread per tick.
    pub fn set_virtual_now(&self, now: SimTime) {
        self.virtual_now.store(now.as_nanos(), Ordering::Release);
    }

    /// The timestamp for frames emitted right now.
    pub fn now(&self) -> SimTime {
        if self.synchronized.load(Ordering::Acquire) {
            SimTime::from_nanos(self.virtual_now.load(Ordering::Acquire))
        } else {
            SimTime::from_nanos(self.origin.elapsed().as_nanos() as i64)
        }
    }
}

/// Wall-clock nanoseconds since the Unix epoch, for status timestamps.
pub(crate) fn wall_clock_ns() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wallclock_until_synchronized() {
        let time = TimeProvider::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(time.now() > SimTime::ZERO);

        time.set_synchronized();
        time.set_virtual_now(SimTime::from_millis(7));
        assert_eq!(time.now(), SimTime::from_millis(7));
    }
}
