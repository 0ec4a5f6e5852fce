//! Sliding-window call limiter.
//!
//! A fixed ring of timestamps, one slot per permitted call. A call is admitted
//! when the slot under the cursor is empty or older than the window; the
//! cursor is advanced with a compare-and-swap so concurrent callers never take
//! a lock. Expired slots are simply overwritten.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct RateWindow {
    slots: Box<[AtomicU64]>,
    cursor: AtomicUsize,
    epoch: Instant,
    window_millis: u64,
}

impl RateWindow {
    /// `max_calls == 0` builds an unlimited window.
    pub fn new(max_calls: usize, window: Duration) -> Self {
        Self {
            slots: (0..max_calls).map(|_| AtomicU64::new(0)).collect(),
            cursor: AtomicUsize::new(0),
            epoch: Instant::now(),
            window_millis: window.as_millis().max(1) as u64,
        }
    }

    /// A window of `max_calls` per minute.
    pub fn per_minute(max_calls: usize) -> Self {
        Self::new(max_calls, Duration::from_secs(60))
    }

    pub fn is_unlimited(&self) -> bool {
        self.slots.is_empty()
    }

    /// Whether a call made now would be admitted. Takes no slot.
    pub fn has_capacity(&self) -> bool {
        if self.slots.is_empty() {
            return true;
        }
        let now = self.now();
        let index = self.cursor.load(Ordering::Acquire);
        self.is_free(self.slots[index % self.slots.len()].load(Ordering::Acquire), now)
    }

    /// Try to admit one call now.
    pub fn try_acquire(&self) -> bool {
        if self.slots.is_empty() {
            return true;
        }
        let now = self.now();
        loop {
            let index = self.cursor.load(Ordering::Acquire);
            let slot = &self.slots[index % self.slots.len()];
            if !self.is_free(slot.load(Ordering::Acquire), now) {
                return false;
            }
            if self
                .cursor
                .compare_exchange(
                    index,
                    index.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                slot.store(now, Ordering::Release);
                return true;
            }
        }
    }

    /// Calls admitted inside the current window.
    pub fn in_window(&self) -> usize {
        let now = self.now();
        self.slots
            .iter()
            .filter(|slot| !self.is_free(slot.load(Ordering::Acquire), now))
            .count()
    }

    // Stamps are offset by one so zero always means "never used".
    fn now(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64 + 1
    }

    fn is_free(&self, stamp: u64, now: u64) -> bool {
        stamp == 0 || now.saturating_sub(stamp) >= self.window_millis
    }
}
