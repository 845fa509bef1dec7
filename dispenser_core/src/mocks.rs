//! Test and helper mocks for dispenser_core

use std::cell::Cell;
use std::rc::Rc;

use dispenser_traits::Clock;

/// Deterministic manual-advance clock. `sleep_ms` advances the counter
/// without actually sleeping; clones share the same counter, so a test can
/// hold one handle while the unit under test owns another.
#[derive(Debug, Clone, Default)]
pub struct TickClock {
    now: Rc<Cell<u32>>,
}

impl TickClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start near the 32-bit wrap point to exercise wraparound handling.
    pub fn starting_at(ms: u32) -> Self {
        let clock = Self::new();
        clock.now.set(ms);
        clock
    }

    pub fn advance(&self, ms: u32) {
        self.now.set(self.now.get().wrapping_add(ms));
    }
}

impl Clock for TickClock {
    fn now_ms(&self) -> u32 {
        self.now.get()
    }

    fn sleep_ms(&self, ms: u32) {
        self.advance(ms);
    }
}
