//! Single-word latches crossing the interrupt/main boundary.
//!
//! Interrupt context must do nothing beyond an atomic store; the cooperative
//! loop is the single consumer and reads-and-clears with a swap.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::DropSensor;

/// Pill-drop detect latch. Clone the handle into the edge interrupt; the
/// main loop owns the consuming side through the [`DropSensor`] trait.
#[derive(Debug, Clone, Default)]
pub struct DropLatch {
    flag: Arc<AtomicBool>,
}

impl DropLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interrupt-side: mark a drop. Safe to call from any context.
    #[inline]
    pub fn set(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Peek without consuming (diagnostics only).
    #[inline]
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

impl DropSensor for DropLatch {
    #[inline]
    fn detected(&mut self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    #[inline]
    fn clear(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}
