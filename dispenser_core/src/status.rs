//! Outcome types returned by the dispense cycle and boot restoration.

/// Result of one `dispense_one` attempt. `NoPill` is a failure value the
/// orchestrator may retry, not an error: the rotation completed and only the
/// pill's presence is uncertain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispenseOutcome {
    /// A drop was detected; `count`/`period` are the updated figures.
    Dispensed { count: u8, period: u8 },
    /// The final pill of the treatment was dispensed; the wheel needs a
    /// refill and recalibration (`is_calibrated` has been cleared).
    Emptied { period: u8 },
    /// No drop detected within the pill-fall window.
    NoPill,
}

impl DispenseOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::NoPill)
    }
}

/// What boot-time state restoration found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootReport {
    /// A CRC-valid prior record was loaded.
    pub restored: bool,
    /// The prior record was saved mid-rotation: power was lost during a
    /// dispense cycle.
    pub power_loss: bool,
    /// Repositioning is required before dispensing: either the motor was
    /// turning at the crash, or a calibrated treatment is incomplete after
    /// a manual reset.
    pub needs_recovery: bool,
}
