//! Maps `Box<dyn Error>` from trait boundaries to typed `DispenserError`.
//!
//! The traits in `dispenser_traits` use `Box<dyn Error + Send + Sync>` for
//! maximum flexibility; this module converts those to our typed error enum,
//! with an optional feature-gated path for `dispenser_hardware::HwError`
//! downcasting.

use crate::error::DispenserError;

/// Map a trait-boundary error to a typed `DispenserError`.
///
/// Attempts to downcast known hardware error types first, then falls back
/// to a string-based classification.
pub fn map_hw_error(e: &(dyn std::error::Error + 'static)) -> DispenserError {
    // Feature-gated: try to downcast to HwError for precise mapping
    #[cfg(feature = "hardware-errors")]
    {
        if let Some(hw) = e.downcast_ref::<dispenser_hardware::error::HwError>() {
            return DispenserError::HardwareFault(hw.to_string());
        }
    }

    DispenserError::Hardware(e.to_string())
}
