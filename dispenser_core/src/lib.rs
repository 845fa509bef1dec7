#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Control and resilience engine for the pill dispenser (hardware-agnostic).
//!
//! All hardware interactions go through the `dispenser_traits` seams:
//! stepper, optical fork, drop latch, non-volatile storage and the radio
//! serial link.
//!
//! ## Architecture
//!
//! - **Persistent store**: CRC-protected state record plus a fixed-slot
//!   message log on raw byte-addressable storage (`store` module)
//! - **Homing**: reference-edge location and gap centering, step-bounded
//!   (`homing` module)
//! - **Controller**: calibration, the transactional dispense cycle and
//!   power-loss recovery (`dispenser` module)
//! - **Uplink**: the AT-command join/retry state machine (`uplink` module)
//!
//! The engine is single-threaded and cooperative: interrupt context touches
//! only the drop latch and the bounded edge queue, and every deadline is a
//! wrapping 32-bit millisecond comparison.

pub mod config;
pub mod dispenser;
pub mod error;
pub mod homing;
pub mod hw_error;
pub mod mocks;
pub mod status;
pub mod store;
pub mod uplink;

pub use config::{HomingCfg, TimingCfg, UplinkCfg};
pub use dispenser::{CALIBRATION_ROUNDS, Dispenser, DispenserBuilder};
pub use error::{BuildError, DispenserError, Result};
pub use status::{BootReport, DispenseOutcome};
pub use store::{DispenserState, MotorStatus, Store};
pub use uplink::{JoinStep, Uplink, UplinkStatus};
