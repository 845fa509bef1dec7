//! Calibration against the simulated wheel.

mod common;

use common::{GAP, REV, rig_with};
use dispenser_core::mocks::TickClock;
use dispenser_core::{Dispenser, DispenserError, HomingCfg};
use dispenser_hardware::{SimDropSensor, SimEeprom};

#[test]
fn measures_steps_per_revolution_as_the_round_mean() {
    let mut rig = rig_with(SimDropSensor::always());
    rig.dispenser.calibrate().unwrap();
    // The simulated wheel is perfectly regular, so the mean of the three
    // full-revolution measurements is the revolution length itself.
    assert_eq!(rig.dispenser.steps_per_revolution(), REV as f32);
    assert!(rig.dispenser.is_calibrated());
    assert_eq!(rig.dispenser.dispensed_count(), 0);
}

#[test]
fn parks_centered_on_the_reference_opening() {
    let mut rig = rig_with(SimDropSensor::always());
    rig.dispenser.calibrate().unwrap();
    assert_eq!(rig.wheel.offset_from_home(), i64::from(GAP / 2));
}

#[test]
fn calibration_survives_a_reload() {
    let mut rig = rig_with(SimDropSensor::always());
    rig.dispenser.calibrate().unwrap();
    let report = rig.dispenser.boot().unwrap();
    assert!(report.restored);
    assert!(rig.dispenser.is_calibrated());
    assert_eq!(rig.dispenser.steps_per_revolution(), REV as f32);
}

struct JammedOpto;
impl dispenser_traits::OptoFork for JammedOpto {
    fn is_open(&mut self) -> Result<bool, Box<dyn std::error::Error + Send + Sync>> {
        Ok(false)
    }
}

struct FreeStepper;
impl dispenser_traits::Stepper for FreeStepper {
    fn step(&mut self, _: i8) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Ok(())
    }
    fn release(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Ok(())
    }
}

#[test]
fn a_wheel_with_no_visible_opening_fails_bounded() {
    let mut dispenser = Dispenser::builder()
        .with_motor(Box::new(FreeStepper))
        .with_opto_fork(Box::new(JammedOpto))
        .with_drop_sensor(Box::new(SimDropSensor::never()))
        .with_storage(Box::new(SimEeprom::new(32 * 1024)))
        .with_clock(Box::new(TickClock::new()))
        .with_homing(HomingCfg {
            max_homing_steps: 500,
            max_gap_steps: 100,
        })
        .try_build()
        .unwrap();
    let err = dispenser.calibrate().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DispenserError>(),
        Some(DispenserError::HomeNotFound { limit: 500 })
    ));
    assert!(!dispenser.is_calibrated());
}
