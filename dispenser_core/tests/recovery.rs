//! Power-loss recovery repositioning.

mod common;

use common::{GAP, REV, rig_with};
use dispenser_core::store::Store;
use dispenser_core::{DispenseOutcome, DispenserError, DispenserState, MotorStatus};
use dispenser_hardware::SimDropSensor;

/// Persist a crashed mid-treatment record straight into the rig's EEPROM.
fn plant_crashed_state(rig: &common::Rig, dispensed_count: u8) {
    let mut store = Store::new(rig.eeprom.clone());
    store
        .save(&DispenserState {
            steps_per_revolution: REV as f32,
            period: 7,
            dispensed_count,
            is_calibrated: true,
            motor_status: MotorStatus::Turning,
        })
        .unwrap();
}

#[test]
fn boot_flags_a_crashed_session() {
    let rig = rig_with(SimDropSensor::always());
    plant_crashed_state(&rig, 2);
    let mut rig = rig;
    let report = rig.dispenser.boot().unwrap();
    assert!(report.restored);
    assert!(report.power_loss);
    assert!(report.needs_recovery);
    assert!(rig.dispenser.power_loss_pending());
    assert!(
        rig.notices
            .borrow()
            .contains(&"BOOT:POWEROFF_DETECTED".to_owned())
    );
}

#[test]
fn boot_flags_an_incomplete_treatment_after_clean_restart() {
    let rig = rig_with(SimDropSensor::always());
    let mut store = Store::new(rig.eeprom.clone());
    store
        .save(&DispenserState {
            steps_per_revolution: REV as f32,
            period: 7,
            dispensed_count: 3,
            is_calibrated: true,
            motor_status: MotorStatus::Idle,
        })
        .unwrap();
    let mut rig = rig;
    let report = rig.dispenser.boot().unwrap();
    assert!(report.restored);
    assert!(!report.power_loss);
    assert!(report.needs_recovery);
    assert!(rig.notices.borrow().contains(&"BOOT:NORMAL".to_owned()));
}

#[test]
fn recovery_lands_on_the_next_undispensed_compartment() {
    let mut rig = rig_with(SimDropSensor::always());
    plant_crashed_state(&rig, 2);
    rig.dispenser.boot().unwrap();
    rig.dispenser.recover().unwrap();

    // Centered on the notch plus two compartments of 10 steps each.
    let offset = rig.wheel.offset_from_home();
    assert_eq!(offset, i64::from(GAP / 2 - 1 + 2 * (REV / 8)));
    assert_eq!(rig.dispenser.state().motor_status, MotorStatus::Idle);
    assert!(rig.dispenser.is_calibrated());
    assert!(!rig.dispenser.power_loss_pending());
}

#[test]
fn recovery_is_idempotent_without_an_intervening_dispense() {
    let mut rig = rig_with(SimDropSensor::always());
    plant_crashed_state(&rig, 4);
    rig.dispenser.boot().unwrap();

    rig.dispenser.recover().unwrap();
    let first = rig.wheel.offset_from_home();
    rig.dispenser.recover().unwrap();
    let second = rig.wheel.offset_from_home();
    assert_eq!(first, second);
}

#[test]
fn recovered_session_continues_the_count() {
    let mut rig = rig_with(SimDropSensor::always());
    plant_crashed_state(&rig, 2);
    rig.dispenser.boot().unwrap();
    rig.dispenser.recover().unwrap();
    assert_eq!(
        rig.dispenser.dispense_one().unwrap(),
        DispenseOutcome::Dispensed { count: 3, period: 7 }
    );
}

#[test]
fn recovery_without_a_valid_record_is_a_hard_error() {
    let mut rig = rig_with(SimDropSensor::always());
    let before = rig.wheel.offset_from_home();
    let err = rig.dispenser.recover().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DispenserError>(),
        Some(DispenserError::RecoveryUnavailable)
    ));
    // No motion without a known count.
    assert_eq!(rig.wheel.offset_from_home(), before);
}
