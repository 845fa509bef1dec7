//! State record persistence against the simulated EEPROM.

use dispenser_core::store::{MAX_MESSAGE_LEN, STATE_ADDR, Store};
use dispenser_core::{DispenserState, MotorStatus};
use dispenser_hardware::SimEeprom;
use rstest::rstest;

fn store() -> (Store<SimEeprom>, SimEeprom) {
    let eeprom = SimEeprom::new(32 * 1024);
    (Store::new(eeprom.clone()), eeprom)
}

#[test]
fn blank_device_loads_as_absent() {
    let (mut store, _) = store();
    assert_eq!(store.load().unwrap(), None);
}

#[test]
fn save_then_load_roundtrips() {
    let (mut store, _) = store();
    let state = DispenserState {
        steps_per_revolution: 4075.5,
        period: 5,
        dispensed_count: 2,
        is_calibrated: true,
        motor_status: MotorStatus::Turning,
    };
    store.save(&state).unwrap();
    assert_eq!(store.load().unwrap(), Some(state));
}

#[test]
fn corrupted_record_loads_as_absent_not_error() {
    let (mut store, eeprom) = store();
    store.save(&DispenserState::default()).unwrap();
    eeprom.flip_bit(STATE_ADDR + 2, 4);
    assert_eq!(store.load().unwrap(), None);
}

#[test]
fn overwrite_keeps_only_the_latest() {
    let (mut store, _) = store();
    let mut state = DispenserState {
        steps_per_revolution: 80.0,
        period: 3,
        dispensed_count: 0,
        is_calibrated: true,
        motor_status: MotorStatus::Idle,
    };
    store.save(&state).unwrap();
    state.dispensed_count = 1;
    store.save(&state).unwrap();
    assert_eq!(store.load().unwrap(), Some(state));
}

#[test]
fn log_messages_roundtrip_in_slot_order() {
    let (mut store, _) = store();
    assert_eq!(store.log_write("BOOT:NEW").unwrap(), 0);
    assert_eq!(store.log_write("OK: 1/7").unwrap(), 1);
    let entries: Vec<_> = store.log_read_all().collect();
    assert_eq!(
        entries,
        vec![(0, "BOOT:NEW".to_owned()), (1, "OK: 1/7".to_owned())]
    );
}

#[test]
fn long_messages_are_truncated_to_the_slot_window() {
    let (mut store, _) = store();
    let long = "x".repeat(100);
    store.log_write(&long).unwrap();
    let (_, stored) = store.log_read_all().next().unwrap();
    assert_eq!(stored.len(), MAX_MESSAGE_LEN);
    assert_eq!(stored, long[..MAX_MESSAGE_LEN]);
}

/// The terminator of a maximum-length message sits one past the message
/// window; every length up to and including the cap must read back, and
/// the occupied slot must not be handed out again.
#[rstest]
#[case(1)]
#[case(60)]
#[case(61)]
#[case(62)]
fn message_length_boundaries_survive_the_slot(#[case] len: usize) {
    let (mut store, _) = store();
    let msg = "m".repeat(len);
    let slot = store.log_write(&msg).unwrap();
    let stored = msg[..len.min(MAX_MESSAGE_LEN)].to_owned();
    let entries: Vec<_> = store.log_read_all().collect();
    assert_eq!(entries, vec![(slot, stored)]);
    assert_eq!(store.log_write("next").unwrap(), slot + 1);
}

#[test]
fn corrupted_log_slot_is_skipped() {
    let (mut store, eeprom) = store();
    store.log_write("first").unwrap();
    store.log_write("second").unwrap();
    // Corrupt a message byte of slot 0; its self-check must now fail.
    eeprom.flip_bit(2, 0);
    let entries: Vec<_> = store.log_read_all().collect();
    assert_eq!(entries, vec![(1, "second".to_owned())]);
}
