//! Corruption-detection properties of the store encodings.

use dispenser_core::store::{STATE_RECORD_LEN, encode_log_entry, log_entry_is_valid};
use dispenser_core::{DispenserState, MotorStatus};
use proptest::prelude::*;

fn arb_state() -> impl Strategy<Value = DispenserState> {
    (
        1.0f32..100_000.0,
        1u8..=7,
        0u8..=7,
        any::<bool>(),
        any::<bool>(),
    )
        .prop_filter_map("count must fit the period", |(spr, period, count, cal, turning)| {
            (count <= period).then_some(DispenserState {
                steps_per_revolution: spr,
                period,
                dispensed_count: count,
                is_calibrated: cal,
                motor_status: if turning {
                    MotorStatus::Turning
                } else {
                    MotorStatus::Idle
                },
            })
        })
}

proptest! {
    #[test]
    fn state_record_roundtrips(state in arb_state()) {
        let encoded = state.encode();
        prop_assert_eq!(DispenserState::decode(&encoded), Some(state));
    }

    #[test]
    fn any_single_bit_flip_invalidates_the_state_record(
        state in arb_state(),
        bit in 0usize..STATE_RECORD_LEN * 8,
    ) {
        let mut encoded = state.encode();
        encoded[bit / 8] ^= 1 << (bit % 8);
        prop_assert_eq!(DispenserState::decode(&encoded), None);
    }

    #[test]
    fn log_entry_self_check_accepts_what_it_wrote(msg in "[a-z:/]{1,40}") {
        let slot = encode_log_entry(&msg);
        prop_assert!(log_entry_is_valid(&slot));
    }

    // Flips inside the checked window (message or CRC bytes, never the NUL
    // itself) must always be caught.
    #[test]
    fn log_entry_bit_flips_are_caught(msg in "[a-z:/]{1,40}", pick in any::<prop::sample::Index>()) {
        let slot = encode_log_entry(&msg);
        let nul = msg.len();
        let mut positions: Vec<usize> = (0..nul * 8).collect();
        positions.extend((nul + 1) * 8..(nul + 3) * 8);
        let bit = positions[pick.index(positions.len())];

        let mut corrupted = slot;
        corrupted[bit / 8] ^= 1 << (bit % 8);
        prop_assert!(!log_entry_is_valid(&corrupted));
    }
}
