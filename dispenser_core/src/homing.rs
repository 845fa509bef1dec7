//! Reference-edge location primitives.
//!
//! The wheel carries exactly one physical notch the opto fork can see. The
//! blocked(1) → open(0) transition while stepping is the reference "falling
//! edge", the only absolute position the hardware can rediscover. All loops
//! here pace at 1 ms per step and carry an explicit step budget; exhausting
//! it returns `HomeNotFound` instead of spinning on a jammed or decoupled
//! wheel.

use dispenser_traits::{Clock, OptoFork, Stepper};

use crate::error::{DispenserError, Result};
use crate::hw_error::map_hw_error;

/// Forward direction used for dispensing and calibration.
pub const DISPENSE_DIRECTION: i8 = 1;
/// Reverse direction used when re-homing after a power loss.
pub const RECOVERY_DIRECTION: i8 = -1;

fn step_once(
    motor: &mut dyn Stepper,
    clock: &dyn Clock,
    direction: i8,
) -> Result<()> {
    motor
        .step(direction)
        .map_err(|e| eyre::Report::new(map_hw_error(&*e)))?;
    clock.sleep_ms(1);
    Ok(())
}

fn sensor_open(opto: &mut dyn OptoFork) -> Result<bool> {
    opto.is_open()
        .map_err(|e| eyre::Report::new(map_hw_error(&*e)))
}

/// Step until the sensor transitions from blocked to open.
///
/// If the wheel starts inside an opening it is first stepped out of it, so
/// the very first open reading cannot be mistaken for the edge. The whole
/// hunt shares one budget of `max_steps`.
pub fn move_to_falling_edge(
    motor: &mut dyn Stepper,
    opto: &mut dyn OptoFork,
    clock: &dyn Clock,
    direction: i8,
    max_steps: u32,
) -> Result<()> {
    let mut budget = max_steps;
    let mut consume = |motor: &mut dyn Stepper| -> Result<()> {
        if budget == 0 {
            return Err(eyre::Report::new(DispenserError::HomeNotFound {
                limit: max_steps,
            }));
        }
        budget -= 1;
        step_once(motor, clock, direction)
    };

    if sensor_open(opto)? {
        while sensor_open(opto)? {
            consume(motor)?;
        }
    }
    while !sensor_open(opto)? {
        consume(motor)?;
    }
    tracing::debug!(direction, used = max_steps - budget, "reference edge found");
    Ok(())
}

/// Step while the sensor stays open, counting steps. The count is clamped
/// at `max_steps` (hang guard); hitting the clamp is not an error.
pub fn measure_gap_width(
    motor: &mut dyn Stepper,
    opto: &mut dyn OptoFork,
    clock: &dyn Clock,
    direction: i8,
    max_steps: u32,
) -> Result<u32> {
    let mut width = 0u32;
    while sensor_open(opto)? && width < max_steps {
        step_once(motor, clock, direction)?;
        width += 1;
    }
    Ok(width)
}

/// Step `gap_width / 2` further, settling at the geometric center of the
/// opening. Centering cancels sensor hysteresis and motor backlash.
pub fn move_to_center_from_edge(
    motor: &mut dyn Stepper,
    opto: &mut dyn OptoFork,
    clock: &dyn Clock,
    direction: i8,
    gap_width: u32,
) -> Result<()> {
    let _ = opto; // centering is open-loop; the sensor plays no part
    for _ in 0..gap_width / 2 {
        step_once(motor, clock, direction)?;
    }
    Ok(())
}

/// Step through one full open (or blocked) traversal, counting steps.
/// Used by calibration, where running off the budget is a fatal error.
pub fn traverse(
    motor: &mut dyn Stepper,
    opto: &mut dyn OptoFork,
    clock: &dyn Clock,
    direction: i8,
    while_open: bool,
    max_steps: u32,
) -> Result<u32> {
    let mut count = 0u32;
    while sensor_open(opto)? == while_open {
        if count >= max_steps {
            return Err(eyre::Report::new(DispenserError::HomeNotFound {
                limit: max_steps,
            }));
        }
        step_once(motor, clock, direction)?;
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::TickClock;
    use std::cell::Cell;
    use std::error::Error;
    use std::rc::Rc;

    type DevResult<T> = std::result::Result<T, Box<dyn Error + Send + Sync>>;

    // Minimal wheel: open for `gap` steps of each `gap + blind` revolution.
    struct FakeStepper(Rc<Cell<i64>>);
    impl Stepper for FakeStepper {
        fn step(&mut self, direction: i8) -> DevResult<()> {
            self.0.set(self.0.get() + i64::from(direction));
            Ok(())
        }
        fn release(&mut self) -> DevResult<()> {
            Ok(())
        }
    }
    struct FakeOpto {
        pos: Rc<Cell<i64>>,
        gap: i64,
        rev: i64,
    }
    impl OptoFork for FakeOpto {
        fn is_open(&mut self) -> DevResult<bool> {
            Ok(self.pos.get().rem_euclid(self.rev) < self.gap)
        }
    }

    fn rig(gap: i64, blind: i64, start: i64) -> (FakeStepper, FakeOpto, Rc<Cell<i64>>) {
        let pos = Rc::new(Cell::new(start));
        (
            FakeStepper(pos.clone()),
            FakeOpto {
                pos: pos.clone(),
                gap,
                rev: gap + blind,
            },
            pos,
        )
    }

    #[test]
    fn finds_edge_from_blocked_region() {
        let (mut motor, mut opto, pos) = rig(10, 90, 50);
        let clock = TickClock::new();
        move_to_falling_edge(&mut motor, &mut opto, &clock, 1, 1000).expect("edge");
        assert_eq!(pos.get().rem_euclid(100), 0, "stops exactly on the edge");
    }

    #[test]
    fn steps_out_of_opening_before_matching() {
        // Starting inside the gap must not match immediately.
        let (mut motor, mut opto, pos) = rig(10, 90, 4);
        let clock = TickClock::new();
        move_to_falling_edge(&mut motor, &mut opto, &clock, 1, 1000).expect("edge");
        assert_eq!(pos.get(), 100, "walked the rest of the revolution");
    }

    #[test]
    fn budget_exhaustion_is_home_not_found() {
        let (mut motor, mut opto, _pos) = rig(10, 90, 50);
        let clock = TickClock::new();
        let err = move_to_falling_edge(&mut motor, &mut opto, &clock, 1, 20)
            .expect_err("budget too small");
        let typed = err.downcast_ref::<DispenserError>().expect("typed error");
        assert!(matches!(typed, DispenserError::HomeNotFound { limit: 20 }));
    }

    #[test]
    fn gap_width_counts_and_clamps() {
        let (mut motor, mut opto, _pos) = rig(10, 90, 0);
        let clock = TickClock::new();
        let w = measure_gap_width(&mut motor, &mut opto, &clock, 1, 100).expect("gap");
        assert_eq!(w, 10);

        let (mut motor, mut opto, _pos) = rig(10, 90, 0);
        let w = measure_gap_width(&mut motor, &mut opto, &clock, 1, 4).expect("clamped");
        assert_eq!(w, 4, "hang guard clamps instead of erroring");
    }

    #[test]
    fn centering_uses_integer_half_gap() {
        let (mut motor, mut opto, pos) = rig(11, 89, 0);
        let clock = TickClock::new();
        move_to_center_from_edge(&mut motor, &mut opto, &clock, 1, 11).expect("center");
        assert_eq!(pos.get(), 5);
    }
}
