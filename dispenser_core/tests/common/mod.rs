//! Shared simulated rig for integration tests.
//!
//! The wheel has a 10-step opening in an 80-step revolution, so a
//! calibrated rig measures `steps_per_revolution == 80` and one compartment
//! is exactly 10 steps.

use std::cell::RefCell;
use std::rc::Rc;

use dispenser_core::Dispenser;
use dispenser_core::mocks::TickClock;
use dispenser_hardware::{SimDropSensor, SimEeprom, SimWheel};

pub const GAP: u32 = 10;
pub const REV: u32 = 80;

pub struct Rig {
    pub dispenser: Dispenser,
    pub wheel: SimWheel,
    pub eeprom: SimEeprom,
    pub clock: TickClock,
    pub notices: Rc<RefCell<Vec<String>>>,
}

pub fn rig_with(drop_sensor: SimDropSensor) -> Rig {
    let wheel = SimWheel::starting_blocked(GAP, REV);
    let eeprom = SimEeprom::new(32 * 1024);
    let clock = TickClock::new();
    let notices: Rc<RefCell<Vec<String>>> = Rc::default();
    let sink = notices.clone();
    let dispenser = Dispenser::builder()
        .with_motor(Box::new(wheel.stepper()))
        .with_opto_fork(Box::new(wheel.opto_fork()))
        .with_drop_sensor(Box::new(drop_sensor))
        .with_storage(Box::new(eeprom.clone()))
        .with_clock(Box::new(clock.clone()))
        .with_notify(move |msg| sink.borrow_mut().push(msg.to_owned()))
        .try_build()
        .unwrap();
    Rig {
        dispenser,
        wheel,
        eeprom,
        clock,
        notices,
    }
}
