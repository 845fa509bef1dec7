//! Dispense cycle controller and power-loss recovery.
//!
//! `Dispenser` owns the hardware seams behind boxed trait objects plus the
//! durable state record. Every operation that changes calibration, count,
//! period or motor phase persists before returning; `dispense_one`
//! additionally persists `Turning` before any motion so a crash mid-rotation
//! is visible at the next boot.

use dispenser_traits::{Clock, DropSensor, MonotonicClock, Nvs, OptoFork, Stepper};

use crate::config::{HomingCfg, TimingCfg};
use crate::error::{BuildError, DispenserError, Result};
use crate::homing::{
    self, DISPENSE_DIRECTION, RECOVERY_DIRECTION, measure_gap_width, move_to_center_from_edge,
    move_to_falling_edge,
};
use crate::hw_error::map_hw_error;
use crate::status::{BootReport, DispenseOutcome};
use crate::store::{DispenserState, MotorStatus, Store};

/// The wheel is logically divided into 8 compartments regardless of the
/// configured treatment period.
pub const WHEEL_COMPARTMENTS: f32 = 8.0;

pub const CALIBRATION_ROUNDS: usize = 3;

pub struct Dispenser {
    motor: Box<dyn Stepper>,
    opto: Box<dyn OptoFork>,
    drop_sensor: Box<dyn DropSensor>,
    store: Store<Box<dyn Nvs>>,
    clock: Box<dyn Clock>,
    timing: TimingCfg,
    homing: HomingCfg,
    state: DispenserState,
    /// Set by `boot` when the prior session crashed mid-rotation; cleared
    /// by a successful `recover`.
    power_loss: bool,
    notify: Option<Box<dyn FnMut(&str)>>,
}

impl Dispenser {
    pub fn builder() -> DispenserBuilder {
        DispenserBuilder::default()
    }

    pub fn state(&self) -> &DispenserState {
        &self.state
    }

    pub fn is_calibrated(&self) -> bool {
        self.state.is_calibrated
    }

    pub fn dispensed_count(&self) -> u8 {
        self.state.dispensed_count
    }

    pub fn period(&self) -> u8 {
        self.state.period
    }

    pub fn steps_per_revolution(&self) -> f32 {
        self.state.steps_per_revolution
    }

    /// Whether a crash mid-rotation was detected at boot and has not yet
    /// been repaired by `recover`.
    pub fn power_loss_pending(&self) -> bool {
        self.power_loss
    }

    /// Access to the persistent store, for log inspection and maintenance.
    pub fn store_mut(&mut self) -> &mut Store<Box<dyn Nvs>> {
        &mut self.store
    }

    /// Restore persisted state, or fall back to defaults when no valid
    /// record exists. Emits the boot notice and decides whether the wheel
    /// position must be re-established before dispensing.
    pub fn boot(&mut self) -> Result<BootReport> {
        let report = match self.store.load()? {
            Some(prior) => {
                tracing::info!(
                    calibrated = prior.is_calibrated,
                    count = prior.dispensed_count,
                    period = prior.period,
                    motor = ?prior.motor_status,
                    "restored persisted state"
                );
                let boot_line = format!(
                    "BOOT:Calibrated:{},Dispensed:{}/{},MotorStatus:{}",
                    u8::from(prior.is_calibrated),
                    prior.dispensed_count,
                    prior.period,
                    prior.motor_status.to_byte(),
                );
                self.log(&boot_line);

                let power_loss = prior.motor_status == MotorStatus::Turning;
                if power_loss {
                    self.emit("BOOT:POWEROFF_DETECTED");
                } else {
                    self.emit("BOOT:NORMAL");
                }
                let incomplete =
                    prior.is_calibrated && prior.dispensed_count < prior.period;
                self.state = prior;
                self.power_loss = power_loss;
                BootReport {
                    restored: true,
                    power_loss,
                    needs_recovery: power_loss || incomplete,
                }
            }
            None => {
                tracing::info!("no valid persisted state, starting fresh");
                self.state = DispenserState::default();
                self.power_loss = false;
                self.log("System Boot: No previous settings found.");
                self.emit("BOOT:NEW");
                BootReport {
                    restored: false,
                    power_loss: false,
                    needs_recovery: false,
                }
            }
        };
        Ok(report)
    }

    /// Measure `steps_per_revolution` and leave the wheel centered on the
    /// reference opening.
    ///
    /// Homes forward, then steps through `CALIBRATION_ROUNDS` full
    /// revolutions. Each round is one aligned traversal plus one blocked
    /// traversal; the per-round totals are averaged to smooth slip and
    /// friction variance. The motor has no absolute encoder, so the single
    /// notch plus averaged step counting is the only source of truth.
    pub fn calibrate(&mut self) -> Result<()> {
        move_to_falling_edge(
            &mut self.motor,
            &mut self.opto,
            &*self.clock,
            DISPENSE_DIRECTION,
            self.homing.max_homing_steps,
        )?;
        self.clock.sleep_ms(self.timing.post_home_settle_ms);

        let mut measurements = [0u32; CALIBRATION_ROUNDS];
        let mut last_gap_width = 0u32;
        for round in measurements.iter_mut() {
            let gap_steps = homing::traverse(
                &mut self.motor,
                &mut self.opto,
                &*self.clock,
                DISPENSE_DIRECTION,
                true,
                self.homing.max_homing_steps,
            )?;
            let blind_steps = homing::traverse(
                &mut self.motor,
                &mut self.opto,
                &*self.clock,
                DISPENSE_DIRECTION,
                false,
                self.homing.max_homing_steps,
            )?;
            *round = gap_steps + blind_steps;
            last_gap_width = gap_steps;
            self.clock.sleep_ms(self.timing.inter_round_settle_ms);
        }

        move_to_center_from_edge(
            &mut self.motor,
            &mut self.opto,
            &*self.clock,
            DISPENSE_DIRECTION,
            last_gap_width,
        )?;
        self.release_motor()?;

        let sum: u32 = measurements.iter().sum();
        self.state.steps_per_revolution = sum as f32 / CALIBRATION_ROUNDS as f32;
        self.state.is_calibrated = true;
        self.state.dispensed_count = 0;
        self.state.motor_status = MotorStatus::Idle;
        self.persist()?;

        tracing::info!(
            steps_per_revolution = self.state.steps_per_revolution,
            "calibration complete"
        );
        Ok(())
    }

    /// Rotate one compartment forward and report whether a pill fell.
    ///
    /// The `Turning` record is persisted before any motion; a crash between
    /// that write and the final `Idle` write leaves the store correctly
    /// marked "interrupted". `NoPill` persists `Idle` too: the rotation
    /// completed and only the pill's presence is uncertain.
    pub fn dispense_one(&mut self) -> Result<DispenseOutcome> {
        if !self.state.is_calibrated {
            return Err(eyre::Report::new(DispenserError::NotCalibrated));
        }

        self.state.motor_status = MotorStatus::Turning;
        self.persist()?;

        self.drop_sensor.clear();
        let steps =
            (self.state.steps_per_revolution / WHEEL_COMPARTMENTS).round() as u32;
        tracing::debug!(
            steps,
            round = self.state.dispensed_count + 1,
            period = self.state.period,
            "dispensing"
        );
        for _ in 0..steps {
            self.motor
                .step(DISPENSE_DIRECTION)
                .map_err(|e| eyre::Report::new(map_hw_error(&*e)))?;
        }
        self.release_motor()?;

        let outcome = if self.wait_for_drop() {
            self.state.dispensed_count += 1;
            self.log(&format!(
                "OK: {}/{}",
                self.state.dispensed_count, self.state.period
            ));
            self.notify_uplink(&format!(
                "OK:{}/{}",
                self.state.dispensed_count, self.state.period
            ));

            if self.state.dispensed_count >= self.state.period {
                let period = self.state.period;
                self.state.is_calibrated = false;
                self.state.dispensed_count = 0;
                self.emit("EMPTY");
                DispenseOutcome::Emptied { period }
            } else {
                DispenseOutcome::Dispensed {
                    count: self.state.dispensed_count,
                    period: self.state.period,
                }
            }
        } else {
            tracing::warn!("no pill detected within the fall window");
            self.log("Dispense failed: no pill detected");
            self.notify_uplink("NOPILL");
            DispenseOutcome::NoPill
        };

        self.state.motor_status = MotorStatus::Idle;
        self.persist()?;
        Ok(outcome)
    }

    /// Re-establish the wheel position after an unclean restart.
    ///
    /// Within-revolution position is recovered from the persisted counter,
    /// never from the motor: re-home in reverse, center on the notch, then
    /// step forward `dispensed_count` compartments. Idempotent when no
    /// dispense intervenes.
    pub fn recover(&mut self) -> Result<()> {
        let Some(prior) = self.store.load()? else {
            tracing::error!("recovery requested but no valid persisted state");
            return Err(eyre::Report::new(DispenserError::RecoveryUnavailable));
        };
        self.state = prior;
        tracing::info!(
            count = self.state.dispensed_count,
            period = self.state.period,
            steps_per_revolution = self.state.steps_per_revolution,
            "recovering position"
        );

        let target_steps = (f32::from(self.state.dispensed_count)
            * self.state.steps_per_revolution
            / WHEEL_COMPARTMENTS) as u32;

        move_to_falling_edge(
            &mut self.motor,
            &mut self.opto,
            &*self.clock,
            RECOVERY_DIRECTION,
            self.homing.max_homing_steps,
        )?;
        let gap_width = measure_gap_width(
            &mut self.motor,
            &mut self.opto,
            &*self.clock,
            RECOVERY_DIRECTION,
            self.homing.max_gap_steps,
        )?;
        move_to_center_from_edge(
            &mut self.motor,
            &mut self.opto,
            &*self.clock,
            DISPENSE_DIRECTION,
            gap_width,
        )?;
        self.release_motor()?;

        for _ in 0..target_steps {
            self.motor
                .step(DISPENSE_DIRECTION)
                .map_err(|e| eyre::Report::new(map_hw_error(&*e)))?;
        }
        self.release_motor()?;

        self.state.is_calibrated = true;
        self.state.motor_status = MotorStatus::Idle;
        self.persist()?;
        self.power_loss = false;

        self.log("Recovery from power-off successful");
        tracing::info!(
            next_slot = self.state.dispensed_count + 1,
            "recovery complete"
        );
        Ok(())
    }

    /// Change the treatment period (pills per treatment, 1..=7).
    pub fn set_period(&mut self, period: u8) -> Result<()> {
        if !(1..=7).contains(&period) {
            return Err(eyre::Report::new(DispenserError::State(format!(
                "period {period} outside 1..=7"
            ))));
        }
        if period < self.state.dispensed_count {
            return Err(eyre::Report::new(DispenserError::State(format!(
                "period {period} below dispensed count {}",
                self.state.dispensed_count
            ))));
        }
        self.state.period = period;
        self.persist()
    }

    /// Factory reset: calibration and progress are cleared and persisted;
    /// the measured revolution length and period survive.
    pub fn reset(&mut self) -> Result<()> {
        self.state.is_calibrated = false;
        self.state.dispensed_count = 0;
        self.state.motor_status = MotorStatus::Idle;
        self.persist()?;
        self.log("System: Factory Reset Performed");
        Ok(())
    }

    fn wait_for_drop(&mut self) -> bool {
        let start = self.clock.now_ms();
        loop {
            if self.drop_sensor.detected() {
                return true;
            }
            if self.clock.elapsed_since(start) >= self.timing.pill_fall_timeout_ms {
                return false;
            }
            self.clock.sleep_ms(1);
        }
    }

    fn release_motor(&mut self) -> Result<()> {
        self.motor
            .release()
            .map_err(|e| eyre::Report::new(map_hw_error(&*e)))
    }

    fn persist(&mut self) -> Result<()> {
        self.store.save(&self.state)
    }

    /// Same notice to the on-device log and the uplink callback.
    fn emit(&mut self, msg: &str) {
        self.log(msg);
        self.notify_uplink(msg);
    }

    /// Log-write failures are warnings: losing a log line never aborts a
    /// dispense whose state record is already durable.
    fn log(&mut self, msg: &str) {
        if let Err(e) = self.store.log_write(msg) {
            tracing::warn!(error = %e, msg, "log write failed");
        }
    }

    fn notify_uplink(&mut self, msg: &str) {
        if let Some(cb) = &mut self.notify {
            cb(msg);
        }
    }
}

#[derive(Default)]
pub struct DispenserBuilder {
    motor: Option<Box<dyn Stepper>>,
    opto: Option<Box<dyn OptoFork>>,
    drop_sensor: Option<Box<dyn DropSensor>>,
    nvs: Option<Box<dyn Nvs>>,
    clock: Option<Box<dyn Clock>>,
    timing: TimingCfg,
    homing: HomingCfg,
    notify: Option<Box<dyn FnMut(&str)>>,
}

impl DispenserBuilder {
    pub fn with_motor(mut self, motor: Box<dyn Stepper>) -> Self {
        self.motor = Some(motor);
        self
    }

    pub fn with_opto_fork(mut self, opto: Box<dyn OptoFork>) -> Self {
        self.opto = Some(opto);
        self
    }

    pub fn with_drop_sensor(mut self, sensor: Box<dyn DropSensor>) -> Self {
        self.drop_sensor = Some(sensor);
        self
    }

    pub fn with_storage(mut self, nvs: Box<dyn Nvs>) -> Self {
        self.nvs = Some(nvs);
        self
    }

    /// Override the monotonic clock, mainly for tests with a fake clock.
    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_timing(mut self, timing: TimingCfg) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_homing(mut self, homing: HomingCfg) -> Self {
        self.homing = homing;
        self
    }

    /// Fire-and-forget status notices ("OK:n/p", "EMPTY", boot lines) are
    /// delivered through this callback; the controller never waits on it.
    pub fn with_notify<F>(mut self, f: F) -> Self
    where
        F: FnMut(&str) + 'static,
    {
        self.notify = Some(Box::new(f));
        self
    }

    pub fn try_build(self) -> Result<Dispenser> {
        let motor = self.motor.ok_or(BuildError::MissingMotor)?;
        let opto = self.opto.ok_or(BuildError::MissingOptoFork)?;
        let drop_sensor = self.drop_sensor.ok_or(BuildError::MissingDropSensor)?;
        let nvs = self.nvs.ok_or(BuildError::MissingStorage)?;
        if self.homing.max_homing_steps == 0 {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "max_homing_steps must be nonzero",
            )));
        }
        if self.timing.pill_fall_timeout_ms == 0 {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "pill_fall_timeout_ms must be nonzero",
            )));
        }
        let clock = self
            .clock
            .unwrap_or_else(|| Box::new(MonotonicClock::new()));
        Ok(Dispenser {
            motor,
            opto,
            drop_sensor,
            store: Store::new(nvs),
            clock,
            timing: self.timing,
            homing: self.homing,
            state: DispenserState::default(),
            power_loss: false,
            notify: self.notify,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    type DevResult<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

    struct NullStepper;
    impl Stepper for NullStepper {
        fn step(&mut self, _: i8) -> DevResult<()> {
            Ok(())
        }
        fn release(&mut self) -> DevResult<()> {
            Ok(())
        }
    }

    struct AlwaysBlocked;
    impl OptoFork for AlwaysBlocked {
        fn is_open(&mut self) -> DevResult<bool> {
            Ok(false)
        }
    }

    struct NoDrop;
    impl DropSensor for NoDrop {
        fn detected(&mut self) -> bool {
            false
        }
        fn clear(&mut self) {}
    }

    #[derive(Clone, Default)]
    struct MemNvs(Rc<RefCell<Vec<u8>>>);
    impl MemNvs {
        fn new() -> Self {
            Self(Rc::new(RefCell::new(vec![0u8; 32 * 1024])))
        }
    }
    impl Nvs for MemNvs {
        fn write(&mut self, addr: u16, bytes: &[u8]) -> DevResult<()> {
            let a = addr as usize;
            self.0.borrow_mut()[a..a + bytes.len()].copy_from_slice(bytes);
            Ok(())
        }
        fn read(&mut self, addr: u16, buf: &mut [u8]) -> DevResult<()> {
            let a = addr as usize;
            buf.copy_from_slice(&self.0.borrow()[a..a + buf.len()]);
            Ok(())
        }
    }

    fn full_rig() -> Dispenser {
        Dispenser::builder()
            .with_motor(Box::new(NullStepper))
            .with_opto_fork(Box::new(AlwaysBlocked))
            .with_drop_sensor(Box::new(NoDrop))
            .with_storage(Box::new(MemNvs::new()))
            .with_clock(Box::new(crate::mocks::TickClock::new()))
            .try_build()
            .unwrap()
    }

    #[test]
    fn builder_rejects_missing_seams() {
        let Err(err) = Dispenser::builder().try_build() else {
            panic!("empty builder must not build");
        };
        assert!(err.downcast_ref::<BuildError>().is_some());
    }

    #[test]
    fn dispense_requires_calibration() {
        let mut d = full_rig();
        let err = d.dispense_one().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DispenserError>(),
            Some(DispenserError::NotCalibrated)
        ));
    }

    #[test]
    fn set_period_validates_range() {
        let mut d = full_rig();
        assert!(d.set_period(0).is_err());
        assert!(d.set_period(8).is_err());
        d.set_period(5).unwrap();
        assert_eq!(d.period(), 5);
    }

    #[test]
    fn fresh_boot_reports_no_recovery() {
        let mut d = full_rig();
        let report = d.boot().unwrap();
        assert!(!report.restored);
        assert!(!report.needs_recovery);
        assert_eq!(d.period(), 7);
    }

    #[test]
    fn boot_notices_reach_the_callback() {
        let seen: Rc<RefCell<Vec<String>>> = Rc::default();
        let sink = seen.clone();
        let mut d = Dispenser::builder()
            .with_motor(Box::new(NullStepper))
            .with_opto_fork(Box::new(AlwaysBlocked))
            .with_drop_sensor(Box::new(NoDrop))
            .with_storage(Box::new(MemNvs::new()))
            .with_clock(Box::new(crate::mocks::TickClock::new()))
            .with_notify(move |msg| sink.borrow_mut().push(msg.to_owned()))
            .try_build()
            .unwrap();
        d.boot().unwrap();
        assert_eq!(seen.borrow().as_slice(), ["BOOT:NEW"]);
    }
}
