//! Hardware assembly and command execution.
//!
//! Without the `hardware` feature the rig is fully simulated: a small
//! regular wheel, an always-dropping pill sensor, a file-backed EEPROM
//! image and an auto-acking radio. The EEPROM file is what makes power-loss
//! recovery demonstrable across process restarts.

use std::cell::RefCell;
use std::fs;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use eyre::{Result, WrapErr};

use dispenser_config::Config;
use dispenser_core::store::NVS_SIZE;
use dispenser_core::{DispenseOutcome, Dispenser, Store, Uplink, UplinkStatus};
use dispenser_hardware::FileEeprom;
use dispenser_traits::{Clock, MonotonicClock};

#[cfg(not(all(feature = "hardware", target_os = "linux")))]
type RadioPort = dispenser_hardware::SimRadio;
#[cfg(all(feature = "hardware", target_os = "linux"))]
type RadioPort = dispenser_hardware::rpi::UartLink;

type SharedUplink = Rc<RefCell<Uplink<RadioPort, MonotonicClock>>>;

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    let text = fs::read_to_string(path)
        .wrap_err_with(|| format!("read config {}", path.display()))?;
    Config::from_toml_str(&text)
}

/// Open the persistent store alone, without booting the engine. Used by
/// read-only commands so they leave no trace in the log.
pub fn open_store(store_path: &Path) -> Result<Store<FileEeprom>> {
    let eeprom = FileEeprom::open(store_path, usize::from(NVS_SIZE))
        .wrap_err("open eeprom image")?;
    Ok(Store::new(eeprom))
}

pub struct Session {
    pub dispenser: Dispenser,
    uplink: Option<SharedUplink>,
    clock: MonotonicClock,
    stop: Arc<AtomicBool>,
    cfg: Config,
}

impl Session {
    /// Assemble the rig. The uplink is created only when the config carries
    /// an application key and the caller did not ask for offline mode.
    pub fn open(
        cfg: Config,
        store_path: &Path,
        offline: bool,
        stop: Arc<AtomicBool>,
    ) -> Result<Self> {
        let storage = open_storage(store_path)?;

        let uplink = if !offline && cfg.uplink_enabled() {
            Some(Rc::new(RefCell::new(Uplink::new(
                open_radio_port()?,
                MonotonicClock::new(),
                (&cfg.uplink).into(),
            ))))
        } else {
            None
        };

        let notify_uplink = uplink.clone();
        let mut builder = Dispenser::builder()
            .with_storage(storage)
            .with_timing((&cfg.dispense).into())
            .with_homing((&cfg.homing).into())
            .with_notify(move |msg| {
                if let Some(up) = &notify_uplink {
                    match up.borrow_mut().send_message(msg) {
                        Ok(true) => {}
                        Ok(false) => tracing::debug!(msg, "uplink not joined, notice dropped"),
                        Err(e) => tracing::warn!(error = %e, msg, "uplink notice failed"),
                    }
                }
            });
        builder = attach_wheel(builder, &cfg)?;

        Ok(Self {
            dispenser: builder.try_build()?,
            uplink,
            clock: MonotonicClock::new(),
            stop,
            cfg,
        })
    }

    /// Poll the radio session until it joins, fails, or the join window
    /// closes; the session then continues offline.
    pub fn join_uplink(&mut self) {
        let Some(uplink) = self.uplink.clone() else {
            return;
        };
        let deadline = self.cfg.uplink.join_timeout_ms;
        let start = self.clock.now_ms();
        while self.clock.elapsed_since(start) < deadline && !self.stopped() {
            let mut up = uplink.borrow_mut();
            if let Err(e) = up.poll() {
                tracing::warn!(error = %e, "uplink poll failed, continuing offline");
                return;
            }
            if up.is_terminal() {
                break;
            }
            drop(up);
            self.clock.sleep_ms(10);
        }
        match uplink.borrow().status() {
            UplinkStatus::Joined => tracing::info!("radio network joined"),
            status => tracing::warn!(?status, "running offline"),
        }
    }

    /// Dispense `rounds` pills with the configured pause in between.
    /// Each round retries a missed drop up to the configured bound before
    /// declaring a fault.
    pub fn run(&mut self, rounds: u8, interval_ms: u32) -> Result<()> {
        for round in 0..rounds {
            if self.stopped() {
                tracing::info!("stop requested, ending session");
                return Ok(());
            }
            if round > 0 {
                self.sleep_with_uplink(interval_ms);
                if self.stopped() {
                    return Ok(());
                }
            }
            match self.dispense_with_retries()? {
                DispenseOutcome::Emptied { period } => {
                    println!("Dispensed {period}/{period}; wheel empty, refill and recalibrate.");
                    return Ok(());
                }
                DispenseOutcome::Dispensed { count, period } => {
                    println!("Dispensed {count}/{period}.");
                }
                DispenseOutcome::NoPill => unreachable!("retries exhausted is an error"),
            }
        }
        Ok(())
    }

    fn dispense_with_retries(&mut self) -> Result<DispenseOutcome> {
        let max_retries = self.cfg.dispense.max_retries.max(1);
        for attempt in 1..=max_retries {
            let outcome = self.dispenser.dispense_one()?;
            if outcome.is_success() {
                return Ok(outcome);
            }
            tracing::warn!(attempt, max_retries, "no pill detected, retrying");
            self.sleep_with_uplink(500);
            if self.stopped() {
                break;
            }
        }
        self.dispenser
            .store_mut()
            .log_write("Dispense fault: retries exhausted")
            .ok();
        eyre::bail!("no pill detected after {max_retries} attempts; check the wheel")
    }

    /// Every multi-second wait polls the radio session instead of sleeping
    /// inert.
    fn sleep_with_uplink(&mut self, ms: u32) {
        let start = self.clock.now_ms();
        while self.clock.elapsed_since(start) < ms && !self.stopped() {
            if let Some(uplink) = &self.uplink {
                let mut up = uplink.borrow_mut();
                if !up.is_terminal() {
                    if let Err(e) = up.poll() {
                        tracing::warn!(error = %e, "uplink poll failed");
                    }
                }
            }
            self.clock.sleep_ms(10);
        }
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }
}

#[cfg(not(all(feature = "hardware", target_os = "linux")))]
fn open_storage(store_path: &Path) -> Result<Box<dyn dispenser_traits::Nvs>> {
    let eeprom =
        FileEeprom::open(store_path, usize::from(NVS_SIZE)).wrap_err("open eeprom image")?;
    Ok(Box::new(eeprom))
}

#[cfg(all(feature = "hardware", target_os = "linux"))]
fn open_storage(_store_path: &Path) -> Result<Box<dyn dispenser_traits::Nvs>> {
    let eeprom = dispenser_hardware::rpi::I2cEeprom::new().wrap_err("open eeprom bus")?;
    Ok(Box::new(eeprom))
}

#[cfg(not(all(feature = "hardware", target_os = "linux")))]
fn open_radio_port() -> Result<RadioPort> {
    Ok(dispenser_hardware::SimRadio::new())
}

#[cfg(all(feature = "hardware", target_os = "linux"))]
fn open_radio_port() -> Result<RadioPort> {
    dispenser_hardware::rpi::UartLink::new(9600).wrap_err("open radio uart")
}

#[cfg(not(all(feature = "hardware", target_os = "linux")))]
fn attach_wheel(
    builder: dispenser_core::DispenserBuilder,
    _cfg: &Config,
) -> Result<dispenser_core::DispenserBuilder> {
    use dispenser_hardware::{SimDropSensor, SimWheel};
    // Small regular wheel: a 1 ms-per-step calibration finishes in well
    // under a second.
    let wheel = SimWheel::starting_blocked(8, 64);
    Ok(builder
        .with_motor(Box::new(wheel.stepper()))
        .with_opto_fork(Box::new(wheel.opto_fork()))
        .with_drop_sensor(Box::new(SimDropSensor::always())))
}

#[cfg(all(feature = "hardware", target_os = "linux"))]
fn attach_wheel(
    builder: dispenser_core::DispenserBuilder,
    cfg: &Config,
) -> Result<dispenser_core::DispenserBuilder> {
    use dispenser_hardware::rpi::{open_drop_sensor, open_wheel};

    let wheel = open_wheel(cfg.pins.motor, cfg.pins.opto_fork)?;
    let drop_sensor = open_drop_sensor(cfg.pins.piezo, None)?;
    Ok(builder
        .with_motor(Box::new(wheel.stepper))
        .with_opto_fork(Box::new(wheel.opto))
        .with_drop_sensor(Box::new(drop_sensor)))
}
