#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Config schema for the pill dispenser.
//!
//! `Config` and sub-structs are deserialized from TOML and validated before
//! use. Defaults mirror the firmware constants, so an empty TOML file yields
//! a runnable configuration (minus the uplink app key).

use serde::Deserialize;

/// GPIO pin assignments. Informational for the simulated backend; required
/// by the `hardware` backend.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Pins {
    /// Four stepper coil outputs in half-step order.
    pub motor: [u8; 4],
    pub opto_fork: u8,
    pub piezo: u8,
}

impl Default for Pins {
    fn default() -> Self {
        Self {
            motor: [2, 3, 6, 13],
            opto_fork: 28,
            piezo: 27,
        }
    }
}

/// Dispense-cycle policy.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DispenseCfg {
    /// Treatment period in pills per fill, 1..=7.
    pub default_period: u8,
    /// Attempts per compartment before the orchestrator raises a fault.
    pub max_retries: u8,
    /// Window to wait for the piezo latch after a rotation (ms).
    pub pill_fall_timeout_ms: u32,
    /// Pause between dispensed compartments (ms); spent polling the uplink.
    pub interval_ms: u32,
}

impl Default for DispenseCfg {
    fn default() -> Self {
        Self {
            default_period: 7,
            max_retries: 3,
            pill_fall_timeout_ms: 150,
            interval_ms: 5_000,
        }
    }
}

/// Bounds for the homing and calibration loops.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HomingCfg {
    /// Hard cap on steps spent hunting for the reference edge before the
    /// engine gives up with a fatal error.
    pub max_homing_steps: u32,
    /// Hang guard for a single gap-width measurement.
    pub max_gap_steps: u32,
}

impl Default for HomingCfg {
    fn default() -> Self {
        Self {
            max_homing_steps: 8_192,
            max_gap_steps: 100,
        }
    }
}

/// Radio join/retry parameters.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct UplinkCfg {
    /// OTAA application key, 32 hex characters. Empty disables the uplink.
    pub app_key: String,
    pub port: u8,
    pub response_timeout_ms: u32,
    pub join_timeout_ms: u32,
    /// Initial `AT` probe retries before the session fails terminally.
    pub max_at_retries: u8,
    /// Retry cap for each configuration step after the module has answered.
    pub max_step_retries: u8,
    /// Join re-send cap before the session fails terminally.
    pub max_join_attempts: u8,
}

impl Default for UplinkCfg {
    fn default() -> Self {
        Self {
            app_key: String::new(),
            port: 8,
            response_timeout_ms: 2_000,
            join_timeout_ms: 20_000,
            max_at_retries: 5,
            max_step_retries: 30,
            max_join_attempts: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub pins: Pins,
    pub dispense: DispenseCfg,
    pub homing: HomingCfg,
    pub uplink: UplinkCfg,
}

impl Config {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> eyre::Result<Self> {
        let cfg: Self = toml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> eyre::Result<()> {
        if !(1..=7).contains(&self.dispense.default_period) {
            eyre::bail!(
                "dispense.default_period must be 1..=7, got {}",
                self.dispense.default_period
            );
        }
        if self.dispense.max_retries == 0 {
            eyre::bail!("dispense.max_retries must be at least 1");
        }
        if self.dispense.pill_fall_timeout_ms == 0 {
            eyre::bail!("dispense.pill_fall_timeout_ms must be non-zero");
        }
        if self.homing.max_homing_steps == 0 || self.homing.max_gap_steps == 0 {
            eyre::bail!("homing step bounds must be non-zero");
        }
        if self.homing.max_gap_steps >= self.homing.max_homing_steps {
            eyre::bail!(
                "homing.max_gap_steps ({}) must be smaller than homing.max_homing_steps ({})",
                self.homing.max_gap_steps,
                self.homing.max_homing_steps
            );
        }
        if !self.uplink.app_key.is_empty() {
            if self.uplink.app_key.len() != 32
                || !self.uplink.app_key.bytes().all(|b| b.is_ascii_hexdigit())
            {
                eyre::bail!("uplink.app_key must be 32 hex characters");
            }
        }
        if self.uplink.response_timeout_ms == 0 || self.uplink.join_timeout_ms == 0 {
            eyre::bail!("uplink timeouts must be non-zero");
        }
        if self.uplink.response_timeout_ms > self.uplink.join_timeout_ms {
            eyre::bail!("uplink.response_timeout_ms must not exceed uplink.join_timeout_ms");
        }
        if self.uplink.max_at_retries == 0
            || self.uplink.max_step_retries == 0
            || self.uplink.max_join_attempts == 0
        {
            eyre::bail!("uplink retry caps must be non-zero");
        }
        Ok(())
    }

    /// Whether the uplink should be brought up at all.
    pub fn uplink_enabled(&self) -> bool {
        !self.uplink.app_key.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_firmware_defaults() {
        let cfg = Config::from_toml_str("").expect("defaults validate");
        assert_eq!(cfg.dispense.default_period, 7);
        assert_eq!(cfg.dispense.pill_fall_timeout_ms, 150);
        assert_eq!(cfg.uplink.max_at_retries, 5);
        assert!(!cfg.uplink_enabled());
    }
}
