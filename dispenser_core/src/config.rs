//! Runtime configuration for the control engine.
//!
//! These are the structs threaded through `Dispenser` and `Uplink`. They are
//! separate from the TOML-deserialized schema in `dispenser_config`; the
//! `From` impls bridge the two. Defaults mirror the firmware constants.

/// Timing knobs for the dispense cycle.
#[derive(Debug, Clone)]
pub struct TimingCfg {
    /// Window to wait for the pill-drop latch after a rotation (ms),
    /// polled at 1 ms resolution.
    pub pill_fall_timeout_ms: u32,
    /// Pause after the initial homing pass before measuring (ms).
    pub post_home_settle_ms: u32,
    /// Pause between calibration rounds (ms).
    pub inter_round_settle_ms: u32,
}

impl Default for TimingCfg {
    fn default() -> Self {
        Self {
            pill_fall_timeout_ms: 150,
            post_home_settle_ms: 200,
            inter_round_settle_ms: 100,
        }
    }
}

/// Step bounds for the homing loops. The original firmware span freely
/// until the edge appeared; every loop here carries an explicit cap and
/// fails with `HomeNotFound` instead of spinning.
#[derive(Debug, Clone)]
pub struct HomingCfg {
    /// Cap on steps spent hunting for the reference edge.
    pub max_homing_steps: u32,
    /// Hang guard for one gap-width measurement; the measured width is
    /// clamped, not an error.
    pub max_gap_steps: u32,
}

impl Default for HomingCfg {
    fn default() -> Self {
        Self {
            // two nominal revolutions of the 4096-step drive
            max_homing_steps: 8_192,
            max_gap_steps: 100,
        }
    }
}

/// Join/retry parameters for the radio session.
#[derive(Debug, Clone)]
pub struct UplinkCfg {
    /// OTAA application key placed into `AT+KEY=APPKEY,"..."`.
    pub app_key: String,
    pub port: u8,
    /// Deadline for each configuration step's acknowledgment (ms).
    pub response_timeout_ms: u32,
    /// Longer deadline for the join exchange (ms).
    pub join_timeout_ms: u32,
    /// Initial `AT` probe sends before the session fails terminally.
    pub max_at_retries: u8,
    /// Re-send cap per configuration step once the module has answered.
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

impl From<&dispenser_config::HomingCfg> for HomingCfg {
    fn from(cfg: &dispenser_config::HomingCfg) -> Self {
        Self {
            max_homing_steps: cfg.max_homing_steps,
            max_gap_steps: cfg.max_gap_steps,
        }
    }
}

impl From<&dispenser_config::DispenseCfg> for TimingCfg {
    fn from(cfg: &dispenser_config::DispenseCfg) -> Self {
        Self {
            pill_fall_timeout_ms: cfg.pill_fall_timeout_ms,
            ..Self::default()
        }
    }
}

impl From<&dispenser_config::UplinkCfg> for UplinkCfg {
    fn from(cfg: &dispenser_config::UplinkCfg) -> Self {
        Self {
            app_key: cfg.app_key.clone(),
            port: cfg.port,
            response_timeout_ms: cfg.response_timeout_ms,
            join_timeout_ms: cfg.join_timeout_ms,
            max_at_retries: cfg.max_at_retries,
            max_step_retries: cfg.max_step_retries,
            max_join_attempts: cfg.max_join_attempts,
        }
    }
}
