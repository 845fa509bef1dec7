//! Human-readable error descriptions and structured JSON error output.

/// Map an eyre::Report to an explanation with likely causes and fix hints.
pub fn humanize(err: &eyre::Report) -> String {
    use dispenser_core::{BuildError, DispenserError};

    // Typed matches first
    if let Some(be) = err.downcast_ref::<BuildError>() {
        return match be {
            BuildError::MissingMotor => {
                "What happened: No stepper motor was provided to the engine.\nLikely causes: Motor driver failed to initialize or was not wired into the builder.\nHow to fix: Check the [pins] motor entries in the config and GPIO permissions.".to_string()
            }
            BuildError::MissingOptoFork => {
                "What happened: No opto fork sensor was provided to the engine.\nLikely causes: Sensor pin failed to initialize.\nHow to fix: Check pins.opto_fork in the config and the sensor wiring.".to_string()
            }
            BuildError::MissingDropSensor => {
                "What happened: No pill-drop sensor was provided to the engine.\nLikely causes: Piezo pin failed to initialize.\nHow to fix: Check pins.piezo in the config and the sensor wiring.".to_string()
            }
            BuildError::MissingStorage => {
                "What happened: No non-volatile storage was provided to the engine.\nLikely causes: The EEPROM bus failed to open or the image file is not writable.\nHow to fix: Check the --store path or the I2C bus.".to_string()
            }
            BuildError::InvalidConfig(msg) => format!(
                "What happened: Invalid configuration ({msg}).\nLikely causes: Missing or out-of-range values in the TOML.\nHow to fix: Edit the config file, then rerun."
            ),
        };
    }

    if let Some(de) = err.downcast_ref::<DispenserError>() {
        return match de {
            DispenserError::NotCalibrated => {
                "What happened: Dispensing was requested before calibration.\nLikely causes: First boot, a factory reset, or the wheel ran empty.\nHow to fix: Refill the wheel and run `dispenser calibrate`.".to_string()
            }
            DispenserError::HomeNotFound { limit } => format!(
                "What happened: The reference opening was not seen within {limit} steps.\nLikely causes: Jammed wheel, decoupled motor, or a blocked opto fork.\nHow to fix: Check the mechanics, then recalibrate."
            ),
            DispenserError::RecoveryUnavailable => {
                "What happened: Recovery was requested but no valid state record exists.\nLikely causes: Blank or corrupted storage.\nHow to fix: Run `dispenser calibrate` to start a fresh treatment.".to_string()
            }
            _ => format!(
                "What happened: {de}.\nLikely causes: See logs.\nHow to fix: Re-run with --log-level=debug or set RUST_LOG for more detail."
            ),
        };
    }

    let msg = err.to_string();
    let lower = msg.to_ascii_lowercase();
    if lower.contains("storage bus") {
        return "What happened: The EEPROM did not answer on the storage bus.\nLikely causes: Wrong I2C address, wiring, or insufficient bus permissions.\nHow to fix: Verify the device at 0x50 and the bus permissions.".to_string();
    }

    msg
}

/// Structured error for --json consumers.
pub fn to_json(err: &eyre::Report) -> serde_json::Value {
    serde_json::json!({
        "ok": false,
        "error": err.to_string(),
        "detail": humanize(err),
    })
}
