use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum DispenserError {
    #[error("hardware error: {0}")]
    Hardware(String),
    #[error("hardware fault: {0}")]
    HardwareFault(String),
    #[error("dispenser is not calibrated")]
    NotCalibrated,
    #[error("reference edge not found within {limit} steps")]
    HomeNotFound { limit: u32 },
    #[error("no valid persisted state; recovery requires operator intervention")]
    RecoveryUnavailable,
    #[error("invalid state: {0}")]
    State(String),
}

#[derive(Debug, Error, Clone)]
pub enum BuildError {
    #[error("missing stepper motor")]
    MissingMotor,
    #[error("missing opto fork sensor")]
    MissingOptoFork,
    #[error("missing pill-drop sensor")]
    MissingDropSensor,
    #[error("missing non-volatile storage")]
    MissingStorage,
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
}

pub type Result<T> = eyre::Result<T>;
pub use eyre::Report;
