//! CLI argument definitions.

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "dispenser", version, about = "Pill dispenser control CLI")]
pub struct Cli {
    /// Path to config TOML
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Path to the EEPROM image file (created if missing)
    #[arg(long, value_name = "FILE", default_value = "dispenser_eeprom.bin")]
    pub store: PathBuf,

    /// Print results as JSON
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,

    /// Console log level (error|warn|info|debug|trace)
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "warn")]
    pub log_level: String,

    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Home the wheel and measure steps per revolution
    Calibrate,
    /// Dispense pills on the configured schedule
    Run {
        /// Pills to dispense this session (defaults to what remains of the
        /// treatment period)
        #[arg(long)]
        rounds: Option<u8>,
        /// Pause between rounds in milliseconds
        #[arg(long, value_name = "MS")]
        interval_ms: Option<u32>,
        /// Treatment period to persist before dispensing (1..=7)
        #[arg(long)]
        period: Option<u8>,
        /// Skip the radio join and run offline
        #[arg(long, action = ArgAction::SetTrue)]
        offline: bool,
    },
    /// Re-establish the wheel position from the persisted record
    Recover,
    /// Show the persisted state
    Status,
    /// Print the on-device log
    Logs,
    /// Clear calibration and progress
    Reset,
}
