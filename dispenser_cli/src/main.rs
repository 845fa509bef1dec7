//! Orchestrator binary: assembles the rig, drives boot, recovery,
//! calibration and the dispense schedule, and reports results.

mod cli;
mod error_fmt;
mod run;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use eyre::Result;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};
use dispenser_core::MotorStatus;
use run::Session;

fn main() {
    let args = Cli::parse();
    if let Err(e) = init_reporting(&args.log_level) {
        eprintln!("failed to initialize diagnostics: {e}");
        std::process::exit(1);
    }

    let json = args.json;
    match dispatch(args) {
        Ok(()) => {}
        Err(e) => {
            if json {
                println!("{}", error_fmt::to_json(&e));
            } else {
                eprintln!("Error: {e:#}");
                eprintln!("{}", error_fmt::humanize(&e));
            }
            std::process::exit(1);
        }
    }
}

fn init_reporting(log_level: &str) -> Result<()> {
    color_eyre::install()?;
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn dispatch(args: Cli) -> Result<()> {
    let cfg = run::load_config(args.config.as_deref())?;
    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || stop.store(true, Ordering::Relaxed))?;
    }

    match args.cmd {
        Commands::Status => cmd_status(&args.store, args.json),
        Commands::Logs => cmd_logs(&args.store, args.json),
        Commands::Calibrate => {
            let mut session = Session::open(cfg, &args.store, true, stop)?;
            session.dispenser.boot()?;
            session.dispenser.calibrate()?;
            let spr = session.dispenser.steps_per_revolution();
            if args.json {
                println!(
                    "{}",
                    serde_json::json!({ "ok": true, "steps_per_revolution": spr })
                );
            } else {
                println!("Calibration complete: {spr:.2} steps per revolution.");
            }
            Ok(())
        }
        Commands::Recover => {
            let mut session = Session::open(cfg, &args.store, true, stop)?;
            session.dispenser.boot()?;
            session.dispenser.recover()?;
            if args.json {
                println!(
                    "{}",
                    serde_json::json!({
                        "ok": true,
                        "next_slot": session.dispenser.dispensed_count() + 1,
                    })
                );
            } else {
                println!(
                    "Recovery complete; next compartment is {}.",
                    session.dispenser.dispensed_count() + 1
                );
            }
            Ok(())
        }
        Commands::Reset => {
            let mut session = Session::open(cfg, &args.store, true, stop)?;
            session.dispenser.boot()?;
            session.dispenser.reset()?;
            if args.json {
                println!("{}", serde_json::json!({ "ok": true }));
            } else {
                println!("Factory reset performed.");
            }
            Ok(())
        }
        Commands::Run {
            rounds,
            interval_ms,
            period,
            offline,
        } => {
            let interval = interval_ms.unwrap_or(cfg.dispense.interval_ms);
            let default_period = cfg.dispense.default_period;
            let mut session = Session::open(cfg, &args.store, offline, stop)?;
            session.join_uplink();

            let report = session.dispenser.boot()?;
            if report.needs_recovery {
                session.dispenser.recover()?;
            }
            if let Some(p) = period {
                session.dispenser.set_period(p)?;
            } else if !report.restored {
                session.dispenser.set_period(default_period)?;
            }
            if !session.dispenser.is_calibrated() {
                session.dispenser.calibrate()?;
            }
            let remaining = session.dispenser.period() - session.dispenser.dispensed_count();
            let rounds = rounds.unwrap_or(remaining).min(remaining);
            session.run(rounds, interval)
        }
    }
}

fn cmd_status(store_path: &std::path::Path, json: bool) -> Result<()> {
    let mut store = run::open_store(store_path)?;
    let state = store.load()?;
    if json {
        let value = match &state {
            Some(s) => serde_json::json!({
                "ok": true,
                "present": true,
                "calibrated": s.is_calibrated,
                "dispensed": s.dispensed_count,
                "period": s.period,
                "steps_per_revolution": s.steps_per_revolution,
                "interrupted": s.motor_status == MotorStatus::Turning,
            }),
            None => serde_json::json!({ "ok": true, "present": false }),
        };
        println!("{value}");
        return Ok(());
    }
    match state {
        Some(s) => {
            println!(
                "Calibrated: {}, dispensed {}/{}, {:.2} steps/rev{}",
                s.is_calibrated,
                s.dispensed_count,
                s.period,
                s.steps_per_revolution,
                if s.motor_status == MotorStatus::Turning {
                    " (interrupted mid-dispense)"
                } else {
                    ""
                }
            );
        }
        None => println!("No valid state record."),
    }
    Ok(())
}

fn cmd_logs(store_path: &std::path::Path, json: bool) -> Result<()> {
    let mut store = run::open_store(store_path)?;
    let entries: Vec<(u16, String)> = store.log_read_all().collect();
    if json {
        let items: Vec<_> = entries
            .iter()
            .map(|(slot, msg)| serde_json::json!({ "slot": slot, "message": msg }))
            .collect();
        println!("{}", serde_json::json!({ "ok": true, "entries": items }));
        return Ok(());
    }
    if entries.is_empty() {
        println!("No log entries.");
        return Ok(());
    }
    for (slot, msg) in entries {
        println!("{slot:2}: {msg}");
    }
    Ok(())
}
