//! CLI entrypoint for the rtkeys scenario harness.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use rtkeys_core::KeyConfig;
use rtkeys_harness::structured_log::validate_log_file;
use rtkeys_harness::{LogEmitter, Scenario, ScenarioReport, run_scenario};

/// Scenario tooling for rtkeys.
#[derive(Debug, Parser)]
#[command(name = "rtkeys-harness")]
#[command(about = "Replay thread-specific data scenarios against rtkeys")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Replay a scenario file and print its report.
    Run {
        /// Scenario JSON path.
        #[arg(long)]
        scenario: PathBuf,
        /// Structured JSONL log output path.
        #[arg(long)]
        log: Option<PathBuf>,
    },
    /// Replay the built-in two-thread walkthrough.
    Demo {
        /// Structured JSONL log output path.
        #[arg(long)]
        log: Option<PathBuf>,
    },
    /// Print the configuration read from the environment.
    Config,
    /// Check a structured JSONL log against the schema.
    ValidateLog {
        #[arg(long)]
        log: PathBuf,
    },
}

fn replay(
    scenario: &Scenario,
    log: Option<PathBuf>,
) -> Result<ScenarioReport, Box<dyn std::error::Error>> {
    let run_id = format!("{}-{}", scenario.name, std::process::id());
    let report = match log {
        Some(path) => {
            let mut emitter = LogEmitter::to_file(&path, &run_id)?;
            let report = run_scenario(scenario, &mut emitter)?;
            eprintln!("Log written to {}", path.display());
            report
        }
        None => run_scenario(scenario, &mut LogEmitter::new(std::io::sink(), &run_id))?,
    };
    Ok(report)
}

fn finish(report: &ScenarioReport) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(report)?);
    eprintln!(
        "Scenario '{}': {} steps, {} failed",
        report.name,
        report.steps.len(),
        report.failures()
    );
    if !report.passed() {
        return Err(format!("scenario '{}' failed", report.name).into());
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { scenario, log } => {
            eprintln!("Replaying {}", scenario.display());
            let scenario = Scenario::load(&scenario)?;
            let report = replay(&scenario, log)?;
            finish(&report)?;
        }
        Command::Demo { log } => {
            let report = replay(&Scenario::walkthrough(), log)?;
            finish(&report)?;
        }
        Command::Config => {
            let config = KeyConfig::from_env()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            eprintln!("Pool capacity: {}", config.pool_capacity());
        }
        Command::ValidateLog { log } => {
            let (lines, errors) = validate_log_file(&log)?;
            for err in &errors {
                eprintln!("{err}");
            }
            if !errors.is_empty() {
                return Err(format!("{}: {} schema errors", log.display(), errors.len()).into());
            }
            eprintln!("{}: {lines} lines valid", log.display());
        }
    }

    Ok(())
}
