//! Scenario replay harness for rtkeys.
//!
//! This crate provides:
//! - Scenario files: JSON scripts of key operations across named threads
//! - Replay: run a scenario against a fresh manager and judge every step
//! - Structured logging: one JSONL record per step, plus log validation

#![forbid(unsafe_code)]

pub mod scenario;
pub mod structured_log;

pub use scenario::{Scenario, ScenarioError, ScenarioReport, run_scenario};
pub use structured_log::{LogEmitter, LogEntry, LogLevel, Outcome};
