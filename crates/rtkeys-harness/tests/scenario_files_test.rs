//! Integration test: scenario fixtures and their JSONL logs.
//!
//! Validates that:
//! 1. Every scenario under `scenarios/` parses and replays without a failed step.
//! 2. The walkthrough fixture matches the built-in demo scenario.
//! 3. LogEmitter writes a file that passes `validate_log_file`.
//!
//! Run: cargo test -p rtkeys-harness --test scenario_files_test

use std::path::{Path, PathBuf};

use rtkeys_harness::structured_log::validate_log_file;
use rtkeys_harness::{LogEmitter, Scenario, run_scenario};

fn scenarios_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("scenarios")
}

fn scenario_paths() -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(scenarios_dir())
        .unwrap()
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.extension().and_then(|s| s.to_str()) == Some("json"))
        .collect();
    paths.sort();
    paths
}

#[test]
fn every_fixture_replays_cleanly() {
    let paths = scenario_paths();
    assert!(paths.len() >= 3, "expected fixtures in {:?}", scenarios_dir());
    for path in paths {
        let scenario = Scenario::load(&path).unwrap();
        let mut log = LogEmitter::to_buffer(&scenario.name);
        let report = run_scenario(&scenario, &mut log).unwrap();
        assert!(
            report.passed(),
            "{} failed: {:#?}",
            path.display(),
            report.steps
        );
        assert_eq!(report.stats.conflicts, 0);
    }
}

#[test]
fn walkthrough_fixture_matches_demo() {
    let loaded = Scenario::load(&scenarios_dir().join("walkthrough.json")).unwrap();
    assert_eq!(loaded, Scenario::walkthrough());
}

#[test]
fn exhaustion_fixture_reports_errnos() {
    let scenario = Scenario::load(&scenarios_dir().join("exhaustion.json")).unwrap();
    let mut log = LogEmitter::to_buffer("exhaustion");
    let report = run_scenario(&scenario, &mut log).unwrap();
    assert_eq!(report.destructor_calls, vec![2, 4]);
    assert_eq!(report.stats.exhausted, 3);

    let text = String::from_utf8(log.into_inner()).unwrap();
    let errnos: Vec<i64> = text
        .lines()
        .filter_map(|line| {
            let v: serde_json::Value = serde_json::from_str(line).unwrap();
            v["errno"].as_i64()
        })
        .collect();
    assert_eq!(
        errnos,
        vec![
            i64::from(libc::EAGAIN),
            i64::from(libc::ENOMEM),
            i64::from(libc::ENOMEM)
        ]
    );
}

#[test]
fn file_log_validates() {
    let dir = std::env::temp_dir().join(format!("rtkeys-harness-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("walkthrough.jsonl");

    let scenario = Scenario::walkthrough();
    let mut emitter = LogEmitter::to_file(&path, "file-log").unwrap();
    run_scenario(&scenario, &mut emitter).unwrap();
    drop(emitter);

    let (lines, errors) = validate_log_file(&path).unwrap();
    assert!(errors.is_empty(), "{errors:?}");
    assert_eq!(lines, scenario.steps.len() + 2);
    std::fs::remove_dir_all(&dir).ok();
}
