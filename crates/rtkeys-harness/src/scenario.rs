//! Scenario replay.
//!
//! A scenario is a JSON document: a [`KeyConfig`] plus a list of steps, each
//! naming the thread it runs on and the outcome it expects. Keys and threads
//! are referred to by name; thread names are mapped to ids in order of first
//! appearance, starting at 1. Steps run against a fresh [`KeyManager`] driven
//! through [`ManualThreads`], so a whole scenario executes on the calling OS
//! thread and destructor calls are observed in order.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::time::Instant;

use rtkeys_core::{
    ConfigError, Destructor, KeyConfig, KeyError, KeyId, KeyManager, KeyStats, ManualThreads,
    ThreadId,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::structured_log::{LogEmitter, LogEntry, LogLevel, Outcome};

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("reading scenario: {0}")]
    Io(#[from] std::io::Error),
    #[error("parsing scenario: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("scenario config: {0}")]
    Config(#[from] ConfigError),
    #[error("step {step}: key '{name}' was never created")]
    UnknownKey { step: usize, name: String },
}

/// Destructor attached to a created key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestructorKind {
    #[default]
    None,
    /// Appends each value it is called with to the run's destructor log.
    Record,
}

/// Expected result of a step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Expect {
    /// Success; for `get`, any result that is not an error.
    #[default]
    Ok,
    Value(usize),
    Unset,
    Einval,
    Enomem,
    Eagain,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Step {
    Create {
        key: String,
        #[serde(default)]
        destructor: DestructorKind,
        #[serde(default)]
        expect: Expect,
    },
    Set {
        thread: String,
        key: String,
        value: usize,
        #[serde(default)]
        expect: Expect,
    },
    Get {
        thread: String,
        key: String,
        #[serde(default)]
        expect: Expect,
    },
    Delete {
        key: String,
        #[serde(default)]
        expect: Expect,
    },
    /// Run the thread-exit hook. `destructors`, when given, is the exact
    /// sequence of values the recording destructor must see.
    Exit {
        thread: String,
        #[serde(default)]
        destructors: Option<Vec<usize>>,
    },
    /// Cross-check the manager's internal structures.
    Check,
}

impl Step {
    #[must_use]
    pub fn op(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Set { .. } => "set",
            Self::Get { .. } => "get",
            Self::Delete { .. } => "delete",
            Self::Exit { .. } => "exit",
            Self::Check => "check",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    #[serde(default)]
    pub config: KeyConfig,
    pub steps: Vec<Step>,
}

impl Scenario {
    pub fn from_json(text: &str) -> Result<Self, ScenarioError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ScenarioError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Two threads, two keys: per-thread isolation, exit teardown and delete.
    #[must_use]
    pub fn walkthrough() -> Self {
        let set = |thread: &str, key: &str, value| Step::Set {
            thread: thread.into(),
            key: key.into(),
            value,
            expect: Expect::Ok,
        };
        let get = |thread: &str, key: &str, expect| Step::Get {
            thread: thread.into(),
            key: key.into(),
            expect,
        };
        Self {
            name: "walkthrough".into(),
            config: KeyConfig::new(4, 4, 8),
            steps: vec![
                Step::Create {
                    key: "k1".into(),
                    destructor: DestructorKind::None,
                    expect: Expect::Ok,
                },
                Step::Create {
                    key: "k2".into(),
                    destructor: DestructorKind::Record,
                    expect: Expect::Ok,
                },
                set("a", "k1", 10),
                set("a", "k2", 20),
                set("b", "k1", 99),
                get("a", "k1", Expect::Value(10)),
                get("a", "k2", Expect::Value(20)),
                get("b", "k1", Expect::Value(99)),
                get("b", "k2", Expect::Unset),
                Step::Check,
                Step::Exit {
                    thread: "a".into(),
                    destructors: Some(vec![20]),
                },
                Step::Delete {
                    key: "k1".into(),
                    expect: Expect::Ok,
                },
                get("b", "k1", Expect::Einval),
                Step::Check,
            ],
        }
    }
}

/// Per-step verdict.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub step: usize,
    pub op: &'static str,
    pub outcome: Outcome,
    pub expected: String,
    pub observed: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub name: String,
    pub steps: Vec<StepReport>,
    /// Values passed to the recording destructor, in call order.
    pub destructor_calls: Vec<usize>,
    pub stats: KeyStats,
}

impl ScenarioReport {
    #[must_use]
    pub fn failures(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.outcome == Outcome::Fail)
            .count()
    }

    #[must_use]
    pub fn passed(&self) -> bool {
        self.failures() == 0
    }
}

thread_local! {
    static RECORDED: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

fn record_destructor(value: usize) {
    RECORDED.with(|r| r.borrow_mut().push(value));
}

fn take_recorded() -> Vec<usize> {
    RECORDED.with(|r| std::mem::take(&mut *r.borrow_mut()))
}

/// What a step actually produced.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Observed {
    Ok,
    Value(usize),
    Unset,
    Failed(KeyError),
    Destructors(Vec<usize>),
    Broken(String),
}

impl Observed {
    fn describe(&self) -> String {
        match self {
            Self::Ok => "ok".into(),
            Self::Value(v) => format!("value {v}"),
            Self::Unset => "unset".into(),
            Self::Failed(err) => format!("{err} (errno {})", err.errno()),
            Self::Destructors(values) => format!("destructors {values:?}"),
            Self::Broken(why) => format!("invariant violated: {why}"),
        }
    }

    fn errno(&self) -> Option<i32> {
        match self {
            Self::Failed(err) => Some(err.errno()),
            _ => None,
        }
    }
}

fn describe_expect(expect: Expect) -> String {
    match expect {
        Expect::Value(v) => format!("value {v}"),
        other => format!("{other:?}").to_lowercase(),
    }
}

fn satisfies(expect: Expect, observed: &Observed, op: &str) -> bool {
    match (expect, observed) {
        (Expect::Ok, Observed::Ok) => true,
        (Expect::Ok, Observed::Value(_) | Observed::Unset) => op == "get",
        (Expect::Value(want), Observed::Value(got)) => want == *got,
        (Expect::Unset, Observed::Unset) => true,
        (Expect::Einval, Observed::Failed(e)) => e.errno() == libc::EINVAL,
        (Expect::Enomem, Observed::Failed(e)) => e.errno() == libc::ENOMEM,
        (Expect::Eagain, Observed::Failed(e)) => e.errno() == libc::EAGAIN,
        _ => false,
    }
}

struct Runner {
    mgr: KeyManager<ManualThreads>,
    keys: HashMap<String, KeyId>,
    threads: HashMap<String, ThreadId>,
}

impl Runner {
    fn thread(&mut self, name: &str) -> ThreadId {
        let next = ThreadId(self.threads.len() as u32 + 1);
        let tid = *self.threads.entry(name.to_string()).or_insert(next);
        self.mgr.context().switch_to(tid);
        tid
    }

    fn key(&self, step: usize, name: &str) -> Result<KeyId, ScenarioError> {
        self.keys
            .get(name)
            .copied()
            .ok_or_else(|| ScenarioError::UnknownKey {
                step,
                name: name.to_string(),
            })
    }

    /// Execute one step; returns the observation plus the thread and key it
    /// touched, for logging.
    fn execute(
        &mut self,
        idx: usize,
        step: &Step,
    ) -> Result<(Observed, Option<ThreadId>, Option<KeyId>), ScenarioError> {
        let result = match step {
            Step::Create {
                key, destructor, ..
            } => {
                let dtor: Option<Destructor> = match destructor {
                    DestructorKind::None => None,
                    DestructorKind::Record => Some(record_destructor),
                };
                match self.mgr.key_create(dtor) {
                    Ok(id) => {
                        self.keys.insert(key.clone(), id);
                        (Observed::Ok, None, Some(id))
                    }
                    Err(err) => (Observed::Failed(err), None, None),
                }
            }
            Step::Set {
                thread, key, value, ..
            } => {
                let key = self.key(idx, key)?;
                let tid = self.thread(thread);
                let observed = match self.mgr.setspecific(key, *value) {
                    Ok(()) => Observed::Ok,
                    Err(err) => Observed::Failed(err),
                };
                (observed, Some(tid), Some(key))
            }
            Step::Get { thread, key, .. } => {
                let key = self.key(idx, key)?;
                let tid = self.thread(thread);
                let observed = match self.mgr.getspecific(key) {
                    Ok(Some(v)) => Observed::Value(v),
                    Ok(None) => Observed::Unset,
                    Err(err) => Observed::Failed(err),
                };
                (observed, Some(tid), Some(key))
            }
            Step::Delete { key, .. } => {
                let key = self.key(idx, key)?;
                let observed = match self.mgr.key_delete(key) {
                    Ok(()) => Observed::Ok,
                    Err(err) => Observed::Failed(err),
                };
                (observed, None, Some(key))
            }
            Step::Exit { thread, .. } => {
                let tid = self.thread(thread);
                take_recorded();
                self.mgr.exit_current_thread();
                (Observed::Destructors(take_recorded()), Some(tid), None)
            }
            Step::Check => {
                let observed = match self.mgr.check_invariants() {
                    Ok(()) => Observed::Ok,
                    Err(v) => Observed::Broken(v.to_string()),
                };
                (observed, None, None)
            }
        };
        Ok(result)
    }
}

fn verdict(step: &Step, observed: &Observed) -> (bool, String) {
    match step {
        Step::Create { expect, .. }
        | Step::Set { expect, .. }
        | Step::Get { expect, .. }
        | Step::Delete { expect, .. } => {
            (satisfies(*expect, observed, step.op()), describe_expect(*expect))
        }
        Step::Exit { destructors, .. } => match (destructors, observed) {
            (Some(want), Observed::Destructors(got)) => {
                (want == got, format!("destructors {want:?}"))
            }
            (None, _) => (true, "any".into()),
            (Some(want), _) => (false, format!("destructors {want:?}")),
        },
        Step::Check => (*observed == Observed::Ok, "ok".into()),
    }
}

/// Replay `scenario` against a fresh manager, logging one JSONL record per
/// step. Step failures are reported, not returned as errors; `Err` means the
/// scenario itself is malformed or the log sink failed.
pub fn run_scenario<W: Write>(
    scenario: &Scenario,
    log: &mut LogEmitter<W>,
) -> Result<ScenarioReport, ScenarioError> {
    let mgr = KeyManager::with_context(scenario.config, ManualThreads::default())?;
    let mut runner = Runner {
        mgr,
        keys: HashMap::new(),
        threads: HashMap::new(),
    };
    take_recorded();

    log.emit_entry(
        LogEntry::new("", LogLevel::Info, "scenario_start").with_details(serde_json::json!({
            "scenario": scenario.name,
            "config": scenario.config,
            "steps": scenario.steps.len(),
        })),
    )?;

    let mut reports = Vec::with_capacity(scenario.steps.len());
    let mut destructor_calls = Vec::new();
    for (idx, step) in scenario.steps.iter().enumerate() {
        let started = Instant::now();
        let (observed, thread, key) = runner.execute(idx, step)?;
        let latency_ns = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);
        if let Observed::Destructors(values) = &observed {
            destructor_calls.extend_from_slice(values);
        }

        let (ok, expected) = verdict(step, &observed);
        let outcome = if ok { Outcome::Pass } else { Outcome::Fail };
        let level = if ok { LogLevel::Debug } else { LogLevel::Error };
        let mut entry = LogEntry::new("", level, "step")
            .with_step(idx, step.op())
            .with_outcome(outcome)
            .with_latency_ns(latency_ns)
            .with_details(serde_json::json!({
                "expected": expected,
                "observed": observed.describe(),
            }));
        if let Some(tid) = thread {
            entry = entry.with_thread(tid.as_u32());
        }
        if let Some(key) = key {
            entry = entry.with_key(key.as_raw());
        }
        if let Some(errno) = observed.errno() {
            entry = entry.with_errno(errno);
        }
        log.emit_entry(entry)?;

        reports.push(StepReport {
            step: idx,
            op: step.op(),
            outcome,
            expected,
            observed: observed.describe(),
        });
    }

    let report = ScenarioReport {
        name: scenario.name.clone(),
        steps: reports,
        destructor_calls,
        stats: runner.mgr.stats(),
    };
    let level = if report.passed() {
        LogLevel::Info
    } else {
        LogLevel::Warn
    };
    log.emit_entry(
        LogEntry::new("", level, "scenario_end").with_details(serde_json::json!({
            "scenario": report.name,
            "failures": report.failures(),
            "stats": report.stats,
        })),
    )?;
    log.flush()?;
    Ok(report)
}
