//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use otter_bdd::{Env, EnvConfig, NestedResults, Reporter, SpecInfo, SuiteInfo, Summary};
use tracing_subscriber::filter::EnvFilter;

/// Route scheduler logs to the test output when RUST_LOG is set.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Environment that never yields to the host loop mid-run, so sync runs
/// finish inside `execute`.
pub fn env() -> Env {
    init_tracing();
    Env::new(EnvConfig {
        update_interval_ms: 0,
        ..EnvConfig::default()
    })
}

pub fn env_with(config: EnvConfig) -> Env {
    init_tracing();
    Env::new(config)
}

pub type Log = Rc<RefCell<Vec<String>>>;

pub fn log() -> Log {
    Rc::new(RefCell::new(Vec::new()))
}

pub fn entries(log: &Log) -> Vec<String> {
    log.borrow().clone()
}

/// Reporter recording every callback as a short line
#[derive(Default)]
pub struct Recorder {
    pub events: RefCell<Vec<String>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<String> {
        self.events.borrow().clone()
    }

    fn push(&self, event: String) {
        self.events.borrow_mut().push(event);
    }
}

impl Reporter for Recorder {
    fn on_run_start(&self, tree: &[Summary]) {
        self.push(format!("run start ({} suites)", tree.len()));
    }

    fn on_run_end(&self, results: &NestedResults) {
        self.push(format!(
            "run end {}/{}",
            results.passed_count, results.total_count
        ));
    }

    fn on_suite_start(&self, suite: &SuiteInfo) {
        self.push(format!("suite start {}", suite.full_name));
    }

    fn on_suite_end(&self, suite: &SuiteInfo, _results: &NestedResults) {
        self.push(format!("suite end {}", suite.full_name));
    }

    fn on_spec_start(&self, spec: &SpecInfo) {
        self.push(format!("spec start {}", spec.full_name));
    }

    fn on_spec_end(&self, spec: &SpecInfo, results: &NestedResults) {
        let status = if results.skipped {
            "skipped"
        } else if results.passed() {
            "passed"
        } else {
            "failed"
        };
        self.push(format!("spec end {} {status}", spec.full_name));
    }

    fn on_log(&self, message: &str) {
        self.push(format!("log {message}"));
    }
}
