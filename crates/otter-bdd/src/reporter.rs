//! Reporters observe a run: start and end of the run, suites and specs,
//! and log lines.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

use serde::Serialize;

use crate::results::NestedResults;
use crate::spec::{SpecId, SpecInfo};
use crate::suite::SuiteInfo;

/// Run observer. Every method defaults to doing nothing.
pub trait Reporter {
    fn on_run_start(&self, _tree: &[Summary]) {}
    fn on_run_end(&self, _results: &NestedResults) {}
    fn on_suite_start(&self, _suite: &SuiteInfo) {}
    fn on_suite_end(&self, _suite: &SuiteInfo, _results: &NestedResults) {}
    fn on_spec_start(&self, _spec: &SpecInfo) {}
    fn on_spec_end(&self, _spec: &SpecInfo, _results: &NestedResults) {}
    fn on_log(&self, _message: &str) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Suite,
    Spec,
}

/// Declared tree node, as handed to [`Reporter::on_run_start`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub id: usize,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    pub children: Vec<Summary>,
}

/// Fans every callback out to its reporters, in the order they were added
#[derive(Clone, Default)]
pub struct MultiReporter {
    reporters: Vec<Rc<dyn Reporter>>,
}

impl MultiReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, reporter: Rc<dyn Reporter>) {
        self.reporters.push(reporter);
    }

    pub fn len(&self) -> usize {
        self.reporters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reporters.is_empty()
    }
}

impl Reporter for MultiReporter {
    fn on_run_start(&self, tree: &[Summary]) {
        for reporter in &self.reporters {
            reporter.on_run_start(tree);
        }
    }

    fn on_run_end(&self, results: &NestedResults) {
        for reporter in &self.reporters {
            reporter.on_run_end(results);
        }
    }

    fn on_suite_start(&self, suite: &SuiteInfo) {
        for reporter in &self.reporters {
            reporter.on_suite_start(suite);
        }
    }

    fn on_suite_end(&self, suite: &SuiteInfo, results: &NestedResults) {
        for reporter in &self.reporters {
            reporter.on_suite_end(suite, results);
        }
    }

    fn on_spec_start(&self, spec: &SpecInfo) {
        for reporter in &self.reporters {
            reporter.on_spec_start(spec);
        }
    }

    fn on_spec_end(&self, spec: &SpecInfo, results: &NestedResults) {
        for reporter in &self.reporters {
            reporter.on_spec_end(spec, results);
        }
    }

    fn on_log(&self, message: &str) {
        for reporter in &self.reporters {
            reporter.on_log(message);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecStatus {
    Passed,
    Failed,
    Skipped,
}

impl SpecStatus {
    pub fn of(results: &NestedResults) -> Self {
        if results.skipped {
            Self::Skipped
        } else if results.passed() {
            Self::Passed
        } else {
            Self::Failed
        }
    }
}

/// Per-spec record kept by [`ApiReporter`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpecReport {
    pub result: SpecStatus,
    pub messages: Vec<String>,
}

/// Collects results for programmatic access after (or during) a run
#[derive(Default)]
pub struct ApiReporter {
    started: Cell<bool>,
    finished: Cell<bool>,
    suites: RefCell<Vec<Summary>>,
    results: RefCell<BTreeMap<SpecId, SpecReport>>,
}

impl ApiReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn started(&self) -> bool {
        self.started.get()
    }

    pub fn finished(&self) -> bool {
        self.finished.get()
    }

    pub fn suites(&self) -> Vec<Summary> {
        self.suites.borrow().clone()
    }

    pub fn results_for_spec(&self, id: SpecId) -> Option<SpecReport> {
        self.results.borrow().get(&id).cloned()
    }

    /// Reports for the given ids; ids without a report are left out.
    pub fn results_for_specs(&self, ids: &[SpecId]) -> BTreeMap<SpecId, SpecReport> {
        let results = self.results.borrow();
        ids.iter()
            .filter_map(|id| results.get(id).map(|report| (*id, report.clone())))
            .collect()
    }

    /// Every collected report as a JSON object keyed by spec id
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&*self.results.borrow())
    }
}

impl Reporter for ApiReporter {
    fn on_run_start(&self, tree: &[Summary]) {
        self.started.set(true);
        self.finished.set(false);
        *self.suites.borrow_mut() = tree.to_vec();
    }

    fn on_run_end(&self, _results: &NestedResults) {
        self.finished.set(true);
    }

    fn on_spec_end(&self, spec: &SpecInfo, results: &NestedResults) {
        let messages = results
            .expectations()
            .map(|result| result.message.clone())
            .collect();
        self.results.borrow_mut().insert(
            spec.id,
            SpecReport {
                result: SpecStatus::of(results),
                messages,
            },
        );
    }
}

/// Writes the run to `tracing`: specs and suites at debug, failures at
/// warn, the run summary at info
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn on_run_start(&self, tree: &[Summary]) {
        tracing::info!(suites = tree.len(), "run started");
    }

    fn on_run_end(&self, results: &NestedResults) {
        tracing::info!(
            total = results.total_count,
            passed = results.passed_count,
            failed = results.failed_count,
            "run finished"
        );
    }

    fn on_suite_start(&self, suite: &SuiteInfo) {
        tracing::debug!(suite = %suite.full_name, "suite started");
    }

    fn on_suite_end(&self, suite: &SuiteInfo, results: &NestedResults) {
        tracing::debug!(
            suite = %suite.full_name,
            passed = results.passed_count,
            failed = results.failed_count,
            "suite finished"
        );
    }

    fn on_spec_start(&self, spec: &SpecInfo) {
        tracing::debug!(spec = %spec.full_name, "spec started");
    }

    fn on_spec_end(&self, spec: &SpecInfo, results: &NestedResults) {
        match SpecStatus::of(results) {
            SpecStatus::Failed => {
                for failure in results.failures() {
                    tracing::warn!(spec = %spec.full_name, "{}", failure.message);
                }
            }
            status => tracing::debug!(spec = %spec.full_name, ?status, "spec finished"),
        }
    }

    fn on_log(&self, message: &str) {
        tracing::info!("{message}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::{ExpectationResult, FailureKind};
    use crate::suite::SuiteId;

    #[derive(Default)]
    struct Recording {
        events: RefCell<Vec<String>>,
    }

    impl Reporter for Recording {
        fn on_log(&self, message: &str) {
            self.events.borrow_mut().push(message.to_string());
        }
    }

    fn spec_info(id: usize) -> SpecInfo {
        SpecInfo {
            id: SpecId(id),
            description: format!("spec {id}"),
            full_name: format!("suite spec {id}."),
            suite: SuiteId(0),
        }
    }

    #[test]
    fn test_multi_reporter_fans_out_in_order() {
        let first = Rc::new(Recording::default());
        let second = Rc::new(Recording::default());
        let mut multi = MultiReporter::new();
        multi.add(first.clone());
        multi.add(second.clone());

        multi.on_log("hello");
        multi.on_spec_start(&spec_info(0));

        assert_eq!(*first.events.borrow(), vec!["hello"]);
        assert_eq!(*second.events.borrow(), vec!["hello"]);
        assert_eq!(multi.len(), 2);
    }

    #[test]
    fn test_api_reporter_collects_status_and_messages() {
        let api = ApiReporter::new();
        api.on_run_start(&[]);
        assert!(api.started());
        assert!(!api.finished());

        let mut passing = NestedResults::new("spec 0");
        passing.add_expectation(ExpectationResult::passed("fine"));
        api.on_spec_end(&spec_info(0), &passing);

        let mut failing = NestedResults::new("spec 1");
        failing.add_expectation(ExpectationResult::failed(FailureKind::Assertion, "bad"));
        api.on_spec_end(&spec_info(1), &failing);

        let mut skipped = NestedResults::new("spec 2");
        skipped.skipped = true;
        api.on_spec_end(&spec_info(2), &skipped);

        api.on_run_end(&NestedResults::default());
        assert!(api.finished());

        assert_eq!(api.results_for_spec(SpecId(0)).unwrap().result, SpecStatus::Passed);
        assert_eq!(api.results_for_spec(SpecId(1)).unwrap().messages, vec!["bad"]);
        let picked = api.results_for_specs(&[SpecId(2), SpecId(7)]);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[&SpecId(2)].result, SpecStatus::Skipped);

        let json: serde_json::Value = serde_json::from_str(&api.to_json().unwrap()).unwrap();
        assert_eq!(json["1"]["result"], "failed");
    }
}
