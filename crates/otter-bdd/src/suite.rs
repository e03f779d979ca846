//! Suites: named groups of specs and nested suites with shared hooks

use std::collections::HashSet;
use std::fmt;

use serde::Serialize;

use crate::block::Action;
use crate::env::{Env, Tree};
use crate::queue::{Completion, Queue, Step};
use crate::reporter::Reporter;
use crate::results::NestedResults;
use crate::spec::SpecId;

/// Index of a suite in its [`Env`]; assigned sequentially from zero
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SuiteId(pub usize);

impl fmt::Display for SuiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Read-only view of a suite, handed to reporters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SuiteInfo {
    pub id: SuiteId,
    pub description: String,
    pub full_name: String,
    pub parent: Option<SuiteId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Child {
    Suite(SuiteId),
    Spec(SpecId),
}

impl Child {
    fn step(self) -> Step {
        match self {
            Child::Suite(id) => Step::Suite(id),
            Child::Spec(id) => Step::Spec(id),
        }
    }
}

pub(crate) struct SuiteNode {
    pub(crate) description: String,
    pub(crate) parent: Option<SuiteId>,
    pub(crate) before: Vec<Action>,
    pub(crate) after: Vec<Action>,
    /// Declaration order; unaffected by filtering
    pub(crate) children: Vec<Child>,
    pub(crate) queue: Queue,
    /// Nothing left to run after filtering
    pub(crate) empty: bool,
    pub(crate) finished: bool,
}

impl SuiteNode {
    pub(crate) fn new(description: &str, parent: Option<SuiteId>) -> Self {
        Self {
            description: description.to_string(),
            parent,
            before: Vec::new(),
            after: Vec::new(),
            children: Vec::new(),
            queue: Queue::new(),
            empty: false,
            finished: false,
        }
    }

    pub(crate) fn add_child(&mut self, child: Child) {
        self.children.push(child);
        self.queue.add(child.step(), false);
    }
}

pub(crate) fn execute(env: &Env, id: SuiteId, done: Completion) {
    let info = env.suite_info_unchecked(id);
    let queue = env.tree().suites[id.0].queue.clone();

    tracing::debug!(suite = %info.full_name, steps = queue.len(), "suite starting");
    env.reporter().on_suite_start(&info);
    queue.start(env, move |env| {
        let results = env.suite_results_unchecked(id);
        env.tree_mut().suites[id.0].finished = true;
        tracing::debug!(
            suite = %info.full_name,
            passed = results.passed_count,
            failed = results.failed_count,
            "suite finished"
        );
        env.reporter().on_suite_end(&info, &results);
        done.complete();
    });
}

/// Aggregate results of whatever is still queued in the suite.
pub(crate) fn results(tree: &Tree, id: SuiteId) -> NestedResults {
    let suite = &tree.suites[id.0];
    let mut results = NestedResults::new(&suite.description);
    for step in suite.queue.steps() {
        match *step {
            Step::Spec(spec) => results.add_nested(tree.specs[spec.0].results.clone()),
            Step::Suite(child) => results.add_nested(self::results(tree, child)),
            _ => {}
        }
    }
    results
}

/// Prune the suite's queue down to the selected specs and the suites that
/// still contain some. A selected suite is kept whole.
pub(crate) fn filter(
    tree: &mut Tree,
    id: SuiteId,
    suite_ids: &HashSet<SuiteId>,
    spec_ids: &HashSet<SpecId>,
) {
    if suite_ids.contains(&id) {
        return;
    }

    let children = tree.suites[id.0].children.clone();
    let mut keep = HashSet::new();
    for child in children {
        match child {
            Child::Spec(spec) => {
                if spec_ids.contains(&spec) {
                    keep.insert(child);
                }
            }
            Child::Suite(suite) => {
                filter(tree, suite, suite_ids, spec_ids);
                if !tree.suites[suite.0].empty {
                    keep.insert(child);
                }
            }
        }
    }

    let suite = &mut tree.suites[id.0];
    suite.queue.retain(|step| match *step {
        Step::Spec(spec) => keep.contains(&Child::Spec(spec)),
        Step::Suite(child) => keep.contains(&Child::Suite(child)),
        _ => true,
    });
    suite.empty = suite.queue.is_empty();
}
