//! Top-level runner: owns the root hooks and the queue of top-level suites

use std::collections::HashSet;

use crate::block::Action;
use crate::env::{Env, Tree};
use crate::error::{Error, Result};
use crate::queue::{Queue, Step};
use crate::reporter::Reporter;
use crate::results::NestedResults;
use crate::spec::SpecId;
use crate::suite::{self, SuiteId};

#[derive(Default)]
pub(crate) struct RunnerNode {
    pub(crate) before: Vec<Action>,
    pub(crate) after: Vec<Action>,
    /// Declaration order
    pub(crate) top_level: Vec<SuiteId>,
    pub(crate) queue: Queue,
}

impl RunnerNode {
    pub(crate) fn add_suite(&mut self, id: SuiteId) {
        self.top_level.push(id);
        self.queue.add(Step::Suite(id), false);
    }
}

pub(crate) fn execute(env: &Env) {
    if env.is_halted() {
        reset_after_halt(env);
    }
    let queue = env.tree().runner.queue.clone();
    if queue.is_running() {
        tracing::warn!("runner is already executing");
        return;
    }
    env.reset_run_state();

    let summary = env.summarize();
    tracing::debug!(suites = queue.len(), "run starting");
    env.reporter().on_run_start(&summary);
    queue.start(env, |env| {
        env.mark_finished();
        let results = env.results();
        tracing::debug!(
            total = results.total_count,
            passed = results.passed_count,
            failed = results.failed_count,
            "run finished"
        );
        env.reporter().on_run_end(&results);
    });
}

/// A halted run leaves every queue on its path marked running, the halted
/// spec's spies in place and, when a spec had switched to it, the fake clock
/// installed.
fn reset_after_halt(env: &Env) {
    tracing::debug!("clearing state left by a halted run");
    let mut restores = Vec::new();
    {
        let mut tree = env.tree_mut();
        tree.runner.queue.reset();
        for suite in &tree.suites {
            suite.queue.reset();
        }
        for spec in &mut tree.specs {
            spec.queue.reset();
            spec.clear_spied();
            restores.extend(std::mem::take(&mut spec.mocks).into_iter().rev());
        }
    }
    for restore in restores {
        restore();
    }
    if env.clock().is_installed() && env.clock().uninstall_mock().is_err() {
        tracing::warn!("fake clock could not be uninstalled after a halted run");
    }
}

pub(crate) fn results(tree: &Tree) -> NestedResults {
    let mut results = NestedResults::default();
    for step in tree.runner.queue.steps() {
        if let Step::Suite(id) = *step {
            results.add_nested(suite::results(tree, id));
        }
    }
    results
}

/// Restrict the next run to the given suites and specs. Only the top-level
/// suites containing a selection stay queued, in declaration order.
pub(crate) fn filter(tree: &mut Tree, suite_ids: &[SuiteId], spec_ids: &[SpecId]) -> Result<()> {
    for id in suite_ids {
        if id.0 >= tree.suites.len() {
            return Err(Error::UnknownSuite(*id));
        }
    }
    for id in spec_ids {
        if id.0 >= tree.specs.len() {
            return Err(Error::UnknownSpec(*id));
        }
    }

    let mut roots = HashSet::new();
    for id in spec_ids {
        roots.insert(tree.root_of(tree.specs[id.0].suite));
    }
    for id in suite_ids {
        roots.insert(tree.root_of(*id));
    }

    let suite_set: HashSet<SuiteId> = suite_ids.iter().copied().collect();
    let spec_set: HashSet<SpecId> = spec_ids.iter().copied().collect();
    for root in &roots {
        suite::filter(tree, *root, &suite_set, &spec_set);
    }

    if roots.is_empty() {
        return Ok(());
    }
    tracing::debug!(roots = roots.len(), "filtering run");
    tree.runner.queue.retain(|step| match *step {
        Step::Suite(id) => roots.contains(&id),
        _ => false,
    });
    Ok(())
}
