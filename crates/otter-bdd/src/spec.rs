//! Specs and the context handed to their blocks

use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use serde::Serialize;

use crate::block::{Action, Block, Done};
use crate::clock::Clock;
use crate::env::Env;
use crate::error::{Error, Result};
use crate::queue::{Completion, Queue, Step};
use crate::reporter::Reporter;
use crate::results::{ExpectationResult, Failure, NestedResults};
use crate::suite::SuiteId;

/// Index of a spec in its [`Env`]; assigned sequentially from zero
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SpecId(pub usize);

impl fmt::Display for SpecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Read-only view of a spec, handed to reporters and filters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpecInfo {
    pub id: SpecId,
    pub description: String,
    pub full_name: String,
    pub suite: SuiteId,
}

pub(crate) struct SpecNode {
    pub(crate) description: String,
    pub(crate) suite: SuiteId,
    /// Steps declared before the spec runs
    pub(crate) blocks: Vec<Step>,
    /// Registered with `after`, most recent first
    pub(crate) after_callbacks: Vec<Action>,
    pub(crate) queue: Queue,
    pub(crate) results: NestedResults,
    /// Restore closures from spies and fake clocks, in registration order
    pub(crate) mocks: Vec<Box<dyn FnOnce()>>,
    spied: HashSet<usize>,
}

impl SpecNode {
    pub(crate) fn new(description: &str, suite: SuiteId) -> Self {
        Self {
            description: description.to_string(),
            suite,
            blocks: Vec::new(),
            after_callbacks: Vec::new(),
            queue: Queue::new(),
            results: NestedResults::new(description),
            mocks: Vec::new(),
            spied: HashSet::new(),
        }
    }

    pub(crate) fn clear_spied(&mut self) {
        self.spied.clear();
    }
}

/// Run one spec: hooks and blocks in order, then mock restoration and the
/// end report.
pub(crate) fn execute(env: &Env, id: SpecId, done: Completion) {
    let info = env.spec_info_unchecked(id);
    env.with_spec_mut(id, |spec| spec.results = NestedResults::new(&spec.description));

    if !env.spec_allowed(&info) {
        tracing::trace!(spec = %info.full_name, "skipping spec");
        env.with_spec_mut(id, |spec| spec.results.skipped = true);
        finish(env, &info);
        done.complete();
        return;
    }

    tracing::debug!(spec = %info.full_name, "spec starting");
    env.reporter().on_spec_start(&info);
    env.set_current_spec(Some(id));

    let queue = assemble_queue(env, id);
    queue.start(env, move |env| {
        finish(env, &info);
        done.complete();
    });
}

/// Rebuild the spec's queue: runner befores, suite befores outermost first,
/// the spec's own blocks, then ensured afters (spec `after` callbacks,
/// suite afters innermost first, runner afters).
fn assemble_queue(env: &Env, id: SpecId) -> Queue {
    let (queue, blocks, befores, afters) = {
        let tree = env.tree();
        let spec = &tree.specs[id.0];
        let chain = tree.ancestors(spec.suite);

        let mut befores = tree.runner.before.clone();
        for suite in chain.iter().rev() {
            befores.extend(tree.suites[suite.0].before.iter().cloned());
        }

        let mut afters = spec.after_callbacks.clone();
        for suite in &chain {
            afters.extend(tree.suites[suite.0].after.iter().rev().cloned());
        }
        afters.extend(tree.runner.after.iter().rev().cloned());

        (spec.queue.clone(), spec.blocks.clone(), befores, afters)
    };

    queue.clear();
    for hook in befores {
        queue.add(Step::Run(Block::new(id, hook)), false);
    }
    for step in blocks {
        queue.add(step, false);
    }
    for hook in afters {
        queue.add(Step::Run(Block::new(id, hook)), true);
    }
    queue
}

fn finish(env: &Env, info: &SpecInfo) {
    let mocks = env.with_spec_mut(info.id, |spec| {
        spec.clear_spied();
        std::mem::take(&mut spec.mocks)
    });
    for restore in mocks.into_iter().rev() {
        restore();
    }
    if env.current_spec() == Some(info.id) {
        env.set_current_spec(None);
    }

    let results = env.spec_results_unchecked(info.id);
    tracing::debug!(
        spec = %info.full_name,
        passed = results.passed_count,
        failed = results.failed_count,
        skipped = results.skipped,
        "spec finished"
    );
    env.reporter().on_spec_end(info, &results);
}

/// Handle given to every block of a running spec
#[derive(Clone)]
pub struct SpecContext {
    env: Env,
    spec: SpecId,
}

impl SpecContext {
    pub(crate) fn new(env: Env, spec: SpecId) -> Self {
        Self { env, spec }
    }

    pub fn id(&self) -> SpecId {
        self.spec
    }

    pub fn env(&self) -> &Env {
        &self.env
    }

    pub fn clock(&self) -> &Clock {
        self.env.clock()
    }

    pub fn description(&self) -> String {
        self.env.spec_info_unchecked(self.spec).description
    }

    pub fn full_name(&self) -> String {
        self.env.spec_info_unchecked(self.spec).full_name
    }

    /// Record an expectation result.
    pub fn add_result(&self, result: ExpectationResult) {
        self.env
            .with_spec_mut(self.spec, |spec| spec.results.add_expectation(result));
    }

    /// Record a passing or failing assertion.
    pub fn check(&self, passed: bool, message: impl Into<String>) {
        let message = message.into();
        if passed {
            self.add_result(ExpectationResult::passed(message));
        } else {
            self.add_result(Failure::assertion(message).into());
        }
    }

    /// Record a failure without stopping the block.
    pub fn fail(&self, failure: impl Into<Failure>) {
        self.env.record_failure(self.spec, failure.into());
    }

    pub fn log(&self, message: impl Into<String>) {
        let message = message.into();
        self.env.reporter().on_log(&message);
        self.env
            .with_spec_mut(self.spec, |spec| spec.results.log(message));
    }

    /// Queue a synchronous block right after the current one.
    pub fn runs<F>(&self, f: F)
    where
        F: Fn(&SpecContext) -> anyhow::Result<()> + 'static,
    {
        self.add_step(Step::Run(Block::new(self.spec, Action::sync(f))));
    }

    /// Queue an async block right after the current one.
    pub fn runs_async<F>(&self, f: F, timeout: Option<Duration>)
    where
        F: Fn(&SpecContext, Done) -> anyhow::Result<()> + 'static,
    {
        self.add_step(Step::Run(
            Block::new(self.spec, Action::with_done(f)).with_timeout(timeout),
        ));
    }

    pub fn waits(&self, duration: Duration) {
        self.add_step(Step::Sleep(crate::waits::WaitsBlock::new(self.spec, duration)));
    }

    /// Queue a latch poll. On timeout the spec fails and its remaining
    /// non-cleanup steps are skipped.
    pub fn waits_for<F>(&self, latch: F, message: Option<&str>, timeout: Option<Duration>)
    where
        F: Fn(&SpecContext) -> anyhow::Result<bool> + 'static,
    {
        self.add_step(Step::PollUntil(crate::waits::WaitsForBlock::new(
            self.spec,
            latch,
            message.map(str::to_string),
            timeout,
        )));
    }

    fn add_step(&self, step: Step) {
        let queue = self.env.with_spec_mut(self.spec, |spec| {
            if spec.queue.is_running() {
                Some(spec.queue.clone())
            } else {
                spec.blocks.push(step.clone());
                None
            }
        });
        if let Some(queue) = queue {
            queue.insert_next(step, false);
        }
    }

    /// Register a cleanup block. It runs after the spec's blocks even when
    /// the spec aborted, before any earlier-registered cleanup.
    pub fn after<F>(&self, f: F)
    where
        F: Fn(&SpecContext) -> anyhow::Result<()> + 'static,
    {
        let action = Action::sync(f);
        let queue = self.env.with_spec_mut(self.spec, |spec| {
            if spec.queue.is_running() {
                Some(spec.queue.clone())
            } else {
                spec.after_callbacks.insert(0, action.clone());
                None
            }
        });
        if let Some(queue) = queue {
            queue.insert_cleanup(Step::Run(Block::new(self.spec, action)));
        }
    }

    /// Replace the value in `slot` until the spec finishes.
    pub fn spy_on<T: 'static>(&self, slot: &Rc<RefCell<T>>, replacement: T) -> Result<()> {
        let key = Rc::as_ptr(slot) as *const () as usize;
        let fresh = self
            .env
            .with_spec_mut(self.spec, |spec| spec.spied.insert(key));
        if !fresh {
            return Err(Error::AlreadySpied);
        }
        let original = std::mem::replace(&mut *slot.borrow_mut(), replacement);
        let slot = Rc::clone(slot);
        self.defer_restore(move || {
            *slot.borrow_mut() = original;
        });
        Ok(())
    }

    /// Run `restore` when the spec finishes. Restores run in reverse
    /// registration order.
    pub fn defer_restore(&self, restore: impl FnOnce() + 'static) {
        self.env
            .with_spec_mut(self.spec, |spec| spec.mocks.push(Box::new(restore)));
    }

    /// Switch the environment to the fake clock from virtual time zero. The
    /// real clock comes back in a cleanup block once the spec is done.
    pub fn use_fake_clock(&self) {
        let clock = self.clock();
        if clock.is_installed() {
            return;
        }
        clock.fake_timer().reset();
        clock.install_mock();
        self.after(|ctx| {
            if ctx.clock().is_installed() {
                ctx.clock().uninstall_mock()?;
            }
            Ok(())
        });
    }
}

impl fmt::Debug for SpecContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpecContext").field("spec", &self.spec).finish()
    }
}
