//! Environment: declaration API, the suite/spec arena and run control
//!
//! An [`Env`] is a cheap handle; clones share one environment. Suites and
//! specs live in an arena owned by the environment and are addressed by
//! [`SuiteId`] and [`SpecId`]. Parent links are ids, never references.

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use crate::block::{Action, Block, Done};
use crate::clock::Clock;
use crate::config::EnvConfig;
use crate::error::{Error, Result};
use crate::event_loop::EventLoop;
use crate::queue::{Pace, Step};
use crate::reporter::{MultiReporter, NodeKind, Reporter, Summary};
use crate::results::{Failure, FailureKind, NestedResults};
use crate::runner::{self, RunnerNode};
use crate::spec::{SpecContext, SpecId, SpecInfo, SpecNode};
use crate::suite::{self, Child, SuiteId, SuiteInfo, SuiteNode};

const DECLARATION_EXCEPTION: &str = "encountered a declaration exception";

type SpecFilter = Rc<dyn Fn(&SpecInfo) -> bool>;

/// Arena of everything declared in an environment
#[derive(Default)]
pub(crate) struct Tree {
    pub(crate) suites: Vec<SuiteNode>,
    pub(crate) specs: Vec<SpecNode>,
    pub(crate) runner: RunnerNode,
}

impl Tree {
    /// `suite` and its ancestors, innermost first
    pub(crate) fn ancestors(&self, suite: SuiteId) -> Vec<SuiteId> {
        let mut chain = vec![suite];
        let mut current = self.suites[suite.0].parent;
        while let Some(parent) = current {
            chain.push(parent);
            current = self.suites[parent.0].parent;
        }
        chain
    }

    pub(crate) fn root_of(&self, suite: SuiteId) -> SuiteId {
        self.ancestors(suite).last().copied().unwrap_or(suite)
    }

    fn suite_full_name(&self, suite: SuiteId) -> String {
        let chain = self.ancestors(suite);
        chain
            .iter()
            .rev()
            .map(|id| self.suites[id.0].description.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn spec_full_name(&self, spec: SpecId) -> String {
        let node = &self.specs[spec.0];
        format!("{} {}.", self.suite_full_name(node.suite), node.description)
    }

    fn spec_info(&self, id: SpecId) -> SpecInfo {
        let node = &self.specs[id.0];
        SpecInfo {
            id,
            description: node.description.clone(),
            full_name: self.spec_full_name(id),
            suite: node.suite,
        }
    }

    fn suite_info(&self, id: SuiteId) -> SuiteInfo {
        let node = &self.suites[id.0];
        SuiteInfo {
            id,
            description: node.description.clone(),
            full_name: self.suite_full_name(id),
            parent: node.parent,
        }
    }

    fn summarize_suite(&self, id: SuiteId) -> Summary {
        let node = &self.suites[id.0];
        let children = node
            .children
            .iter()
            .map(|child| match *child {
                Child::Suite(suite) => self.summarize_suite(suite),
                Child::Spec(spec) => Summary {
                    id: spec.0,
                    name: self.specs[spec.0].description.clone(),
                    kind: NodeKind::Spec,
                    children: Vec::new(),
                },
            })
            .collect();
        Summary {
            id: id.0,
            name: node.description.clone(),
            kind: NodeKind::Suite,
            children,
        }
    }
}

struct EnvState {
    config: EnvConfig,
    clock: Clock,
    reporter: RefCell<MultiReporter>,
    tree: RefCell<Tree>,
    /// Suites whose bodies are being declared, innermost last
    declaring: RefCell<Vec<SuiteId>>,
    current_spec: Cell<Option<SpecId>>,
    spec_filter: RefCell<Option<SpecFilter>>,
    last_yield: Cell<Instant>,
    halted: RefCell<Option<String>>,
    finished: Cell<bool>,
}

/// Handle to a test environment
#[derive(Clone)]
pub struct Env {
    inner: Rc<EnvState>,
}

/// Non-owning handle held by timers and completions
#[derive(Clone)]
pub struct WeakEnv(Weak<EnvState>);

impl WeakEnv {
    pub fn upgrade(&self) -> Option<Env> {
        self.0.upgrade().map(|inner| Env { inner })
    }
}

impl Default for Env {
    fn default() -> Self {
        Self::new(EnvConfig::default())
    }
}

impl Env {
    pub fn new(config: EnvConfig) -> Self {
        Self::with_event_loop(config, EventLoop::new())
    }

    /// Build an environment that yields to (and schedules real timers on)
    /// an existing host loop.
    pub fn with_event_loop(config: EnvConfig, host: EventLoop) -> Self {
        Self {
            inner: Rc::new(EnvState {
                config,
                clock: Clock::new(host),
                reporter: RefCell::new(MultiReporter::new()),
                tree: RefCell::new(Tree::default()),
                declaring: RefCell::new(Vec::new()),
                current_spec: Cell::new(None),
                spec_filter: RefCell::new(None),
                last_yield: Cell::new(Instant::now()),
                halted: RefCell::new(None),
                finished: Cell::new(false),
            }),
        }
    }

    pub fn config(&self) -> &EnvConfig {
        &self.inner.config
    }

    pub fn clock(&self) -> &Clock {
        &self.inner.clock
    }

    /// The real-time loop the driver yields to
    pub fn host(&self) -> &EventLoop {
        self.inner.clock.host()
    }

    pub fn downgrade(&self) -> WeakEnv {
        WeakEnv(Rc::downgrade(&self.inner))
    }

    // Declaration

    /// Declare a suite. Errors and panics from `body` are caught: whatever
    /// was declared before the failure is kept and one failing spec is added
    /// to report it.
    pub fn describe<F>(&self, description: &str, body: F) -> SuiteId
    where
        F: FnOnce(&Env) -> anyhow::Result<()>,
    {
        let parent = self.declaring_suite();
        let id = {
            let mut tree = self.tree_mut();
            let id = SuiteId(tree.suites.len());
            tree.suites.push(SuiteNode::new(description, parent));
            match parent {
                Some(parent) => tree.suites[parent.0].add_child(Child::Suite(id)),
                None => tree.runner.add_suite(id),
            }
            id
        };
        tracing::trace!(suite = %id, description, "declaring suite");

        self.inner.declaring.borrow_mut().push(id);
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| body(self))) {
            Ok(result) => result.map_err(|err| Failure::from_error(&err)),
            Err(payload) => Err(Failure::from_panic(payload)),
        };
        if let Err(failure) = outcome {
            tracing::warn!(suite = %id, %failure, "suite declaration failed");
            let failure = Failure {
                kind: FailureKind::Declaration,
                ..failure
            };
            let spec = SpecId(self.tree().specs.len());
            let report = Action::sync(move |ctx| {
                ctx.fail(failure.clone());
                Ok(())
            });
            self.register_spec(
                id,
                DECLARATION_EXCEPTION,
                Some(Step::Run(Block::new(spec, report))),
            );
        }
        self.inner.declaring.borrow_mut().pop();
        id
    }

    /// Disabled suite: the body never runs and nothing is registered.
    pub fn xdescribe<F>(&self, description: &str, _body: F)
    where
        F: FnOnce(&Env) -> anyhow::Result<()>,
    {
        tracing::debug!(description, "suite disabled");
    }

    /// Declare a spec with a synchronous body in the current suite.
    pub fn it<F>(&self, description: &str, body: F) -> Result<SpecId>
    where
        F: Fn(&SpecContext) -> anyhow::Result<()> + 'static,
    {
        self.declare_spec(description, Action::sync(body), None)
    }

    /// Declare a spec whose body completes through [`Done`].
    pub fn it_async<F>(&self, description: &str, body: F, timeout: Option<Duration>) -> Result<SpecId>
    where
        F: Fn(&SpecContext, Done) -> anyhow::Result<()> + 'static,
    {
        self.declare_spec(description, Action::with_done(body), timeout)
    }

    /// Disabled spec: nothing is registered.
    pub fn xit<F>(&self, description: &str, _body: F)
    where
        F: Fn(&SpecContext) -> anyhow::Result<()> + 'static,
    {
        tracing::debug!(description, "spec disabled");
    }

    /// Declare a spec with no body; it passes with zero expectations.
    pub fn it_pending(&self, description: &str) -> Result<SpecId> {
        let suite = self.declaring_suite().ok_or(Error::NoEnclosingSuite("it"))?;
        Ok(self.register_spec(suite, description, None))
    }

    fn declare_spec(
        &self,
        description: &str,
        action: Action,
        timeout: Option<Duration>,
    ) -> Result<SpecId> {
        let suite = self.declaring_suite().ok_or(Error::NoEnclosingSuite("it"))?;
        let id = SpecId(self.tree().specs.len());
        let step = Step::Run(Block::new(id, action).with_timeout(timeout));
        Ok(self.register_spec(suite, description, Some(step)))
    }

    fn register_spec(&self, suite: SuiteId, description: &str, body: Option<Step>) -> SpecId {
        let mut tree = self.tree_mut();
        let id = SpecId(tree.specs.len());
        let mut node = SpecNode::new(description, suite);
        node.blocks.extend(body);
        tree.specs.push(node);
        tree.suites[suite.0].add_child(Child::Spec(id));
        tracing::trace!(spec = %id, suite = %suite, description, "declared spec");
        id
    }

    /// Run `hook` before every spec of the current suite (and its nested
    /// suites), or before every spec when declared at top level.
    pub fn before_each<F>(&self, hook: F)
    where
        F: Fn(&SpecContext) -> anyhow::Result<()> + 'static,
    {
        self.add_before_each(Action::sync(hook));
    }

    /// Run `hook` after every spec of the current suite, or after every spec
    /// when declared at top level. After hooks run even when the spec aborts.
    pub fn after_each<F>(&self, hook: F)
    where
        F: Fn(&SpecContext) -> anyhow::Result<()> + 'static,
    {
        self.add_after_each(Action::sync(hook));
    }

    pub fn add_before_each(&self, hook: Action) {
        let suite = self.declaring_suite();
        let mut tree = self.tree_mut();
        match suite {
            Some(suite) => tree.suites[suite.0].before.push(hook),
            None => tree.runner.before.push(hook),
        }
    }

    pub fn add_after_each(&self, hook: Action) {
        let suite = self.declaring_suite();
        let mut tree = self.tree_mut();
        match suite {
            Some(suite) => tree.suites[suite.0].after.push(hook),
            None => tree.runner.after.push(hook),
        }
    }

    /// Register a cleanup block on the running spec.
    pub fn after_spec<F>(&self, hook: F) -> Result<()>
    where
        F: Fn(&SpecContext) -> anyhow::Result<()> + 'static,
    {
        let spec = self.current_spec().ok_or(Error::NoRunningSpec)?;
        SpecContext::new(self.clone(), spec).after(hook);
        Ok(())
    }

    fn declaring_suite(&self) -> Option<SuiteId> {
        self.inner.declaring.borrow().last().copied()
    }

    // Reporting and filtering

    pub fn add_reporter(&self, reporter: Rc<dyn Reporter>) {
        self.inner.reporter.borrow_mut().add(reporter);
    }

    /// Skip every spec for which `filter` returns false. Skipped specs are
    /// still reported, with `skipped` set.
    pub fn set_spec_filter<F>(&self, filter: F)
    where
        F: Fn(&SpecInfo) -> bool + 'static,
    {
        *self.inner.spec_filter.borrow_mut() = Some(Rc::new(filter));
    }

    pub fn clear_spec_filter(&self) {
        *self.inner.spec_filter.borrow_mut() = None;
    }

    /// Prune the run down to the given suites and specs. Selected suites run
    /// whole; other suites keep only selected specs and non-empty children.
    pub fn filter(&self, suites: &[SuiteId], specs: &[SpecId]) -> Result<()> {
        runner::filter(&mut self.tree_mut(), suites, specs)
    }

    // Execution

    /// Start the runner. Returns once the run finishes or suspends on a timer.
    pub fn execute(&self) {
        runner::execute(self);
    }

    /// Execute and drive the host loop until it goes idle.
    pub fn run(&self) -> Result<NestedResults> {
        self.execute();
        self.host().run_until_complete();
        self.outcome()
    }

    /// Like [`Env::run`], driving the host loop from a tokio runtime.
    pub async fn run_async(&self) -> Result<NestedResults> {
        self.execute();
        self.host().run_until_complete_async().await;
        self.outcome()
    }

    fn outcome(&self) -> Result<NestedResults> {
        if let Some(message) = self.inner.halted.borrow().clone() {
            return Err(Error::Uncaught(message));
        }
        if !self.is_finished() {
            return Err(Error::Incomplete);
        }
        Ok(self.results())
    }

    pub fn is_finished(&self) -> bool {
        self.inner.finished.get()
    }

    pub fn is_halted(&self) -> bool {
        self.inner.halted.borrow().is_some()
    }

    /// The spec whose queue is running, if any
    pub fn current_spec(&self) -> Option<SpecId> {
        self.inner.current_spec.get()
    }

    // Inspection

    pub fn results(&self) -> NestedResults {
        runner::results(&self.tree())
    }

    pub fn suite_results(&self, id: SuiteId) -> Result<NestedResults> {
        self.check_suite(id)?;
        Ok(self.suite_results_unchecked(id))
    }

    pub fn spec_results(&self, id: SpecId) -> Result<NestedResults> {
        self.check_spec(id)?;
        Ok(self.spec_results_unchecked(id))
    }

    pub fn spec_info(&self, id: SpecId) -> Result<SpecInfo> {
        self.check_spec(id)?;
        Ok(self.spec_info_unchecked(id))
    }

    pub fn suite_info(&self, id: SuiteId) -> Result<SuiteInfo> {
        self.check_suite(id)?;
        Ok(self.suite_info_unchecked(id))
    }

    /// Whether the spec's last run was aborted
    pub fn spec_aborted(&self, id: SpecId) -> Result<bool> {
        self.check_spec(id)?;
        Ok(self.tree().specs[id.0].queue.is_aborted())
    }

    pub fn suite_finished(&self, id: SuiteId) -> Result<bool> {
        self.check_suite(id)?;
        Ok(self.tree().suites[id.0].finished)
    }

    /// Every declared spec, in declaration order
    pub fn specs(&self) -> Vec<SpecInfo> {
        let tree = self.tree();
        (0..tree.specs.len()).map(|i| tree.spec_info(SpecId(i))).collect()
    }

    /// Every declared suite, in declaration order
    pub fn suites(&self) -> Vec<SuiteInfo> {
        let tree = self.tree();
        (0..tree.suites.len())
            .map(|i| tree.suite_info(SuiteId(i)))
            .collect()
    }

    pub fn top_level_suites(&self) -> Vec<SuiteId> {
        self.tree().runner.top_level.clone()
    }

    /// Declared tree, top-level suites first
    pub fn summarize(&self) -> Vec<Summary> {
        let tree = self.tree();
        tree.runner
            .top_level
            .iter()
            .map(|id| tree.summarize_suite(*id))
            .collect()
    }

    fn check_spec(&self, id: SpecId) -> Result<()> {
        if id.0 < self.tree().specs.len() {
            Ok(())
        } else {
            Err(Error::UnknownSpec(id))
        }
    }

    fn check_suite(&self, id: SuiteId) -> Result<()> {
        if id.0 < self.tree().suites.len() {
            Ok(())
        } else {
            Err(Error::UnknownSuite(id))
        }
    }

    // Crate-internal plumbing

    pub(crate) fn tree(&self) -> Ref<'_, Tree> {
        self.inner.tree.borrow()
    }

    pub(crate) fn tree_mut(&self) -> RefMut<'_, Tree> {
        self.inner.tree.borrow_mut()
    }

    pub(crate) fn with_spec_mut<R>(&self, id: SpecId, f: impl FnOnce(&mut SpecNode) -> R) -> R {
        f(&mut self.tree_mut().specs[id.0])
    }

    pub(crate) fn spec_info_unchecked(&self, id: SpecId) -> SpecInfo {
        self.tree().spec_info(id)
    }

    pub(crate) fn suite_info_unchecked(&self, id: SuiteId) -> SuiteInfo {
        self.tree().suite_info(id)
    }

    pub(crate) fn spec_results_unchecked(&self, id: SpecId) -> NestedResults {
        self.tree().specs[id.0].results.clone()
    }

    pub(crate) fn suite_results_unchecked(&self, id: SuiteId) -> NestedResults {
        suite::results(&self.tree(), id)
    }

    /// Snapshot of the reporters, so dispatch never holds a borrow
    pub(crate) fn reporter(&self) -> MultiReporter {
        self.inner.reporter.borrow().clone()
    }

    pub(crate) fn spec_allowed(&self, info: &SpecInfo) -> bool {
        let filter = self.inner.spec_filter.borrow().clone();
        filter.is_none_or(|filter| filter(info))
    }

    pub(crate) fn set_current_spec(&self, spec: Option<SpecId>) {
        self.inner.current_spec.set(spec);
    }

    pub(crate) fn record_failure(&self, spec: SpecId, failure: Failure) {
        self.with_spec_mut(spec, |node| node.results.add_expectation(failure.into()));
    }

    pub(crate) fn halt(&self, message: String) {
        let mut halted = self.inner.halted.borrow_mut();
        if halted.is_none() {
            *halted = Some(message);
        }
    }

    pub(crate) fn reset_run_state(&self) {
        *self.inner.halted.borrow_mut() = None;
        self.inner.finished.set(false);
        self.inner.current_spec.set(None);
        self.inner.last_yield.set(Instant::now());
    }

    pub(crate) fn mark_finished(&self) {
        self.inner.finished.set(true);
    }

    /// Yield to the host once the update interval has been spent driving
    /// synchronously. A zero interval never yields.
    pub(crate) fn pace(&self) -> Pace {
        let interval = self.config().update_interval();
        if interval.is_zero() {
            return Pace::Continue;
        }
        let now = Instant::now();
        if now.duration_since(self.inner.last_yield.get()) > interval {
            self.inner.last_yield.set(now);
            Pace::Yield
        } else {
            Pace::Continue
        }
    }
}
