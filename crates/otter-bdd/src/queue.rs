//! Step queue and its drive loop
//!
//! A [`Queue`] runs its steps strictly in sequence, one active step at a
//! time. Steps report back through a [`Completion`]. When a step completes
//! while the driver is still inside its `execute` call, the completion only
//! records the signal and the driver's own loop advances, so long chains of
//! synchronous steps never grow the stack. A completion that arrives later
//! (from a timer) advances the queue and re-enters the loop directly.
//!
//! Once a queue is aborted, every remaining step that is not ensured is
//! skipped; ensured steps still run, in order.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use crate::block::Block;
use crate::env::{Env, WeakEnv};
use crate::spec::{self, SpecId};
use crate::suite::{self, SuiteId};
use crate::waits::{WaitsBlock, WaitsForBlock};

/// A unit of work the queue can drive
#[derive(Clone)]
pub enum Step {
    /// Run an action, synchronously or with a `done` callback
    Run(Block),
    /// Sleep for a fixed duration
    Sleep(WaitsBlock),
    /// Poll a latch until it holds or times out
    PollUntil(WaitsForBlock),
    /// Run a nested suite's queue
    Suite(SuiteId),
    /// Run a spec's queue
    Spec(SpecId),
}

impl Step {
    pub(crate) fn execute(&self, env: &Env, done: Completion) {
        match self {
            Step::Run(block) => block.execute(env, done),
            Step::Sleep(wait) => wait.execute(env, done),
            Step::PollUntil(wait) => wait.execute(env, done),
            Step::Suite(id) => suite::execute(env, *id, done),
            Step::Spec(id) => spec::execute(env, *id, done),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Step::Run(_) => "run",
            Step::Sleep(_) => "sleep",
            Step::PollUntil(_) => "poll_until",
            Step::Suite(_) => "suite",
            Step::Spec(_) => "spec",
        }
    }
}

struct QueuedStep {
    step: Rc<Step>,
    /// Runs even after the queue has aborted
    ensured: bool,
}

/// How a step finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signal {
    Continue,
    Abort,
}

/// Whether the driver may keep going or must hand control to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pace {
    Continue,
    Yield,
}

/// Identifies one execution of one step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Token {
    generation: u64,
    index: usize,
}

type OnComplete = Box<dyn FnOnce(&Env)>;

#[derive(Default)]
struct QueueState {
    steps: Vec<QueuedStep>,
    /// Cursor: index of the active step
    index: usize,
    /// Steps spliced in after the active one during its execution
    offset: usize,
    running: bool,
    aborted: bool,
    /// Bumped on every start; completions from older runs are ignored
    generation: u64,
    /// The driver is inside the active step's `execute`
    in_sync_call: bool,
    /// Signal recorded by a completion that fired during `execute`
    sync_signal: Option<Signal>,
    on_complete: Option<OnComplete>,
}

/// Ordered list of steps with a single driver. Cloning yields another
/// handle to the same queue.
#[derive(Clone, Default)]
pub struct Queue {
    inner: Rc<RefCell<QueueState>>,
}

impl Queue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step.
    pub fn add(&self, step: Step, ensured: bool) {
        self.inner.borrow_mut().steps.push(QueuedStep {
            step: Rc::new(step),
            ensured,
        });
    }

    /// Prepend a step.
    pub fn add_before(&self, step: Step, ensured: bool) {
        self.inner.borrow_mut().steps.insert(
            0,
            QueuedStep {
                step: Rc::new(step),
                ensured,
            },
        );
    }

    /// Splice a step in right after the active one. Repeated calls from the
    /// same step keep their call order.
    pub fn insert_next(&self, step: Step, ensured: bool) {
        let mut state = self.inner.borrow_mut();
        let position = (state.index + state.offset + 1).min(state.steps.len());
        state.steps.insert(
            position,
            QueuedStep {
                step: Rc::new(step),
                ensured,
            },
        );
        state.offset += 1;
    }

    /// Splice an ensured step in at the head of the cleanup tail: before the
    /// first ensured step still ahead of the cursor, or at the end. This keeps
    /// after-hooks innermost first: a spec's own `after` runs ahead of the
    /// suite and runner afters queued when it started.
    pub fn insert_cleanup(&self, step: Step) {
        let mut state = self.inner.borrow_mut();
        let from = if state.running {
            state.index + state.offset + 1
        } else {
            0
        }
        .min(state.steps.len());
        let position = state.steps[from..]
            .iter()
            .position(|queued| queued.ensured)
            .map_or(state.steps.len(), |p| from + p);
        state.steps.insert(
            position,
            QueuedStep {
                step: Rc::new(step),
                ensured: true,
            },
        );
    }

    /// Remove every step. Ignored while running.
    pub fn clear(&self) {
        let mut state = self.inner.borrow_mut();
        if state.running {
            tracing::warn!("refusing to clear a running queue");
            return;
        }
        state.steps.clear();
    }

    /// Keep only the steps matching `keep`. Ignored while running.
    pub fn retain(&self, mut keep: impl FnMut(&Step) -> bool) {
        let mut state = self.inner.borrow_mut();
        if state.running {
            tracing::warn!("refusing to filter a running queue");
            return;
        }
        state.steps.retain(|queued| keep(&queued.step));
    }

    /// Snapshot of the steps, in order.
    pub fn steps(&self) -> Vec<Rc<Step>> {
        self.inner
            .borrow()
            .steps
            .iter()
            .map(|queued| Rc::clone(&queued.step))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_running(&self) -> bool {
        self.inner.borrow().running
    }

    /// Aborted state of the current (or last) run.
    pub fn is_aborted(&self) -> bool {
        self.inner.borrow().aborted
    }

    /// Skip every remaining step that is not ensured.
    pub fn abort(&self) {
        self.inner.borrow_mut().aborted = true;
    }

    pub fn cursor(&self) -> usize {
        self.inner.borrow().index
    }

    /// Run the steps from the top; `on_complete` fires exactly once when the
    /// cursor passes the last step.
    pub fn start(&self, env: &Env, on_complete: impl FnOnce(&Env) + 'static) {
        {
            let mut state = self.inner.borrow_mut();
            if state.running {
                tracing::warn!("queue is already running; ignoring start");
                return;
            }
            state.running = true;
            state.index = 0;
            state.offset = 0;
            state.aborted = false;
            state.generation += 1;
            state.in_sync_call = false;
            state.sync_signal = None;
            state.on_complete = Some(Box::new(on_complete));
        }
        self.drive(env);
    }

    /// Drop a run that can no longer finish (its env was halted). Completions
    /// still held by its steps become stale.
    pub(crate) fn reset(&self) {
        let mut state = self.inner.borrow_mut();
        state.running = false;
        state.generation += 1;
        state.in_sync_call = false;
        state.sync_signal = None;
        state.on_complete = None;
    }

    /// The drive loop. Falls through to the next step when the active one
    /// completed synchronously; returns when it is still pending.
    fn drive(&self, env: &Env) {
        loop {
            if env.is_halted() {
                return;
            }

            let Some((step, token)) = self.next_step() else {
                self.finish(env);
                return;
            };

            self.inner.borrow_mut().in_sync_call = true;
            step.execute(env, Completion::new(self.clone(), env.downgrade(), token));

            let signal = {
                let mut state = self.inner.borrow_mut();
                state.in_sync_call = false;
                state.sync_signal.take()
            };
            let Some(signal) = signal else {
                return;
            };
            if self.advance(env, signal) == Pace::Yield {
                self.resume_later(env);
                return;
            }
        }
    }

    fn next_step(&self) -> Option<(Rc<Step>, Token)> {
        let mut state = self.inner.borrow_mut();
        while state.aborted
            && state.index < state.steps.len()
            && !state.steps[state.index].ensured
        {
            tracing::trace!(index = state.index, "skipping step after abort");
            state.index += 1;
        }
        let step = Rc::clone(&state.steps.get(state.index)?.step);
        Some((
            step,
            Token {
                generation: state.generation,
                index: state.index,
            },
        ))
    }

    fn advance(&self, env: &Env, signal: Signal) -> Pace {
        {
            let mut state = self.inner.borrow_mut();
            if signal == Signal::Abort {
                state.aborted = true;
            }
            state.offset = 0;
            state.index += 1;
        }
        env.pace()
    }

    fn finish(&self, env: &Env) {
        let on_complete = {
            let mut state = self.inner.borrow_mut();
            state.running = false;
            state.on_complete.take()
        };
        if let Some(on_complete) = on_complete {
            on_complete(env);
        }
    }

    /// Give the host loop a turn, then keep driving.
    fn resume_later(&self, env: &Env) {
        tracing::trace!(cursor = self.cursor(), "yielding to host loop");
        let queue = self.clone();
        let weak = env.downgrade();
        env.host().set_timeout(
            move || {
                if let Some(env) = weak.upgrade() {
                    queue.drive(&env);
                }
            },
            Duration::ZERO,
        );
    }
}

/// Completion signal handed to an executing step. Clones share one
/// "fired" flag: the first signal wins and later ones are ignored.
#[derive(Clone)]
pub(crate) struct Completion {
    queue: Queue,
    env: WeakEnv,
    token: Token,
    fired: Rc<Cell<bool>>,
}

impl Completion {
    fn new(queue: Queue, env: WeakEnv, token: Token) -> Self {
        Self {
            queue,
            env,
            token,
            fired: Rc::new(Cell::new(false)),
        }
    }

    pub(crate) fn complete(&self) {
        self.signal(Signal::Continue);
    }

    /// Complete and abort the owning queue.
    pub(crate) fn abort(&self) {
        self.signal(Signal::Abort);
    }

    pub(crate) fn is_fired(&self) -> bool {
        self.fired.get()
    }

    pub(crate) fn env(&self) -> Option<Env> {
        self.env.upgrade()
    }

    fn signal(&self, signal: Signal) {
        if self.fired.replace(true) {
            tracing::debug!(index = self.token.index, "ignoring repeated step completion");
            return;
        }
        let Some(env) = self.env.upgrade() else {
            return;
        };

        {
            let mut state = self.queue.inner.borrow_mut();
            if !state.running
                || state.generation != self.token.generation
                || state.index != self.token.index
            {
                tracing::debug!(index = self.token.index, "ignoring stale step completion");
                return;
            }
            if state.in_sync_call {
                state.sync_signal = Some(signal);
                return;
            }
        }

        if self.queue.advance(&env, signal) == Pace::Yield {
            self.queue.resume_later(&env);
        } else {
            self.queue.drive(&env);
        }
    }
}
