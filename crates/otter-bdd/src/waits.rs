//! Sleep and latch-polling steps

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use crate::block::{Invocation, invoke};
use crate::env::Env;
use crate::queue::Completion;
use crate::reporter::Reporter;
use crate::results::Failure;
use crate::spec::{SpecContext, SpecId};

/// Completes after a fixed duration on the active clock
#[derive(Debug, Clone)]
pub struct WaitsBlock {
    spec: SpecId,
    duration: Duration,
}

impl WaitsBlock {
    pub fn new(spec: SpecId, duration: Duration) -> Self {
        Self { spec, duration }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub(crate) fn execute(&self, env: &Env, done: Completion) {
        if env.config().verbose {
            env.reporter()
                .on_log(&format!(">> waiting for {} ms...", self.duration.as_millis()));
        }
        tracing::trace!(spec = %self.spec, ms = %self.duration.as_millis(), "sleeping");
        env.clock().set_timeout(move || done.complete(), self.duration);
    }
}

pub type Latch = dyn Fn(&SpecContext) -> anyhow::Result<bool>;

/// Polls a latch until it returns true, failing the spec and aborting its
/// queue once the timeout is spent
#[derive(Clone)]
pub struct WaitsForBlock {
    spec: SpecId,
    latch: Rc<Latch>,
    message: Option<String>,
    timeout: Option<Duration>,
}

impl WaitsForBlock {
    pub fn new<F>(spec: SpecId, latch: F, message: Option<String>, timeout: Option<Duration>) -> Self
    where
        F: Fn(&SpecContext) -> anyhow::Result<bool> + 'static,
    {
        Self {
            spec,
            latch: Rc::new(latch),
            message,
            timeout,
        }
    }

    /// What the latch is waiting for, as it appears in messages
    pub fn message(&self) -> &str {
        self.message.as_deref().unwrap_or("something to happen")
    }

    pub(crate) fn execute(&self, env: &Env, done: Completion) {
        let timeout = self
            .timeout
            .unwrap_or_else(|| env.config().default_timeout());
        if env.config().verbose {
            env.reporter()
                .on_log(&format!(">> waiting for {}", self.message()));
        }
        let poll = Rc::new(LatchPoll {
            spec: self.spec,
            latch: Rc::clone(&self.latch),
            message: self.message().to_string(),
            timeout_ms: timeout.as_millis(),
            increment: env.config().poll_interval(),
            elapsed_ms: Cell::new(0),
        });
        poll.check(env, done);
    }
}

/// Per-execution polling state; a fresh one is made every time the block
/// runs, so elapsed time never carries over between runs.
struct LatchPoll {
    spec: SpecId,
    latch: Rc<Latch>,
    message: String,
    timeout_ms: u128,
    increment: Duration,
    elapsed_ms: Cell<u128>,
}

impl LatchPoll {
    fn check(self: Rc<Self>, env: &Env, done: Completion) {
        let ctx = SpecContext::new(env.clone(), self.spec);
        // Latch errors always become spec failures, whatever catch_exceptions says.
        match invoke(env, self.spec, true, || (self.latch)(&ctx)) {
            Invocation::Halted => {}
            Invocation::Failed => done.complete(),
            Invocation::Returned(true) => done.complete(),
            Invocation::Returned(false) if self.elapsed_ms.get() >= self.timeout_ms => {
                let message = format!(
                    "timed out after {} msec waiting for {}",
                    self.timeout_ms, self.message
                );
                tracing::debug!(spec = %self.spec, "{message}");
                env.record_failure(self.spec, Failure::timeout(message));
                done.abort();
            }
            Invocation::Returned(false) => {
                self.elapsed_ms
                    .set(self.elapsed_ms.get() + self.increment.as_millis());
                let increment = self.increment;
                let poll = Rc::clone(&self);
                env.clock().set_timeout(
                    move || {
                        if let Some(env) = done.env() {
                            poll.check(&env, done);
                        }
                    },
                    increment,
                );
            }
        }
    }
}
