//! Action blocks
//!
//! A [`Block`] wraps one user action. Synchronous actions complete as soon
//! as they return. Actions taking a [`Done`] handle complete when the handle
//! is called, or when their timeout timer fires first.

use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::time::Duration;

use crate::clock::TimerHandle;
use crate::env::Env;
use crate::queue::Completion;
use crate::results::Failure;
use crate::spec::{SpecContext, SpecId};

pub type SyncAction = dyn Fn(&SpecContext) -> anyhow::Result<()>;
pub type AsyncAction = dyn Fn(&SpecContext, Done) -> anyhow::Result<()>;

/// The callable inside a block
#[derive(Clone)]
pub enum Action {
    Sync(Rc<SyncAction>),
    /// Completes through the [`Done`] handle
    Async(Rc<AsyncAction>),
}

impl Action {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&SpecContext) -> anyhow::Result<()> + 'static,
    {
        Self::Sync(Rc::new(f))
    }

    pub fn with_done<F>(f: F) -> Self
    where
        F: Fn(&SpecContext, Done) -> anyhow::Result<()> + 'static,
    {
        Self::Async(Rc::new(f))
    }

    pub fn is_async(&self) -> bool {
        matches!(self, Self::Async(_))
    }
}

/// An action bound to the spec whose results it writes to
#[derive(Clone)]
pub struct Block {
    spec: SpecId,
    action: Action,
    /// Async only; the config default applies when unset
    timeout: Option<Duration>,
}

impl Block {
    pub fn new(spec: SpecId, action: Action) -> Self {
        Self {
            spec,
            action,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn spec(&self) -> SpecId {
        self.spec
    }

    pub(crate) fn execute(&self, env: &Env, done: Completion) {
        let ctx = SpecContext::new(env.clone(), self.spec);
        match &self.action {
            Action::Sync(body) => {
                let catch = env.config().catch_exceptions;
                if let Invocation::Halted = invoke(env, self.spec, catch, || body(&ctx)) {
                    return;
                }
                done.complete();
            }
            Action::Async(body) => {
                let timeout = self
                    .timeout
                    .unwrap_or_else(|| env.config().default_timeout());
                let timer = env.clock().set_timeout(
                    {
                        let done = done.clone();
                        let spec = self.spec;
                        move || on_async_timeout(&done, spec, timeout)
                    },
                    timeout,
                );
                let handle = Done {
                    completion: done.clone(),
                    spec: self.spec,
                    timer,
                };

                let catch = env.config().catch_exceptions;
                match invoke(env, self.spec, catch, || body(&ctx, handle)) {
                    Invocation::Returned(()) => {}
                    Invocation::Failed => {
                        env.clock().clear(timer);
                        done.complete();
                    }
                    Invocation::Halted => {
                        env.clock().clear(timer);
                    }
                }
            }
        }
    }
}

fn on_async_timeout(done: &Completion, spec: SpecId, timeout: Duration) {
    if done.is_fired() {
        return;
    }
    if let Some(env) = done.env() {
        let ms = timeout.as_millis();
        tracing::warn!(%spec, timeout_ms = %ms, "async block timed out before calling done");
        if env.config().fail_on_async_timeout {
            env.record_failure(
                spec,
                Failure::timeout(format!("timed out after {ms} msec waiting for done")),
            );
        }
    }
    done.complete();
}

/// Completion handle passed to async actions. Only the first call (or the
/// timeout, whichever comes first) advances the queue.
#[derive(Clone)]
pub struct Done {
    completion: Completion,
    spec: SpecId,
    timer: TimerHandle,
}

impl Done {
    pub fn complete(&self) {
        if self.completion.is_fired() {
            tracing::debug!(spec = %self.spec, "done called after the block already completed");
            return;
        }
        if let Some(env) = self.completion.env() {
            env.clock().clear(self.timer);
        }
        self.completion.complete();
    }

    /// Record `failure` against the spec, then complete.
    pub fn fail(&self, failure: impl Into<Failure>) {
        if self.completion.is_fired() {
            tracing::debug!(spec = %self.spec, "done.fail called after the block already completed");
            return;
        }
        if let Some(env) = self.completion.env() {
            env.record_failure(self.spec, failure.into());
        }
        self.complete();
    }

    pub fn is_complete(&self) -> bool {
        self.completion.is_fired()
    }
}

/// How a guarded call ended
pub(crate) enum Invocation<T> {
    Returned(T),
    /// The error was recorded as a spec failure
    Failed,
    /// Catching is off: the run is halted and the queue must stop
    Halted,
}

/// Call `f`, turning errors (and panics, when `catch` is set) into spec
/// failures. With `catch` unset an error halts the run and a panic unwinds
/// to the host.
pub(crate) fn invoke<T>(
    env: &Env,
    spec: SpecId,
    catch: bool,
    f: impl FnOnce() -> anyhow::Result<T>,
) -> Invocation<T> {
    let outcome = if catch {
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(result) => result.map_err(|err| Failure::from_error(&err)),
            Err(payload) => Err(Failure::from_panic(payload)),
        }
    } else {
        match f() {
            Ok(value) => Ok(value),
            Err(err) => {
                tracing::error!(%spec, "uncaught error: {err:#}");
                env.halt(format!("{err:#}"));
                return Invocation::Halted;
            }
        }
    };

    match outcome {
        Ok(value) => Invocation::Returned(value),
        Err(failure) => {
            tracing::debug!(%spec, %failure, "block failed");
            env.record_failure(spec, failure);
            Invocation::Failed
        }
    }
}
