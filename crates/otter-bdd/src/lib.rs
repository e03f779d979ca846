//! # Otter BDD
//!
//! Behavior-driven test scheduler for the Otter runtime, providing:
//! - `describe`/`it` declaration with nested suites and before/after hooks
//! - A step queue that drives sync and async blocks without growing the stack
//! - `waits`/`waits_for` steps and a virtual clock for deterministic timing
//! - Nested result aggregation and pluggable reporters
//!
//! ```no_run
//! use otter_bdd::{Env, EnvConfig};
//!
//! let env = Env::new(EnvConfig::default());
//! env.describe("arithmetic", |env| {
//!     env.it("adds", |ctx| {
//!         ctx.check(1 + 1 == 2, "1 + 1 == 2");
//!         Ok(())
//!     })?;
//!     Ok(())
//! });
//! let results = env.run().expect("run completes");
//! assert!(results.passed());
//! ```

#![warn(clippy::all)]

pub mod block;
pub mod clock;
pub mod config;
pub mod env;
pub mod error;
pub mod event_loop;
pub mod queue;
pub mod reporter;
pub mod results;
mod runner;
pub mod spec;
pub mod suite;
pub mod waits;

pub use block::{Action, Block, Done};
pub use clock::{Clock, FakeTimer, TimerHandle};
pub use config::EnvConfig;
pub use env::{Env, WeakEnv};
pub use error::{Error, Result};
pub use event_loop::{EventLoop, TimerId};
pub use queue::{Queue, Step};
pub use reporter::{
    ApiReporter, MultiReporter, NodeKind, Reporter, SpecReport, SpecStatus, Summary,
    TracingReporter,
};
pub use results::{ExpectationResult, Failure, FailureKind, NestedResults, ResultItem};
pub use spec::{SpecContext, SpecId, SpecInfo};
pub use suite::{SuiteId, SuiteInfo};
pub use waits::{WaitsBlock, WaitsForBlock};
