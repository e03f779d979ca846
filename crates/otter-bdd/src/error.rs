//! Error types for otter-bdd
//!
//! Failures recorded against a spec live in [`crate::results`]; this module
//! covers the errors the scheduler itself returns to its host.

use std::path::PathBuf;

use thiserror::Error;

use crate::spec::SpecId;
use crate::suite::SuiteId;

/// Errors returned by the scheduler and its configuration layer
#[derive(Error, Debug)]
pub enum Error {
    /// Config file could not be read
    #[error("Failed to read config '{}': {source}", path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for [`crate::EnvConfig`]
    #[error("Failed to parse config '{}': {source}", path.display())]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// The fake clock was driven while the real timers were active
    #[error("Mock clock is not installed, use Clock::install_mock() or SpecContext::use_fake_clock()")]
    ClockNotInstalled,

    /// A declaration that needs an open `describe` was made at top level
    #[error("`{0}` must be declared inside a describe block")]
    NoEnclosingSuite(&'static str),

    /// A cleanup was registered while no spec was running
    #[error("No spec is running")]
    NoRunningSpec,

    /// Lookup by an id that was never registered
    #[error("Unknown spec id {0}")]
    UnknownSpec(SpecId),

    /// Lookup by an id that was never registered
    #[error("Unknown suite id {0}")]
    UnknownSuite(SuiteId),

    /// `spy_on` was called twice for the same slot within one spec
    #[error("Slot is already spied on by this spec")]
    AlreadySpied,

    /// A block failed while exception catching was disabled
    #[error("Uncaught exception halted the run: {0}")]
    Uncaught(String),

    /// The host loop went idle before the runner finished
    #[error("Run did not complete: the host loop is idle while specs are still suspended")]
    Incomplete,
}

/// Result type alias for scheduler operations
pub type Result<T> = std::result::Result<T, Error>;
