//! Result aggregation for specs, suites and runs

use serde::Serialize;
use std::any::Any;
use std::backtrace::BacktraceStatus;
use std::fmt;

/// Failure taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Produced by matcher code; recorded without aborting the queue
    Assertion,
    /// An action returned an error or panicked
    Exception,
    /// A latch never became true in time
    Timeout,
    /// A suite body failed while it was being declared
    Declaration,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Assertion => "assertion",
            Self::Exception => "exception",
            Self::Timeout => "timeout",
            Self::Declaration => "declaration",
        })
    }
}

/// A failure recorded against a spec
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
    /// Backtrace text, when one was captured
    pub trace: Option<String>,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            trace: None,
        }
    }

    pub fn assertion(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Assertion, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    /// Convert an action error. A `Failure` carried inside the error keeps
    /// its own kind.
    pub fn from_error(err: &anyhow::Error) -> Self {
        if let Some(failure) = err.downcast_ref::<Failure>() {
            return failure.clone();
        }
        let trace = match err.backtrace().status() {
            BacktraceStatus::Captured => Some(err.backtrace().to_string()),
            _ => None,
        };
        Self {
            kind: FailureKind::Exception,
            message: format!("{err:#}"),
            trace,
        }
    }

    /// Convert the payload of a caught panic.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "Exception".to_string()
        };
        Self::new(FailureKind::Exception, format!("panicked: {message}"))
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }
}

/// Outcome of a single expectation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExpectationResult {
    pub matcher_name: Option<String>,
    pub passed: bool,
    pub message: String,
    /// Set on failed results
    pub kind: Option<FailureKind>,
    pub trace: Option<String>,
}

impl ExpectationResult {
    pub fn passed(message: impl Into<String>) -> Self {
        Self {
            matcher_name: None,
            passed: true,
            message: message.into(),
            kind: None,
            trace: None,
        }
    }

    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            matcher_name: None,
            passed: false,
            message: message.into(),
            kind: Some(kind),
            trace: None,
        }
    }

    pub fn with_matcher(mut self, name: impl Into<String>) -> Self {
        self.matcher_name = Some(name.into());
        self
    }
}

impl From<Failure> for ExpectationResult {
    fn from(failure: Failure) -> Self {
        Self {
            matcher_name: None,
            passed: false,
            message: failure.to_string(),
            kind: Some(failure.kind),
            trace: failure.trace,
        }
    }
}

/// One entry of a [`NestedResults`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResultItem {
    Expectation(ExpectationResult),
    Log { message: String },
    Nested(NestedResults),
}

/// Results for a spec, suite or run. Nested results roll their counts up
/// into the parent when added.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NestedResults {
    pub description: String,
    pub total_count: usize,
    pub passed_count: usize,
    pub failed_count: usize,
    /// Was this suite/spec skipped?
    pub skipped: bool,
    items: Vec<ResultItem>,
}

impl NestedResults {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }

    /// Add a result, tracking counts. Log items never count.
    pub fn add_result(&mut self, item: ResultItem) {
        match &item {
            ResultItem::Expectation(result) => {
                self.total_count += 1;
                if result.passed {
                    self.passed_count += 1;
                } else {
                    self.failed_count += 1;
                }
            }
            ResultItem::Nested(nested) => self.rollup_counts(nested),
            ResultItem::Log { .. } => {}
        }
        self.items.push(item);
    }

    pub fn add_expectation(&mut self, result: ExpectationResult) {
        self.add_result(ResultItem::Expectation(result));
    }

    pub fn add_nested(&mut self, nested: NestedResults) {
        self.add_result(ResultItem::Nested(nested));
    }

    pub fn log(&mut self, message: impl Into<String>) {
        self.add_result(ResultItem::Log {
            message: message.into(),
        });
    }

    fn rollup_counts(&mut self, nested: &NestedResults) {
        self.total_count += nested.total_count;
        self.passed_count += nested.passed_count;
        self.failed_count += nested.failed_count;
    }

    pub fn items(&self) -> &[ResultItem] {
        &self.items
    }

    /// Leaf expectations, in the order they were recorded.
    pub fn expectations(&self) -> impl Iterator<Item = &ExpectationResult> {
        self.items.iter().filter_map(|item| match item {
            ResultItem::Expectation(result) => Some(result),
            _ => None,
        })
    }

    /// Failed leaf expectations, in the order they were recorded.
    pub fn failures(&self) -> impl Iterator<Item = &ExpectationResult> {
        self.expectations().filter(|result| !result.passed)
    }

    /// True if everything below passed
    pub fn passed(&self) -> bool {
        self.passed_count == self.total_count
    }
}
