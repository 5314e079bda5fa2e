//! Error taxonomy for the dispatch pipeline.
//!
//! Each subsystem gets its own `thiserror`-derived enum rather than one
//! grab-bag error type, following the same per-concern split the harness
//! error module used (registry errors are not validator errors are not
//! queue errors).

use std::time::Duration;
use thiserror::Error;

/// Errors raised by a [`crate::rate_limit::SlotQueue`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SlotQueueError {
    /// The queue was disposed; no further admission is possible.
    #[error("slot queue disposed")]
    Disposed,

    /// A waiter sat in the FIFO longer than `queue_timeout_ms` allows.
    #[error("acquire timed out after waiting {waited:?}")]
    Timeout { waited: Duration },
}

/// Errors surfaced by [`crate::assertion::validator`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{path}: {reason}")]
pub struct AssertValidationError {
    /// JSON-path-like location, e.g. `tests[0].assert[1]`.
    pub path: String,
    /// Human-readable reason.
    pub reason: String,
    /// The offending value, for caller-side diagnostics.
    pub received: serde_json::Value,
}

impl AssertValidationError {
    pub fn new(
        path: impl Into<String>,
        reason: impl Into<String>,
        received: serde_json::Value,
    ) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
            received,
        }
    }
}

/// Errors raised while dispatching a single assertion.
///
/// This never escapes [`crate::assertion::dispatcher::AssertionDispatcher::run_test`] —
/// it is converted into a failed [`crate::assertion::GradingResult`] per
/// the "Assertion handler error" row of the error taxonomy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("assertion handler error: {0}")]
    HandlerFailed(String),

    #[error("scoring function error: {0}")]
    ScoringFunctionFailed(String),

    /// Raised only when the accumulator's short-circuit flag is set and a
    /// result fails; unwinds the whole `run_test` instead of continuing.
    #[error("assertion short-circuited: {0}")]
    Aborted(String),
}

/// A normalized view over a provider-call failure that [`crate::retry::RetryPolicy`]
/// classifies. Built from whatever the caller's transport layer produced —
/// this crate never issues the call itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedError {
    message: Option<String>,
    status_code: Option<u16>,
    is_rate_limited: bool,
}

impl ClassifiedError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            status_code: None,
            is_rate_limited: false,
        }
    }

    /// An error with no message at all (e.g. an opaque transport failure) —
    /// `should_retry` must not panic or misclassify this as a string match.
    pub fn new_no_message() -> Self {
        Self {
            message: None,
            status_code: None,
            is_rate_limited: false,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.is_rate_limited = self.is_rate_limited || status == 429;
        self.status_code = Some(status);
        self
    }

    pub fn rate_limited(mut self) -> Self {
        self.is_rate_limited = true;
        self
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn status_code(&self) -> Option<u16> {
        self.status_code
    }

    pub fn is_rate_limited(&self) -> bool {
        self.is_rate_limited
    }
}

impl std::fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.message, self.status_code) {
            (Some(m), Some(c)) => write!(f, "{m} (status {c})"),
            (Some(m), None) => write!(f, "{m}"),
            (None, Some(c)) => write!(f, "status {c}"),
            (None, None) => write!(f, "unknown error"),
        }
    }
}

impl std::error::Error for ClassifiedError {}
