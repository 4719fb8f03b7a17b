//! Error types for the skein execution core.
//!
//! The taxonomy follows the propagation policy of the runtime: transient
//! provider failures are retried at the provider layer, handler failures are
//! folded into tool results, and everything else surfaces as a terminal
//! `RunError` on the event stream.

use thiserror::Error;

/// A type alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for runs, steps, and tool dispatch.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Error from the LLM provider. Carries the HTTP status when the
    /// provider surfaced one, which drives retry classification.
    #[error("provider error: {message}")]
    Provider {
        /// The underlying error message.
        message: String,
        /// HTTP status code, when the failure came from a transport layer.
        status: Option<u16>,
    },

    /// Invalid configuration, surfaced synchronously before a run starts.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration issue.
        message: String,
    },

    /// Error during tool execution. The agent loop converts these into
    /// `ToolCallResult { is_error: true }` rather than aborting the run.
    #[error("tool '{name}' failed: {message}")]
    Tool {
        /// Name of the tool that failed.
        name: String,
        /// The underlying error message.
        message: String,
    },

    /// A tool name was registered twice.
    #[error("tool '{name}' is already registered")]
    DuplicateTool {
        /// The conflicting tool name.
        name: String,
    },

    /// No workflow with the given name exists in the registry.
    #[error("unknown workflow '{name}'")]
    UnknownWorkflow {
        /// The requested workflow name.
        name: String,
    },

    /// Failure to parse model output into an expected typed shape.
    #[error("{context}: failed to unmarshal response: {message}")]
    Unmarshal {
        /// Where the parse was attempted, e.g. `workflow: step "extract"`.
        context: String,
        /// The underlying parse error message.
        message: String,
    },

    /// The run context was cancelled.
    #[error("run cancelled")]
    Cancelled,

    /// The run deadline elapsed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Shared-state access failure.
    #[error(transparent)]
    State(#[from] StateError),

    /// Rendezvous broker failure.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// A workflow step failed, with the step name attached.
    #[error("step '{name}': {source}")]
    Step {
        /// Name of the failing step.
        name: String,
        /// The underlying error.
        #[source]
        source: Box<Error>,
    },

    /// Invariant violation inside the core, e.g. a panicked worker task.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the violation.
        message: String,
    },
}

impl Error {
    /// Create a provider error without an HTTP status.
    #[must_use]
    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider {
            message: message.into(),
            status: None,
        }
    }

    /// Create a provider error carrying an HTTP status code.
    #[must_use]
    pub fn provider_status(message: impl Into<String>, status: u16) -> Self {
        Self::Provider {
            message: message.into(),
            status: Some(status),
        }
    }

    /// Create a configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a tool execution error.
    #[must_use]
    pub fn tool(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Create an unmarshal error with a source context.
    #[must_use]
    pub fn unmarshal(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unmarshal {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Wrap an error with the name of the step that produced it.
    ///
    /// Already-wrapped errors pass through unchanged so the innermost step
    /// name wins when a combinator re-wraps.
    #[must_use]
    pub fn in_step(self, name: impl Into<String>) -> Self {
        match self {
            Self::Step { .. } => self,
            other => Self::Step {
                name: name.into(),
                source: Box::new(other),
            },
        }
    }

    /// Returns `true` if this error is a cancellation or deadline error.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }
}

/// Errors from typed shared-state access.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum StateError {
    /// No value is stored under the key.
    #[error("state key '{key}' is missing")]
    KeyMissing {
        /// The missing key name.
        key: String,
    },

    /// A value is stored under the key but does not deserialize to the
    /// requested type.
    #[error("state key '{key}' does not hold a {expected}")]
    KeyTypeMismatch {
        /// The key name.
        key: String,
        /// The requested Rust type.
        expected: &'static str,
    },
}

/// Errors from the approval / user-input rendezvous brokers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum BrokerError {
    /// The request timed out before a decision arrived.
    #[error("request timed out")]
    Timeout,

    /// The requesting context was cancelled while waiting.
    #[error("request cancelled")]
    Cancelled,

    /// A decision arrived for an id with no pending request.
    #[error("no pending request with id '{id}'")]
    UnknownRequest {
        /// The unknown request id.
        id: String,
    },
}
