// Allow module inception for error types - this is a common Rust pattern
#![allow(clippy::module_name_repetitions)]

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Error kind for failures that have no more specific category
pub const EXCEPTION_ERROR: &str = "fanout/exception-error";
/// Error kind for targets that could not be reached
pub const CONNECT_ERROR: &str = "fanout/connect-error";
/// Error kind for commands and scripts that exited non-zero
pub const COMMAND_ERROR: &str = "fanout/command-error";
/// Error kind for tasks that exited non-zero
pub const TASK_ERROR: &str = "fanout/task-error";
/// Error kind for files that could not be staged on a target
pub const FILE_ERROR: &str = "fanout/file-error";
/// Error kind for processes killed after exceeding their timeout
pub const TIMEOUT_ERROR: &str = "fanout/timeout-error";
/// Error kind for targets whose transport is not registered
pub const UNKNOWN_TRANSPORT: &str = "fanout/unknown-transport";
/// Error kind for inventory structure problems
pub const VALIDATION_ERROR: &str = "fanout.inventory/validation-error";
/// Error kind for wildcard target lookups that matched nothing
pub const WILDCARD_ERROR: &str = "fanout.inventory/wildcard-error";
/// Error kind for futures that exceeded a wait timeout
pub const FUTURE_TIMEOUT: &str = "fanout/future-timeout";
/// Error kind for failed joins on parallel work
pub const PARALLEL_FAILURE: &str = "fanout/parallel-failure";
/// Error kind for a no-argument wait issued from a future it would wait on
pub const INFINITE_WAIT: &str = "fanout/infinite-wait";

/// Outcome of a finished plan future: its value or the error it finished with
pub type FutureOutcome = Result<Value, ErrorInfo>;

/// Structured, serializable error value
///
/// This is the shape errors take once they are captured inside a result or a
/// future outcome, so they can be cloned, compared and printed as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Category string, e.g. `fanout/connect-error`
    pub kind: String,

    /// Human readable message
    pub msg: String,

    /// Free-form details
    #[serde(default = "empty_details")]
    pub details: Value,

    /// Optional short issue code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_code: Option<String>,
}

fn empty_details() -> Value {
    Value::Object(serde_json::Map::new())
}

impl ErrorInfo {
    /// Create an error value with empty details
    #[must_use]
    pub fn new(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            msg: msg.into(),
            details: empty_details(),
            issue_code: None,
        }
    }

    /// Attach details
    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    /// Attach an issue code
    #[must_use]
    pub fn with_issue_code(mut self, code: impl Into<String>) -> Self {
        self.issue_code = Some(code.into());
        self
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

#[derive(Error, Debug)]
pub enum FanoutError {
    #[error("{}", validation_message(.message, .path))]
    Validation { message: String, path: Vec<String> },

    #[error("Found 0 targets matching wildcard pattern {0}")]
    Wildcard(String),

    #[error("Group {0} does not exist in inventory")]
    UnknownGroup(String),

    #[error("Failed to connect to {target}: {message}")]
    Connection { target: String, message: String },

    #[error("No transport registered for '{0}'")]
    UnknownTransport(String),

    /// Structured failure raised by a transport, kept with its own kind
    #[error("{message}")]
    Transport {
        kind: String,
        message: String,
        details: Value,
    },

    #[error("Future '{name}' timed out after {timeout:?}")]
    FutureTimeout { name: String, timeout: Duration },

    #[error("Plan aborted: parallel block failed on {} targets", .failed_indices.len())]
    ParallelFailure {
        results: Vec<FutureOutcome>,
        failed_indices: Vec<usize>,
    },

    #[error(
        "The wait() function cannot be called with no arguments inside a background block in the same plan."
    )]
    InfiniteWait,

    /// A captured error being raised again, e.g. the outcome of a future
    #[error("{0}")]
    Raised(ErrorInfo),

    #[error("Executor error: {0}")]
    Executor(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type FanoutResult<T> = Result<T, FanoutError>;

fn validation_message(message: &str, path: &[String]) -> String {
    if path.is_empty() {
        message.to_string()
    } else {
        format!("{message} for group at {path:?}")
    }
}

impl FanoutError {
    /// Build a validation error raised at the given group (if any)
    #[must_use]
    pub fn validation(message: impl Into<String>, offending_group: Option<&str>) -> Self {
        Self::Validation {
            message: message.into(),
            path: offending_group.map(str::to_string).into_iter().collect(),
        }
    }

    /// Record the enclosing group on a validation error's path
    #[must_use]
    pub fn add_parent(self, parent_group: &str) -> Self {
        match self {
            Self::Validation { message, mut path } => {
                path.push(parent_group.to_string());
                Self::Validation { message, path }
            }
            other => other,
        }
    }

    /// Build a transport failure with an explicit kind
    #[must_use]
    pub fn transport(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            kind: kind.into(),
            message: message.into(),
            details: empty_details(),
        }
    }

    /// The kind string reported for this error
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::Validation { .. } | Self::UnknownGroup(_) => VALIDATION_ERROR,
            Self::Wildcard(_) => WILDCARD_ERROR,
            Self::Connection { .. } => CONNECT_ERROR,
            Self::UnknownTransport(_) => UNKNOWN_TRANSPORT,
            Self::Transport { kind, .. } => kind,
            Self::FutureTimeout { .. } => FUTURE_TIMEOUT,
            Self::ParallelFailure { .. } => PARALLEL_FAILURE,
            Self::InfiniteWait => INFINITE_WAIT,
            Self::Raised(info) => &info.kind,
            Self::Executor(_) | Self::Io(_) | Self::Json(_) | Self::Yaml(_) => EXCEPTION_ERROR,
        }
    }

    /// Convert into the structured value stored in results and outcomes
    #[must_use]
    pub fn to_error_info(&self) -> ErrorInfo {
        let details = match self {
            Self::Validation { path, .. } => json!({ "path": path }),
            Self::Connection { target, .. } => json!({ "target": target }),
            Self::Transport { details, .. } => details.clone(),
            Self::FutureTimeout { name, timeout } => {
                json!({ "future": name, "timeout": timeout.as_secs_f64() })
            }
            Self::ParallelFailure {
                results,
                failed_indices,
            } => json!({
                "action": "parallelize",
                "failed_indices": failed_indices,
                "results": results.iter().map(outcome_to_value).collect::<Vec<_>>(),
            }),
            Self::Raised(info) => return info.clone(),
            Self::Io(_) => json!({ "class": "io" }),
            Self::Json(_) => json!({ "class": "json" }),
            Self::Yaml(_) => json!({ "class": "yaml" }),
            _ => empty_details(),
        };

        ErrorInfo::new(self.kind(), self.to_string()).with_details(details)
    }
}

impl From<ErrorInfo> for FanoutError {
    fn from(info: ErrorInfo) -> Self {
        Self::Raised(info)
    }
}

/// Render a future outcome as plain data
#[must_use]
pub fn outcome_to_value(outcome: &FutureOutcome) -> Value {
    match outcome {
        Ok(value) => value.clone(),
        Err(error) => serde_json::to_value(error).unwrap_or(Value::Null),
    }
}
