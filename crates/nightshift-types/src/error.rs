use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Classification of a task failure, recorded on the task after a failed
/// or aborted execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    /// Parameter validation failed; never retried.
    InvalidParameter,
    /// The task exceeded its timeout, or the sequence exceeded the global
    /// timeout.
    Timeout,
    /// The underlying device reported failure; retried per policy.
    Device,
    /// Cooperative cancellation was observed.
    Cancelled,
    /// A predecessor failed under stop recovery, so this work never started.
    Dependency,
    /// Unexpected failure from a task body or the scheduler itself.
    Internal,
}

impl fmt::Display for TaskErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvalidParameter => "invalid_parameter",
            Self::Timeout => "timeout",
            Self::Device => "device",
            Self::Cancelled => "cancelled",
            Self::Dependency => "dependency",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskErrorKind {
    type Err = TaskErrorKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "invalid_parameter" => Ok(Self::InvalidParameter),
            "timeout" => Ok(Self::Timeout),
            "device" => Ok(Self::Device),
            "cancelled" => Ok(Self::Cancelled),
            "dependency" => Ok(Self::Dependency),
            "internal" => Ok(Self::Internal),
            other => Err(TaskErrorKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskErrorKind`] string.
#[derive(Debug, Clone)]
pub struct TaskErrorKindParseError(pub String);

impl fmt::Display for TaskErrorKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task error kind: {:?}", self.0)
    }
}

impl std::error::Error for TaskErrorKindParseError {}

/// Error produced by task execution.
///
/// Task actions return this directly; the execution driver also produces
/// `Timeout` and `Cancelled` on the action's behalf.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    #[error("invalid parameters: {}", .errors.join("; "))]
    InvalidParameter { errors: Vec<String> },

    #[error("timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("device error: {0}")]
    Device(String),

    #[error("cancelled")]
    Cancelled,

    #[error("dependency not satisfied: {0}")]
    Dependency(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl TaskError {
    pub fn kind(&self) -> TaskErrorKind {
        match self {
            Self::InvalidParameter { .. } => TaskErrorKind::InvalidParameter,
            Self::Timeout { .. } => TaskErrorKind::Timeout,
            Self::Device(_) => TaskErrorKind::Device,
            Self::Cancelled => TaskErrorKind::Cancelled,
            Self::Dependency(_) => TaskErrorKind::Dependency,
            Self::Internal(_) => TaskErrorKind::Internal,
        }
    }

    /// Whether the retry policy applies to this error. Validation failures
    /// and cancellations are never retried; timeouts fail the attempt
    /// outright.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Device(_) | Self::Internal(_))
    }
}
