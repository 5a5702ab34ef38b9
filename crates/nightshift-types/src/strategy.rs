use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Execution strategy
// ---------------------------------------------------------------------------

/// How the sequencer maps targets onto workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// One target at a time, regardless of the concurrency cap.
    Sequential,
    /// Up to `max_concurrent` targets at once.
    Parallel,
    /// Starts at 1, widens under sustained low resource use, narrows on
    /// resource pressure.
    Adaptive,
    /// Like `Parallel`, but the ready pool is drained highest-priority first.
    Priority,
}

impl fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
            Self::Adaptive => "adaptive",
            Self::Priority => "priority",
        };
        f.write_str(s)
    }
}

impl FromStr for ExecutionStrategy {
    type Err = StrategyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sequential" => Ok(Self::Sequential),
            "parallel" => Ok(Self::Parallel),
            "adaptive" => Ok(Self::Adaptive),
            "priority" => Ok(Self::Priority),
            other => Err(StrategyParseError("execution strategy", other.to_owned())),
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduling strategy
// ---------------------------------------------------------------------------

/// Ordering applied to the ready pool each dispatch round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingStrategy {
    /// Insertion order.
    Fifo,
    /// Priority descending, ties broken by insertion order.
    Priority,
    /// Topological (Kahn) order within the ready pool, ties by priority
    /// then insertion.
    Dependencies,
}

impl fmt::Display for SchedulingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Fifo => "fifo",
            Self::Priority => "priority",
            Self::Dependencies => "dependencies",
        };
        f.write_str(s)
    }
}

impl FromStr for SchedulingStrategy {
    type Err = StrategyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fifo" => Ok(Self::Fifo),
            "priority" => Ok(Self::Priority),
            "dependencies" => Ok(Self::Dependencies),
            other => Err(StrategyParseError("scheduling strategy", other.to_owned())),
        }
    }
}

// ---------------------------------------------------------------------------
// Recovery policy
// ---------------------------------------------------------------------------

/// How the sequencer reacts to a target failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryPolicy {
    /// Cancel all remaining targets and stop.
    Stop,
    /// Mark the failed target skipped; its successors may proceed.
    Skip,
    /// Re-enqueue the failed target, up to its retry budget.
    Retry,
    /// Splice in a registered alternative target; stop if none exists.
    Alternative,
}

impl fmt::Display for RecoveryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stop => "stop",
            Self::Skip => "skip",
            Self::Retry => "retry",
            Self::Alternative => "alternative",
        };
        f.write_str(s)
    }
}

impl FromStr for RecoveryPolicy {
    type Err = StrategyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stop" => Ok(Self::Stop),
            "skip" => Ok(Self::Skip),
            "retry" => Ok(Self::Retry),
            "alternative" => Ok(Self::Alternative),
            other => Err(StrategyParseError("recovery policy", other.to_owned())),
        }
    }
}

// ---------------------------------------------------------------------------

/// Error returned when parsing an invalid strategy or policy string.
#[derive(Debug, Clone)]
pub struct StrategyParseError(pub &'static str, pub String);

impl fmt::Display for StrategyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {:?}", self.0, self.1)
    }
}

impl std::error::Error for StrategyParseError {}
