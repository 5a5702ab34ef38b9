//! JSON plan documents: export/import of a full sequencer plan.
//!
//! These types map directly to the on-the-wire JSON shape and are
//! deserialized via `serde`. Unknown fields are preserved through
//! flattened extras so a round-trip never loses information; unknown enum
//! values are rejected with [`PlanParseError::InvalidFormat`].

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use nightshift_types::{
    BackoffKind, ExecutionStrategy, RecoveryPolicy, RetryPolicy, SchedulingStrategy,
};

use crate::graph::DependencyGraph;

/// Errors that can occur during plan parsing and validation.
#[derive(Debug, thiserror::Error)]
pub enum PlanParseError {
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid format: {field} has unknown value {value:?}")]
    InvalidFormat { field: &'static str, value: String },

    #[error("duplicate target name: {0:?}")]
    DuplicateTargetName(String),

    #[error("duplicate task name {task:?} in target {target:?}")]
    DuplicateTaskName { target: String, task: String },

    #[error("dependency references unknown target {0:?}")]
    UnknownDependency(String),

    #[error("dependency cycle detected at {0}")]
    CycleDetected(String),
}

/// Top-level structure of a plan document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanDocument {
    #[serde(default)]
    pub targets: Vec<PlanTarget>,
    #[serde(default)]
    pub dependencies: Vec<(String, String)>,
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default = "default_scheduling")]
    pub scheduling: String,
    #[serde(default = "default_recovery")]
    pub recovery: String,
    #[serde(default = "default_max_concurrent", rename = "maxConcurrent")]
    pub max_concurrent: usize,
    #[serde(
        default,
        rename = "globalTimeout_ms",
        skip_serializing_if = "Option::is_none"
    )]
    pub global_timeout_ms: Option<u64>,
    /// Unknown top-level fields, preserved on round-trip.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One target entry in the plan document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanTarget {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub cooldown_ms: u64,
    #[serde(default, rename = "maxRetries")]
    pub max_retries: u32,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub tasks: Vec<PlanTask>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One task entry within a plan target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanTask {
    pub name: String,
    #[serde(rename = "type")]
    pub type_tag: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<PlanRetry>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Retry policy entry within a plan task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanRetry {
    #[serde(rename = "maxAttempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff")]
    pub backoff: String,
    #[serde(default, rename = "baseDelay_ms")]
    pub base_delay_ms: u64,
}

impl PlanRetry {
    pub fn to_policy(&self) -> Result<RetryPolicy, PlanParseError> {
        let backoff: BackoffKind =
            self.backoff
                .parse()
                .map_err(|_| PlanParseError::InvalidFormat {
                    field: "retry.backoff",
                    value: self.backoff.clone(),
                })?;
        Ok(RetryPolicy::new(
            self.max_attempts,
            backoff,
            Duration::from_millis(self.base_delay_ms),
        ))
    }

    pub fn from_policy(policy: RetryPolicy) -> Self {
        Self {
            max_attempts: policy.max_attempts,
            backoff: policy.backoff.to_string(),
            base_delay_ms: policy.base_delay.as_millis() as u64,
        }
    }
}

impl PlanDocument {
    pub fn strategy(&self) -> Result<ExecutionStrategy, PlanParseError> {
        self.strategy
            .parse()
            .map_err(|_| PlanParseError::InvalidFormat {
                field: "strategy",
                value: self.strategy.clone(),
            })
    }

    pub fn scheduling(&self) -> Result<SchedulingStrategy, PlanParseError> {
        self.scheduling
            .parse()
            .map_err(|_| PlanParseError::InvalidFormat {
                field: "scheduling",
                value: self.scheduling.clone(),
            })
    }

    pub fn recovery(&self) -> Result<RecoveryPolicy, PlanParseError> {
        self.recovery
            .parse()
            .map_err(|_| PlanParseError::InvalidFormat {
                field: "recovery",
                value: self.recovery.clone(),
            })
    }

    pub fn global_timeout(&self) -> Option<Duration> {
        self.global_timeout_ms.map(Duration::from_millis)
    }
}

fn default_true() -> bool {
    true
}

fn default_strategy() -> String {
    "parallel".to_owned()
}

fn default_scheduling() -> String {
    "fifo".to_owned()
}

fn default_recovery() -> String {
    "stop".to_owned()
}

fn default_max_concurrent() -> usize {
    1
}

fn default_backoff() -> String {
    "none".to_owned()
}

/// Parse and validate a plan document from a JSON string.
pub fn parse_plan_json(content: &str) -> Result<PlanDocument, PlanParseError> {
    let doc: PlanDocument = serde_json::from_str(content)?;
    validate(&doc)?;
    Ok(doc)
}

/// Validate a parsed plan document.
pub fn validate(doc: &PlanDocument) -> Result<(), PlanParseError> {
    // Enum-valued strings must parse.
    doc.strategy()?;
    doc.scheduling()?;
    doc.recovery()?;
    if doc.max_concurrent == 0 {
        return Err(PlanParseError::InvalidFormat {
            field: "maxConcurrent",
            value: "0".to_owned(),
        });
    }

    // Unique target names.
    let mut seen = HashSet::new();
    for target in &doc.targets {
        if !seen.insert(target.name.as_str()) {
            return Err(PlanParseError::DuplicateTargetName(target.name.clone()));
        }

        // Unique task names within the target, valid retry entries.
        let mut task_names = HashSet::new();
        for task in &target.tasks {
            if !task_names.insert(task.name.as_str()) {
                return Err(PlanParseError::DuplicateTaskName {
                    target: target.name.clone(),
                    task: task.name.clone(),
                });
            }
            if let Some(retry) = &task.retry {
                retry.to_policy()?;
            }
        }
    }

    // Dependency references must exist.
    for (from, to) in &doc.dependencies {
        if !seen.contains(from.as_str()) {
            return Err(PlanParseError::UnknownDependency(from.clone()));
        }
        if !seen.contains(to.as_str()) {
            return Err(PlanParseError::UnknownDependency(to.clone()));
        }
    }

    check_for_cycles(doc)?;
    Ok(())
}

/// Detect dependency cycles by replaying the edge list into a scratch
/// [`DependencyGraph`], which rejects the edge that would close a cycle.
/// Dependency references were checked above, so the only possible failure
/// here is a cycle.
fn check_for_cycles(doc: &PlanDocument) -> Result<(), PlanParseError> {
    let mut graph = DependencyGraph::new();
    for target in &doc.targets {
        graph.add_node(&target.name);
    }
    for (from, to) in &doc.dependencies {
        graph
            .add_edge(from, to)
            .map_err(|_| PlanParseError::CycleDetected(format!("{from} -> {to}")))?;
    }
    Ok(())
}
