//! The task primitive: a named unit of execution with typed parameter
//! validation, a retry policy, cooperative cancellation, an optional
//! timeout, and an append-only history.
//!
//! A task body is an opaque async callable over validated parameters. The
//! driver in [`Task::execute`] owns the lifecycle: validate, transition
//! pending -> running, run the action under the timeout, then settle into
//! a terminal status or back off and retry.

pub mod state;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use nightshift_types::{RetryPolicy, TaskError, TaskErrorKind, TaskStatus};

use crate::params::{validate_params, ParamError, ParamSpec};
use state::TaskStateMachine;

/// Boxed async task body. Receives the validated parameter map, the
/// cancellation token, and a progress reporter via [`TaskContext`].
pub type TaskAction =
    Arc<dyn Fn(TaskContext) -> BoxFuture<'static, Result<(), TaskError>> + Send + Sync>;

/// One entry in a task's append-only history.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub event: String,
    pub message: String,
}

/// Context handed to a running task body.
///
/// Bodies observe the cancellation token at cooperative checkpoints and
/// report progress in `[0, 1]`. Progress is clamped monotonically
/// non-decreasing within one attempt.
#[derive(Clone)]
pub struct TaskContext {
    params: Map<String, Value>,
    cancel: CancellationToken,
    state: Arc<Mutex<TaskState>>,
}

impl TaskContext {
    /// The validated, default-filled parameter map.
    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    /// Look up a single parameter.
    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    /// The cancellation token for this execution.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Return an error if cancellation has been requested. Call this at
    /// cooperative checkpoints.
    pub fn checkpoint(&self) -> Result<(), TaskError> {
        if self.cancel.is_cancelled() {
            Err(TaskError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep that wakes immediately on cancellation.
    pub async fn sleep(&self, duration: Duration) -> Result<(), TaskError> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.cancel.cancelled() => Err(TaskError::Cancelled),
        }
    }

    /// Report progress in `[0, 1]`. Values below the current progress of
    /// this attempt are ignored.
    pub fn report_progress(&self, fraction: f64) {
        let mut st = self.state.lock().expect("task state poisoned");
        if st.status == TaskStatus::Running {
            let clamped = fraction.clamp(0.0, 1.0);
            if clamped > st.progress {
                st.progress = clamped;
            }
        }
    }
}

/// Mutable runtime state of a task, behind a task-local lock.
#[derive(Debug)]
struct TaskState {
    status: TaskStatus,
    error: Option<TaskErrorKind>,
    error_message: Option<String>,
    progress: f64,
    attempts: u32,
    history: Vec<HistoryEntry>,
    last_duration: Option<Duration>,
}

impl TaskState {
    fn new() -> Self {
        Self {
            status: TaskStatus::Pending,
            error: None,
            error_message: None,
            progress: 0.0,
            attempts: 0,
            history: Vec::new(),
            last_duration: None,
        }
    }

    fn push_history(&mut self, event: &str, message: impl Into<String>) {
        self.history.push(HistoryEntry {
            timestamp: Utc::now(),
            event: event.to_owned(),
            message: message.into(),
        });
    }

    /// Apply a status transition, recording it in the history. An edge
    /// outside the legal relation is an internal error and leaves the
    /// state untouched.
    fn transition(
        &mut self,
        to: TaskStatus,
        event: &str,
        message: impl Into<String>,
    ) -> Result<(), TaskError> {
        if !TaskStateMachine::is_valid_transition(self.status, to) {
            return Err(TaskError::Internal(format!(
                "illegal task transition {} -> {}",
                self.status, to
            )));
        }
        self.status = to;
        self.push_history(event, message);
        Ok(())
    }
}

/// A single executable step within a target.
pub struct Task {
    name: String,
    type_tag: String,
    schema: Vec<ParamSpec>,
    params: Map<String, Value>,
    timeout: Option<Duration>,
    retry: RetryPolicy,
    action: TaskAction,
    cancel: Mutex<CancellationToken>,
    state: Arc<Mutex<TaskState>>,
    extra: Map<String, Value>,
}

impl Task {
    /// Create a task from an async closure.
    pub fn new<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        Self::from_action(
            name,
            Arc::new(move |ctx| -> BoxFuture<'static, Result<(), TaskError>> {
                Box::pin(body(ctx))
            }),
        )
    }

    /// Create a task from a pre-boxed action.
    pub fn from_action(name: impl Into<String>, action: TaskAction) -> Self {
        Self {
            name: name.into(),
            type_tag: String::new(),
            schema: Vec::new(),
            params: Map::new(),
            timeout: None,
            retry: RetryPolicy::default(),
            action,
            cancel: Mutex::new(CancellationToken::new()),
            state: Arc::new(Mutex::new(TaskState::new())),
            extra: Map::new(),
        }
    }

    pub fn with_type_tag(mut self, tag: impl Into<String>) -> Self {
        self.type_tag = tag.into();
        self
    }

    /// Append a parameter declaration to the schema.
    pub fn with_param_spec(mut self, spec: ParamSpec) -> Self {
        self.schema.push(spec);
        self
    }

    pub fn with_schema(mut self, schema: Vec<ParamSpec>) -> Self {
        self.schema = schema;
        self
    }

    /// Task-level configured parameters; these override target-level
    /// parameters at execute time.
    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params = params;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Unknown plan-document fields carried through round-trips.
    pub fn with_extra(mut self, extra: Map<String, Value>) -> Self {
        self.extra = extra;
        self
    }

    // -- accessors ----------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    pub fn schema(&self) -> &[ParamSpec] {
        &self.schema
    }

    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }

    pub fn extra(&self) -> &Map<String, Value> {
        &self.extra
    }

    pub fn status(&self) -> TaskStatus {
        self.state.lock().expect("task state poisoned").status
    }

    pub fn error_kind(&self) -> Option<TaskErrorKind> {
        self.state.lock().expect("task state poisoned").error
    }

    pub fn error_message(&self) -> Option<String> {
        self.state
            .lock()
            .expect("task state poisoned")
            .error_message
            .clone()
    }

    pub fn progress(&self) -> f64 {
        self.state.lock().expect("task state poisoned").progress
    }

    pub fn attempts(&self) -> u32 {
        self.state.lock().expect("task state poisoned").attempts
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.state
            .lock()
            .expect("task state poisoned")
            .history
            .clone()
    }

    /// Wall time of the most recent completed execution, if any.
    pub fn last_duration(&self) -> Option<Duration> {
        self.state.lock().expect("task state poisoned").last_duration
    }

    /// Validate a parameter map against this task's schema.
    pub fn validate(&self, params: &Map<String, Value>) -> Result<Map<String, Value>, Vec<ParamError>> {
        validate_params(&self.schema, params)
    }

    // -- lifecycle ----------------------------------------------------------

    /// Request cooperative cancellation. The running body observes the
    /// token at its checkpoints; the status becomes `Cancelled` only once
    /// the body returns. A no-op on a task already in a terminal status.
    pub fn cancel(&self) {
        if self.status().is_terminal() {
            return;
        }
        self.cancel.lock().expect("cancel token poisoned").cancel();
    }

    /// Mark a pending task skipped (externally decided, e.g. a disabled
    /// step). Progress counts as complete.
    pub fn mark_skipped(&self, reason: &str) -> Result<(), TaskError> {
        let mut st = self.state.lock().expect("task state poisoned");
        if st.status != TaskStatus::Pending {
            return Err(TaskError::Internal(format!(
                "cannot skip task {} in status {}",
                self.name, st.status
            )));
        }
        st.transition(TaskStatus::Skipped, "skipped", reason)?;
        st.progress = 1.0;
        Ok(())
    }

    /// Install a fresh cancellation token on a pending task whose token
    /// was consumed, so a target-level restart does not see a stale
    /// cancellation.
    pub(crate) fn refresh_cancel(&self) {
        if self.status() != TaskStatus::Pending {
            return;
        }
        let mut token = self.cancel.lock().expect("cancel token poisoned");
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
    }

    /// Reset a terminal task back to pending. History is kept; error,
    /// progress, and the attempt counter are cleared, and a fresh
    /// cancellation token is installed.
    pub fn reset(&self) -> Result<(), TaskError> {
        let mut st = self.state.lock().expect("task state poisoned");
        if !st.status.is_terminal() {
            return Err(TaskError::Internal(format!(
                "cannot reset task {} in status {}",
                self.name, st.status
            )));
        }
        st.status = TaskStatus::Pending;
        st.error = None;
        st.error_message = None;
        st.progress = 0.0;
        st.attempts = 0;
        st.push_history("reset", "reset to pending");
        drop(st);

        *self.cancel.lock().expect("cancel token poisoned") = CancellationToken::new();
        Ok(())
    }

    /// Execute the task to a terminal status.
    ///
    /// `base_params` are target-level parameters; the task's own configured
    /// parameters override them, and the merged map is validated against
    /// the schema before the body runs. Cancellation of `parent` is
    /// forwarded into the task's own token so the body and any backoff
    /// sleep wake promptly.
    pub async fn execute(
        &self,
        base_params: &Map<String, Value>,
        parent: &CancellationToken,
    ) -> Result<(), TaskError> {
        // Merge: task-specific overrides target-level.
        let mut merged = base_params.clone();
        for (k, v) in &self.params {
            merged.insert(k.clone(), v.clone());
        }

        let normalized = match validate_params(&self.schema, &merged) {
            Ok(map) => map,
            Err(errors) => {
                let err = TaskError::InvalidParameter {
                    errors: errors.iter().map(ToString::to_string).collect(),
                };
                let mut st = self.state.lock().expect("task state poisoned");
                if st.status == TaskStatus::Pending {
                    st.transition(TaskStatus::Running, "running", "validation")?;
                    st.attempts += 1;
                    st.transition(TaskStatus::Failed, "failed", err.to_string())?;
                    st.error = Some(TaskErrorKind::InvalidParameter);
                    st.error_message = Some(err.to_string());
                }
                tracing::warn!(task = %self.name, error = %err, "parameter validation failed");
                return Err(err);
            }
        };

        let own = self.cancel.lock().expect("cancel token poisoned").clone();

        // Forward parent cancellation into the task token, then park so the
        // select below only resolves when the action itself returns.
        let propagate = {
            let parent = parent.clone();
            let own = own.clone();
            async move {
                parent.cancelled().await;
                own.cancel();
                std::future::pending::<()>().await
            }
        };
        tokio::pin!(propagate);

        loop {
            // Cancelled before this attempt even started: leave the status
            // as-is (the task never ran) and report upward.
            if own.is_cancelled() {
                let mut st = self.state.lock().expect("task state poisoned");
                st.push_history("cancelled", "cancellation requested before start");
                return Err(TaskError::Cancelled);
            }

            let attempt = {
                let mut st = self.state.lock().expect("task state poisoned");
                if st.status != TaskStatus::Pending {
                    return Err(TaskError::Internal(format!(
                        "cannot execute task {} in status {}",
                        self.name, st.status
                    )));
                }
                st.attempts += 1;
                st.progress = 0.0;
                let attempt = st.attempts;
                st.transition(TaskStatus::Running, "running", format!("attempt {attempt} started"))?;
                attempt
            };

            tracing::debug!(task = %self.name, attempt, "task attempt started");

            let ctx = TaskContext {
                params: normalized.clone(),
                cancel: own.clone(),
                state: Arc::clone(&self.state),
            };

            let started = Instant::now();
            let action_fut = (self.action)(ctx);
            let result = tokio::select! {
                r = run_with_timeout(self.timeout, action_fut) => r,
                _ = &mut propagate => unreachable!("propagate future never completes"),
            };
            let elapsed = started.elapsed();

            match result {
                Ok(()) => {
                    let mut st = self.state.lock().expect("task state poisoned");
                    st.transition(TaskStatus::Completed, "completed", format!("attempt {attempt} succeeded"))?;
                    st.progress = 1.0;
                    st.last_duration = Some(elapsed);
                    tracing::info!(task = %self.name, attempt, elapsed_ms = elapsed.as_millis() as u64, "task completed");
                    return Ok(());
                }
                Err(err) if err.kind() == TaskErrorKind::Cancelled => {
                    let mut st = self.state.lock().expect("task state poisoned");
                    st.transition(TaskStatus::Cancelled, "cancelled", "cancellation observed")?;
                    st.error = Some(TaskErrorKind::Cancelled);
                    st.error_message = Some(err.to_string());
                    st.last_duration = Some(elapsed);
                    tracing::info!(task = %self.name, attempt, "task cancelled");
                    return Err(err);
                }
                Err(err) => {
                    let retryable = err.is_retryable() && attempt < self.retry.max_attempts;
                    if !retryable {
                        let mut st = self.state.lock().expect("task state poisoned");
                        st.transition(TaskStatus::Failed, "failed", err.to_string())?;
                        st.error = Some(err.kind());
                        st.error_message = Some(err.to_string());
                        st.last_duration = Some(elapsed);
                        tracing::warn!(task = %self.name, attempt, error = %err, "task failed");
                        return Err(err);
                    }

                    let delay = self.retry.delay_for(attempt);
                    tracing::info!(
                        task = %self.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "task failed, backing off before retry"
                    );

                    // The task stays running through the backoff; it only
                    // returns to pending once the delay has elapsed.
                    // Cancellation during backoff is immediate.
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = own.cancelled() => {
                            let mut st = self.state.lock().expect("task state poisoned");
                            st.transition(TaskStatus::Cancelled, "cancelled", "cancelled during backoff")?;
                            st.error = Some(TaskErrorKind::Cancelled);
                            st.error_message = Some("cancelled during backoff".to_owned());
                            return Err(TaskError::Cancelled);
                        }
                    }

                    let mut st = self.state.lock().expect("task state poisoned");
                    st.transition(
                        TaskStatus::Pending,
                        "retry",
                        format!("attempt {attempt} failed ({err}), retrying after {delay:?}"),
                    )?;
                }
            }
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("type_tag", &self.type_tag)
            .field("status", &self.status())
            .field("attempts", &self.attempts())
            .finish()
    }
}

/// Run the action under the task's timeout, mapping elapsed timers to
/// [`TaskError::Timeout`].
async fn run_with_timeout(
    timeout: Option<Duration>,
    fut: BoxFuture<'static, Result<(), TaskError>>,
) -> Result<(), TaskError> {
    match timeout {
        Some(t) => match tokio::time::timeout(t, fut).await {
            Ok(result) => result,
            Err(_) => Err(TaskError::Timeout { timeout: t }),
        },
        None => fut.await,
    }
}
