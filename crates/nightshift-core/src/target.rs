//! A target: a named, ordered group of tasks executed as one unit.
//!
//! Tasks run strictly in insertion order. On any task failure the whole
//! target restarts from the first task, up to `max_retries` times with a
//! cooldown sleep between attempts. A disabled target skips itself on
//! entry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use nightshift_types::{TargetStatus, TaskError, TaskStatus};

use crate::factory::{FactoryError, TaskFactory};
use crate::task::Task;

#[derive(Debug)]
struct TargetState {
    status: TargetStatus,
    attempts: u32,
    error_message: Option<String>,
}

/// An ordered task container with cooldown, retries, and an enable flag.
pub struct Target {
    name: String,
    enabled: AtomicBool,
    priority: i32,
    cooldown: Duration,
    max_retries: u32,
    params: Map<String, Value>,
    tasks: Vec<Task>,
    state: Mutex<TargetState>,
    extra: Map<String, Value>,
}

impl Target {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: AtomicBool::new(true),
            priority: 0,
            cooldown: Duration::ZERO,
            max_retries: 0,
            params: Map::new(),
            tasks: Vec::new(),
            state: Mutex::new(TargetState {
                status: TargetStatus::Pending,
                attempts: 0,
                error_message: None,
            }),
            extra: Map::new(),
        }
    }

    // -- setup --------------------------------------------------------------

    /// Append a task; tasks execute in insertion order.
    pub fn add_task(&mut self, task: Task) {
        self.tasks.push(task);
    }

    /// Populate tasks from a JSON array of `{name, type, params}` entries
    /// using the factory.
    pub fn load_tasks_from_json(
        &mut self,
        factory: &TaskFactory,
        tasks: &[Value],
    ) -> Result<(), FactoryError> {
        for entry in tasks {
            let name = entry
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| FactoryError::InvalidConfig {
                    tag: String::new(),
                    message: "task entry missing name".to_owned(),
                })?;
            let tag = entry
                .get("type")
                .and_then(Value::as_str)
                .ok_or_else(|| FactoryError::InvalidConfig {
                    tag: String::new(),
                    message: format!("task {name:?} missing type"),
                })?;
            let config = entry.get("params").cloned().unwrap_or(Value::Null);
            self.tasks.push(factory.create(tag, name, &config)?);
        }
        Ok(())
    }

    /// Target-level parameters, merged into every contained task at
    /// execute time. Task-specific parameters override these.
    pub fn set_params(&mut self, params: Map<String, Value>) {
        self.params = params;
    }

    pub fn set_cooldown(&mut self, cooldown: Duration) {
        self.cooldown = cooldown;
    }

    pub fn set_max_retries(&mut self, max_retries: u32) {
        self.max_retries = max_retries;
    }

    pub fn set_priority(&mut self, priority: i32) {
        self.priority = priority;
    }

    /// Enable or disable the target. May be flipped while a plan is
    /// registered; the flag is read when the target is dispatched.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Unknown plan-document fields carried through round-trips.
    pub fn set_extra(&mut self, extra: Map<String, Value>) {
        self.extra = extra;
    }

    // -- accessors ----------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn extra(&self) -> &Map<String, Value> {
        &self.extra
    }

    pub fn status(&self) -> TargetStatus {
        self.state.lock().expect("target state poisoned").status
    }

    pub fn attempts(&self) -> u32 {
        self.state.lock().expect("target state poisoned").attempts
    }

    pub fn error_message(&self) -> Option<String> {
        self.state
            .lock()
            .expect("target state poisoned")
            .error_message
            .clone()
    }

    /// Mean of task progresses. Completed and skipped tasks count as 1,
    /// pending as 0, running as their reported fraction, failed and
    /// cancelled as their last value.
    pub fn progress(&self) -> f64 {
        if self.tasks.is_empty() {
            return if self.status().is_terminal() { 1.0 } else { 0.0 };
        }
        let total: f64 = self.tasks.iter().map(|t| t.progress()).sum();
        total / self.tasks.len() as f64
    }

    // -- lifecycle ----------------------------------------------------------

    fn set_status(&self, status: TargetStatus, error: Option<String>) {
        let mut st = self.state.lock().expect("target state poisoned");
        st.status = status;
        if error.is_some() {
            st.error_message = error;
        }
    }

    /// Mark a pending target skipped without executing it, preserving the
    /// given reason. Used for disabled targets and skip recovery.
    pub fn mark_skipped(&self, reason: impl Into<String>) {
        let reason = reason.into();
        for task in &self.tasks {
            if task.status() == TaskStatus::Pending {
                let _ = task.mark_skipped(&reason);
            }
        }
        self.set_status(TargetStatus::Skipped, Some(reason));
    }

    /// Convert a failed target to skipped for dependency purposes, keeping
    /// the original error message.
    pub fn skip_after_failure(&self) {
        let mut st = self.state.lock().expect("target state poisoned");
        if st.status == TargetStatus::Failed {
            st.status = TargetStatus::Skipped;
        }
    }

    /// Mark a never-started target cancelled (stop recovery, sequence
    /// cancellation).
    pub fn mark_cancelled(&self, reason: impl Into<String>) {
        let mut st = self.state.lock().expect("target state poisoned");
        if !st.status.is_terminal() {
            st.status = TargetStatus::Cancelled;
            st.error_message = Some(reason.into());
        }
    }

    /// Reset the target and all its tasks back to pending for a fresh
    /// execution. Running targets cannot be reset.
    pub fn reset(&self) -> Result<(), TaskError> {
        {
            let st = self.state.lock().expect("target state poisoned");
            if st.status == TargetStatus::InProgress {
                return Err(TaskError::Internal(format!(
                    "cannot reset target {} while in progress",
                    self.name
                )));
            }
        }
        for task in &self.tasks {
            if task.status().is_terminal() {
                task.reset()?;
            } else {
                task.refresh_cancel();
            }
        }
        let mut st = self.state.lock().expect("target state poisoned");
        st.status = TargetStatus::Pending;
        st.attempts = 0;
        st.error_message = None;
        Ok(())
    }

    /// Execute all tasks in insertion order, driving the target to a
    /// terminal status.
    ///
    /// On a task failure with retry budget left, sleeps `cooldown`, resets
    /// every finished task, and restarts from the first task. Cancellation
    /// propagates to the currently running task.
    pub async fn execute(&self, cancel: &CancellationToken) -> TargetStatus {
        if !self.is_enabled() {
            tracing::info!(target = %self.name, "target disabled, skipping");
            self.mark_skipped("target disabled");
            return TargetStatus::Skipped;
        }

        self.set_status(TargetStatus::InProgress, None);
        tracing::info!(target = %self.name, tasks = self.tasks.len(), "target started");

        loop {
            match self.run_tasks_once(cancel).await {
                Ok(()) => {
                    self.set_status(TargetStatus::Completed, None);
                    tracing::info!(target = %self.name, "target completed");
                    return TargetStatus::Completed;
                }
                Err(TaskError::Cancelled) => {
                    self.set_status(
                        TargetStatus::Cancelled,
                        Some("cancelled".to_owned()),
                    );
                    tracing::info!(target = %self.name, "target cancelled");
                    return TargetStatus::Cancelled;
                }
                Err(err) => {
                    let attempts = self.attempts();
                    if attempts < self.max_retries {
                        tracing::warn!(
                            target = %self.name,
                            attempt = attempts + 1,
                            max_retries = self.max_retries,
                            error = %err,
                            "target attempt failed, cooling down before restart"
                        );

                        // Cooldown between target-level attempts only.
                        tokio::select! {
                            _ = tokio::time::sleep(self.cooldown) => {}
                            _ = cancel.cancelled() => {
                                self.set_status(
                                    TargetStatus::Cancelled,
                                    Some("cancelled during cooldown".to_owned()),
                                );
                                return TargetStatus::Cancelled;
                            }
                        }

                        // Whole-target restart: put every finished task
                        // back to pending.
                        for task in &self.tasks {
                            if task.status().is_terminal() {
                                if let Err(reset_err) = task.reset() {
                                    tracing::error!(
                                        target = %self.name,
                                        task = task.name(),
                                        error = %reset_err,
                                        "failed to reset task for target retry"
                                    );
                                }
                            } else {
                                task.refresh_cancel();
                            }
                        }
                        let mut st = self.state.lock().expect("target state poisoned");
                        st.attempts += 1;
                        continue;
                    }

                    self.set_status(TargetStatus::Failed, Some(err.to_string()));
                    tracing::warn!(target = %self.name, error = %err, "target failed");
                    return TargetStatus::Failed;
                }
            }
        }
    }

    /// One pass over the task list. Returns the first task error.
    async fn run_tasks_once(&self, cancel: &CancellationToken) -> Result<(), TaskError> {
        for task in &self.tasks {
            if cancel.is_cancelled() {
                return Err(TaskError::Cancelled);
            }
            // Tasks already settled in a previous partial pass (skipped
            // externally) don't run again.
            if task.status() == TaskStatus::Skipped {
                continue;
            }
            task.execute(&self.params, cancel).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Target")
            .field("name", &self.name)
            .field("status", &self.status())
            .field("enabled", &self.is_enabled())
            .field("priority", &self.priority)
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nightshift_types::{BackoffKind, RetryPolicy};
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    fn ok_task(name: &str) -> Task {
        Task::new(name, |_ctx| async { Ok(()) })
    }

    #[tokio::test]
    async fn initial_state() {
        let target = Target::new("m31");
        assert_eq!(target.name(), "m31");
        assert_eq!(target.status(), TargetStatus::Pending);
        assert!(target.is_enabled());
        assert_eq!(target.attempts(), 0);
    }

    #[tokio::test]
    async fn executes_tasks_in_insertion_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut target = Target::new("ordered");
        for name in ["slew", "focus", "expose"] {
            let order = Arc::clone(&order);
            let label = name.to_owned();
            target.add_task(Task::new(name, move |_ctx| {
                let order = Arc::clone(&order);
                let label = label.clone();
                async move {
                    order.lock().unwrap().push(label);
                    Ok(())
                }
            }));
        }

        let status = target.execute(&CancellationToken::new()).await;
        assert_eq!(status, TargetStatus::Completed);
        assert_eq!(
            *order.lock().unwrap(),
            vec!["slew".to_owned(), "focus".to_owned(), "expose".to_owned()]
        );
    }

    #[tokio::test]
    async fn disabled_target_is_skipped() {
        let mut target = Target::new("clouded-out");
        target.add_task(ok_task("expose"));
        target.set_enabled(false);

        let status = target.execute(&CancellationToken::new()).await;
        assert_eq!(status, TargetStatus::Skipped);
        assert!((target.progress() - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn empty_target_completes_with_full_progress() {
        let target = Target::new("placeholder");
        let status = target.execute(&CancellationToken::new()).await;
        assert_eq!(status, TargetStatus::Completed);
        assert!((target.progress() - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn failure_without_retries_fails_target() {
        let mut target = Target::new("doomed");
        target.add_task(Task::new("bad", |_ctx| async {
            Err(TaskError::Device("mount fault".into()))
        }));

        let status = target.execute(&CancellationToken::new()).await;
        assert_eq!(status, TargetStatus::Failed);
        assert!(target.error_message().unwrap().contains("mount fault"));
    }

    #[tokio::test]
    async fn retry_restarts_whole_target_from_first_task() {
        let first_runs = Arc::new(AtomicU32::new(0));
        let fail_count = Arc::new(AtomicU32::new(0));

        let mut target = Target::new("restarting");
        {
            let first_runs = Arc::clone(&first_runs);
            target.add_task(Task::new("first", move |_ctx| {
                let first_runs = Arc::clone(&first_runs);
                async move {
                    first_runs.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }));
        }
        {
            let fail_count = Arc::clone(&fail_count);
            target.add_task(Task::new("second", move |_ctx| {
                let fail_count = Arc::clone(&fail_count);
                async move {
                    if fail_count.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(TaskError::Device("transient".into()))
                    } else {
                        Ok(())
                    }
                }
            }));
        }
        target.set_max_retries(2);
        target.set_cooldown(Duration::from_millis(10));

        let status = target.execute(&CancellationToken::new()).await;
        assert_eq!(status, TargetStatus::Completed);
        // First task ran once per target attempt.
        assert_eq!(first_runs.load(Ordering::SeqCst), 2);
        assert_eq!(target.attempts(), 1);
    }

    #[tokio::test]
    async fn retries_exhausted_fail_target() {
        let mut target = Target::new("hopeless");
        target.add_task(Task::new("always-fails", |_ctx| async {
            Err(TaskError::Device("dead camera".into()))
        }));
        target.set_max_retries(1);
        target.set_cooldown(Duration::from_millis(1));

        let status = target.execute(&CancellationToken::new()).await;
        assert_eq!(status, TargetStatus::Failed);
        assert_eq!(target.attempts(), 1);
    }

    #[tokio::test]
    async fn target_params_merged_into_tasks() {
        let mut target = Target::new("params");
        target.add_task(Task::new("check", |ctx| async move {
            assert_eq!(ctx.param("filter"), Some(&json!("Ha")));
            assert_eq!(ctx.param("gain"), Some(&json!(250)));
            Ok(())
        }));
        target.set_params(
            json!({"filter": "Ha", "gain": 250})
                .as_object()
                .cloned()
                .unwrap(),
        );

        let status = target.execute(&CancellationToken::new()).await;
        assert_eq!(status, TargetStatus::Completed);
    }

    #[tokio::test]
    async fn cancellation_propagates_to_running_task() {
        let mut target = Target::new("interruptible");
        target.add_task(Task::new("long", |ctx| async move {
            ctx.sleep(Duration::from_secs(60)).await?;
            Ok(())
        }));
        let target = Arc::new(target);

        let cancel = CancellationToken::new();
        let runner = {
            let target = Arc::clone(&target);
            let cancel = cancel.clone();
            tokio::spawn(async move { target.execute(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();

        let status = runner.await.expect("join");
        assert_eq!(status, TargetStatus::Cancelled);
        assert_eq!(target.tasks()[0].status(), TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn progress_is_mean_of_tasks() {
        let mut target = Target::new("half");
        target.add_task(ok_task("done"));
        target.add_task(Task::new("stuck", |_ctx| async {
            Err(TaskError::Device("nope".into()))
        }));

        let status = target.execute(&CancellationToken::new()).await;
        assert_eq!(status, TargetStatus::Failed);
        // First completed (1.0), second failed at 0.0.
        assert!((target.progress() - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn reset_returns_target_and_tasks_to_pending() {
        let mut target = Target::new("rerun");
        target.add_task(ok_task("t1"));
        target.execute(&CancellationToken::new()).await;
        assert_eq!(target.status(), TargetStatus::Completed);

        target.reset().expect("reset ok");
        assert_eq!(target.status(), TargetStatus::Pending);
        assert_eq!(target.tasks()[0].status(), TaskStatus::Pending);
        assert_eq!(target.attempts(), 0);
    }

    #[tokio::test]
    async fn task_retry_policy_inside_target_attempt() {
        // A task with its own retry policy recovers without consuming a
        // target-level attempt.
        let calls = Arc::new(AtomicU32::new(0));
        let mut target = Target::new("inner-retry");
        {
            let calls = Arc::clone(&calls);
            target.add_task(
                Task::new("flaky", move |_ctx| {
                    let calls = Arc::clone(&calls);
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                            Err(TaskError::Device("once".into()))
                        } else {
                            Ok(())
                        }
                    }
                })
                .with_retry(RetryPolicy::new(2, BackoffKind::None, Duration::ZERO)),
            );
        }

        let status = target.execute(&CancellationToken::new()).await;
        assert_eq!(status, TargetStatus::Completed);
        assert_eq!(target.attempts(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
