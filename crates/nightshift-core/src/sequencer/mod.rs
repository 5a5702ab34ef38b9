//! DAG-aware sequencer: drives a plan of targets to completion by spawning
//! workers in dependency order, enforcing concurrency and resource limits,
//! and applying the configured recovery policy to failures.

pub mod callbacks;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use nightshift_types::{
    ExecutionStrategy, RecoveryPolicy, RetryPolicy, SchedulingStrategy, TargetStatus,
    TaskErrorKind, TaskStatus,
};

use crate::factory::TaskFactory;
use crate::graph::{DependencyGraph, GraphError};
use crate::metrics::MetricsCollector;
use crate::plan::{self, PlanDocument, PlanParseError, PlanRetry, PlanTarget, PlanTask};
use crate::resources::{ResourceGuard, ResourceLimits};
use crate::target::Target;
use callbacks::Callbacks;

/// How long the controller waits for in-flight workers after cancellation.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Idle sleep when nothing is ready and nothing is running.
const IDLE_POLL: Duration = Duration::from_millis(50);

/// Consecutive low-CPU admissions before the adaptive limit doubles.
const ADAPTIVE_WIDEN_STREAK: u32 = 3;

/// Errors from sequencer configuration and plan loading.
#[derive(Debug, thiserror::Error)]
pub enum SequencerError {
    #[error("sequence is already executing")]
    AlreadyRunning,

    #[error("duplicate target name: {0:?}")]
    DuplicateTarget(String),

    #[error("unknown target: {0:?}")]
    UnknownTarget(String),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Plan(#[from] PlanParseError),

    #[error(transparent)]
    Factory(#[from] crate::factory::FactoryError),
}

/// Result of a full sequence execution.
#[derive(Debug, Clone)]
pub struct SequenceSummary {
    pub run_id: Uuid,
    pub completed: usize,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
    pub cancelled: Vec<String>,
    /// `Timeout` when the global timeout fired, `Cancelled` when the run
    /// was cancelled (host request or stop recovery), `None` otherwise.
    pub error: Option<TaskErrorKind>,
    pub elapsed: Duration,
}

/// Message sent from a worker back to the controller loop.
struct TargetDone {
    name: String,
    status: TargetStatus,
}

/// The exposure sequencer.
///
/// Owns the target set and dependency graph; `execute_all` runs the
/// dispatch loop on the calling task (the controller) and spawns one
/// worker per dispatched target. At most one `execute_all` may be
/// outstanding.
pub struct Sequencer {
    targets: Vec<Arc<Target>>,
    graph: DependencyGraph,
    alternatives: HashMap<String, Arc<Target>>,
    strategy: ExecutionStrategy,
    scheduling: SchedulingStrategy,
    recovery: RecoveryPolicy,
    max_concurrent: usize,
    global_timeout: Option<Duration>,
    guard: ResourceGuard,
    metrics: Arc<MetricsCollector>,
    callbacks: Callbacks,
    cancel: Mutex<CancellationToken>,
    running: Arc<AtomicBool>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    plan_extra: Map<String, Value>,
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl Sequencer {
    pub fn new() -> Self {
        Self {
            targets: Vec::new(),
            graph: DependencyGraph::new(),
            alternatives: HashMap::new(),
            strategy: ExecutionStrategy::Parallel,
            scheduling: SchedulingStrategy::Fifo,
            recovery: RecoveryPolicy::Stop,
            max_concurrent: 1,
            global_timeout: None,
            guard: ResourceGuard::new(ResourceLimits::default()),
            metrics: Arc::new(MetricsCollector::new()),
            callbacks: Callbacks::default(),
            cancel: Mutex::new(CancellationToken::new()),
            running: Arc::new(AtomicBool::new(false)),
            started_at: Mutex::new(None),
            plan_extra: Map::new(),
        }
    }

    /// Build a sequencer from a validated plan document, constructing
    /// tasks through the factory.
    pub fn from_plan(factory: &TaskFactory, doc: &PlanDocument) -> Result<Self, SequencerError> {
        plan::validate(doc)?;

        let mut seq = Self::new();
        seq.strategy = doc.strategy()?;
        seq.scheduling = doc.scheduling()?;
        seq.recovery = doc.recovery()?;
        seq.max_concurrent = doc.max_concurrent.max(1);
        seq.global_timeout = doc.global_timeout();
        seq.plan_extra = doc.extra.clone();

        for plan_target in &doc.targets {
            let mut target = Target::new(&plan_target.name);
            target.set_enabled(plan_target.enabled);
            target.set_priority(plan_target.priority);
            target.set_cooldown(Duration::from_millis(plan_target.cooldown_ms));
            target.set_max_retries(plan_target.max_retries);
            target.set_params(plan_target.params.clone());
            target.set_extra(plan_target.extra.clone());

            for plan_task in &plan_target.tasks {
                let config = Value::Object(plan_task.params.clone());
                let mut task = factory
                    .create(&plan_task.type_tag, &plan_task.name, &config)?
                    .with_params(plan_task.params.clone())
                    .with_extra(plan_task.extra.clone());
                if let Some(ms) = plan_task.timeout_ms {
                    task = task.with_timeout(Duration::from_millis(ms));
                }
                if let Some(retry) = &plan_task.retry {
                    task = task.with_retry(retry.to_policy()?);
                }
                target.add_task(task);
            }
            seq.add_target(target)?;
        }

        for (from, to) in &doc.dependencies {
            seq.add_dependency(from, to)?;
        }
        Ok(seq)
    }

    /// Export the current plan as a JSON document. Unknown fields captured
    /// at import time are preserved.
    pub fn export_plan(&self) -> PlanDocument {
        PlanDocument {
            targets: self
                .targets
                .iter()
                .map(|t| PlanTarget {
                    name: t.name().to_owned(),
                    enabled: t.is_enabled(),
                    priority: t.priority(),
                    cooldown_ms: t.cooldown().as_millis() as u64,
                    max_retries: t.max_retries(),
                    params: t.params().clone(),
                    tasks: t
                        .tasks()
                        .iter()
                        .map(|task| PlanTask {
                            name: task.name().to_owned(),
                            type_tag: task.type_tag().to_owned(),
                            params: task.params().clone(),
                            timeout_ms: task.timeout().map(|d| d.as_millis() as u64),
                            retry: (task.retry() != RetryPolicy::default())
                                .then(|| PlanRetry::from_policy(task.retry())),
                            extra: task.extra().clone(),
                        })
                        .collect(),
                    extra: t.extra().clone(),
                })
                .collect(),
            dependencies: self.graph.edges(),
            strategy: self.strategy.to_string(),
            scheduling: self.scheduling.to_string(),
            recovery: self.recovery.to_string(),
            max_concurrent: self.max_concurrent,
            global_timeout_ms: self.global_timeout.map(|d| d.as_millis() as u64),
            extra: self.plan_extra.clone(),
        }
    }

    // -- configuration ------------------------------------------------------

    /// Register a target. Names must be unique across the plan.
    pub fn add_target(&mut self, target: Target) -> Result<(), SequencerError> {
        if self.graph.contains(target.name()) {
            return Err(SequencerError::DuplicateTarget(target.name().to_owned()));
        }
        self.graph.add_node(target.name());
        self.targets.push(Arc::new(target));
        Ok(())
    }

    /// Declare that `from` must finish before `to` may start.
    pub fn add_dependency(&mut self, from: &str, to: &str) -> Result<(), SequencerError> {
        if !self.graph.contains(from) {
            return Err(SequencerError::UnknownTarget(from.to_owned()));
        }
        if !self.graph.contains(to) {
            return Err(SequencerError::UnknownTarget(to.to_owned()));
        }
        self.graph.add_edge(from, to)?;
        Ok(())
    }

    /// Register an alternative to splice in when `primary` fails under
    /// [`RecoveryPolicy::Alternative`].
    pub fn register_alternative(
        &mut self,
        primary: &str,
        alternative: Target,
    ) -> Result<(), SequencerError> {
        if !self.graph.contains(primary) {
            return Err(SequencerError::UnknownTarget(primary.to_owned()));
        }
        if self.graph.contains(alternative.name()) {
            return Err(SequencerError::DuplicateTarget(
                alternative.name().to_owned(),
            ));
        }
        self.alternatives
            .insert(primary.to_owned(), Arc::new(alternative));
        Ok(())
    }

    pub fn set_strategy(&mut self, strategy: ExecutionStrategy) {
        self.strategy = strategy;
    }

    pub fn set_scheduling_strategy(&mut self, scheduling: SchedulingStrategy) {
        self.scheduling = scheduling;
    }

    pub fn set_recovery_policy(&mut self, recovery: RecoveryPolicy) {
        self.recovery = recovery;
    }

    pub fn set_max_concurrent(&mut self, max_concurrent: usize) {
        self.max_concurrent = max_concurrent.max(1);
    }

    pub fn set_global_timeout(&mut self, timeout: Option<Duration>) {
        self.global_timeout = timeout;
    }

    pub fn set_resource_limits(&mut self, limits: ResourceLimits) {
        self.guard = ResourceGuard::new(limits);
    }

    /// Mutable access to the host callback surface.
    pub fn callbacks_mut(&mut self) -> &mut Callbacks {
        &mut self.callbacks
    }

    // -- queries ------------------------------------------------------------

    pub fn strategy(&self) -> ExecutionStrategy {
        self.strategy
    }

    pub fn scheduling_strategy(&self) -> SchedulingStrategy {
        self.scheduling
    }

    pub fn recovery_policy(&self) -> RecoveryPolicy {
        self.recovery
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        Arc::clone(&self.metrics)
    }

    pub fn target_names(&self) -> Vec<String> {
        self.targets.iter().map(|t| t.name().to_owned()).collect()
    }

    pub fn target(&self, name: &str) -> Option<Arc<Target>> {
        self.targets
            .iter()
            .find(|t| t.name() == name)
            .map(Arc::clone)
    }

    pub fn target_status(&self, name: &str) -> Option<TargetStatus> {
        self.target(name).map(|t| t.status())
    }

    /// Dependencies of a target (its direct predecessors).
    pub fn target_dependencies(&self, name: &str) -> Vec<String> {
        self.graph.predecessors(name)
    }

    /// Whether a target's dependencies are all satisfied.
    pub fn is_target_ready(&self, name: &str) -> bool {
        self.graph
            .predecessors(name)
            .iter()
            .all(|p| {
                self.target_status(p)
                    .is_some_and(TargetStatus::satisfies_dependency)
            })
    }

    pub fn get_failed_targets(&self) -> Vec<String> {
        self.targets
            .iter()
            .filter(|t| t.status() == TargetStatus::Failed)
            .map(|t| t.name().to_owned())
            .collect()
    }

    /// Mean progress over all targets.
    pub fn progress(&self) -> f64 {
        if self.targets.is_empty() {
            return 1.0;
        }
        let total: f64 = self.targets.iter().map(|t| t.progress()).sum();
        total / self.targets.len() as f64
    }

    /// One-shot JSON view of the sequencer state and metrics.
    pub fn execution_stats(&self) -> Value {
        let mut by_status: HashMap<&'static str, usize> = HashMap::new();
        for t in &self.targets {
            let key = match t.status() {
                TargetStatus::Pending => "pending",
                TargetStatus::InProgress => "in_progress",
                TargetStatus::Completed => "completed",
                TargetStatus::Failed => "failed",
                TargetStatus::Skipped => "skipped",
                TargetStatus::Cancelled => "cancelled",
            };
            *by_status.entry(key).or_default() += 1;
        }
        json!({
            "running": self.is_running(),
            "started_at": self
                .started_at
                .lock()
                .expect("started_at poisoned")
                .map(|t| t.to_rfc3339()),
            "strategy": self.strategy.to_string(),
            "scheduling": self.scheduling.to_string(),
            "recovery": self.recovery.to_string(),
            "progress": self.progress(),
            "targets": {
                "total": self.targets.len(),
                "pending": by_status.get("pending").copied().unwrap_or(0),
                "in_progress": by_status.get("in_progress").copied().unwrap_or(0),
                "completed": by_status.get("completed").copied().unwrap_or(0),
                "failed": by_status.get("failed").copied().unwrap_or(0),
                "skipped": by_status.get("skipped").copied().unwrap_or(0),
                "cancelled": by_status.get("cancelled").copied().unwrap_or(0),
            },
            "metrics": self.metrics.snapshot(),
        })
    }

    // -- control ------------------------------------------------------------

    /// Request a graceful stop of the current run. Idempotent; a no-op
    /// when nothing is executing.
    pub fn stop(&self) {
        if !self.is_running() {
            return;
        }
        tracing::info!("sequence stop requested");
        self.cancel.lock().expect("cancel token poisoned").cancel();
    }

    /// Request cooperative cancellation of the current run. Idempotent.
    pub fn cancel(&self) {
        if !self.is_running() {
            return;
        }
        tracing::info!("sequence cancellation requested");
        self.cancel.lock().expect("cancel token poisoned").cancel();
    }

    /// A handle that cancels the current (or next) run when triggered.
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.lock().expect("cancel token poisoned").clone()
    }

    // -- execution ----------------------------------------------------------

    /// Drive every registered target to a terminal status.
    ///
    /// Returns normally in all cases; failures surface through target
    /// statuses, [`Self::get_failed_targets`], and the metrics snapshot.
    /// Only one execution may be outstanding at a time.
    pub async fn execute_all(&mut self) -> Result<SequenceSummary, SequencerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SequencerError::AlreadyRunning);
        }
        let summary = self.run().await;
        self.running.store(false, Ordering::SeqCst);
        Ok(summary)
    }

    async fn run(&mut self) -> SequenceSummary {
        let run_id = Uuid::new_v4();
        // Reuse the current token so handles fetched before the run stay
        // valid; only a token consumed by a previous run is replaced.
        let cancel = {
            let mut guard = self.cancel.lock().expect("cancel token poisoned");
            if guard.is_cancelled() {
                *guard = CancellationToken::new();
            }
            guard.clone()
        };
        *self.started_at.lock().expect("started_at poisoned") = Some(Utc::now());

        let started = Instant::now();
        let deadline = self
            .global_timeout
            .map(|t| tokio::time::Instant::now() + t);
        let mut timed_out = false;

        tracing::info!(
            run_id = %run_id,
            targets = self.targets.len(),
            strategy = %self.strategy,
            scheduling = %self.scheduling,
            recovery = %self.recovery,
            max_concurrent = self.max_concurrent,
            "sequence started"
        );
        self.callbacks.fire_sequence_start();

        let (tx, mut rx) = mpsc::channel::<TargetDone>(self.max_concurrent * 2);
        let mut in_flight: HashMap<String, Instant> = HashMap::new();
        let mut recovery_attempts: HashMap<String, u32> = HashMap::new();
        let mut adaptive_limit: usize = 1;
        let mut low_streak: u32 = 0;

        loop {
            // Global timeout: request cancellation once and drain below.
            if let Some(d) = deadline {
                if !timed_out && tokio::time::Instant::now() >= d {
                    tracing::warn!(run_id = %run_id, "global timeout reached, cancelling");
                    timed_out = true;
                    cancel.cancel();
                }
            }

            // Cancellation: settle never-started targets, then drain
            // in-flight workers.
            if cancel.is_cancelled() {
                let reason = if timed_out {
                    "sequence timed out"
                } else {
                    "sequence cancelled"
                };
                for t in &self.targets {
                    if !t.status().is_terminal() && !in_flight.contains_key(t.name()) {
                        t.mark_cancelled(reason);
                        self.metrics.target_cancelled();
                        self.callbacks
                            .fire_target_end(t.name(), TargetStatus::Cancelled);
                    }
                }

                let drain_deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
                while !in_flight.is_empty() {
                    match tokio::time::timeout_at(drain_deadline, rx.recv()).await {
                        Ok(Some(done)) => {
                            self.finish_target(done, &mut in_flight, &mut recovery_attempts, true);
                        }
                        _ => {
                            tracing::warn!(
                                run_id = %run_id,
                                remaining = in_flight.len(),
                                "drain timeout expired with workers still in flight"
                            );
                            break;
                        }
                    }
                }
                break;
            }

            // Disabled targets skip themselves without dispatch.
            for t in &self.targets {
                if t.status() == TargetStatus::Pending
                    && !t.is_enabled()
                    && !in_flight.contains_key(t.name())
                {
                    tracing::info!(target = t.name(), "target disabled, skipping");
                    t.mark_skipped("target disabled");
                    self.metrics.target_skipped();
                    self.callbacks
                        .fire_target_end(t.name(), TargetStatus::Skipped);
                }
            }

            // Termination: every target terminal and nothing in flight.
            if in_flight.is_empty() && self.targets.iter().all(|t| t.status().is_terminal()) {
                break;
            }

            // Ready pool: pending, enabled, dependencies satisfied.
            let done: HashSet<String> = self
                .targets
                .iter()
                .filter(|t| t.status().satisfies_dependency())
                .map(|t| t.name().to_owned())
                .collect();
            let mut pool: Vec<Arc<Target>> = self
                .graph
                .ready_nodes(&done)
                .into_iter()
                .filter_map(|name| self.target(&name))
                .filter(|t| {
                    t.status() == TargetStatus::Pending
                        && t.is_enabled()
                        && !in_flight.contains_key(t.name())
                })
                .collect();
            self.order_pool(&mut pool);

            let effective = self.effective_concurrency(adaptive_limit);
            let mut denied = false;
            let mut dispatched = 0usize;

            for target in pool {
                if in_flight.len() >= effective {
                    break;
                }
                if !self.guard.admit() {
                    denied = true;
                    if self.strategy == ExecutionStrategy::Adaptive {
                        adaptive_limit = (adaptive_limit / 2).max(1);
                        low_streak = 0;
                    }
                    break;
                }
                if self.strategy == ExecutionStrategy::Adaptive {
                    if self.guard.cpu_low() {
                        low_streak += 1;
                        if low_streak >= ADAPTIVE_WIDEN_STREAK {
                            adaptive_limit = (adaptive_limit * 2).min(self.max_concurrent);
                            low_streak = 0;
                        }
                    } else {
                        low_streak = 0;
                    }
                }

                tracing::info!(target = target.name(), "dispatching target");
                self.metrics.target_started();
                self.callbacks
                    .fire_target_start(target.name(), TargetStatus::InProgress);
                in_flight.insert(target.name().to_owned(), Instant::now());
                dispatched += 1;

                let worker_target = Arc::clone(&target);
                let worker_cancel = cancel.clone();
                let worker_tx = tx.clone();
                tokio::spawn(async move {
                    let status = worker_target.execute(&worker_cancel).await;
                    let _ = worker_tx
                        .send(TargetDone {
                            name: worker_target.name().to_owned(),
                            status,
                        })
                        .await;
                });
            }

            self.fire_progress(&in_flight);

            // Wait for a completion, cancellation, or the deadline.
            if !in_flight.is_empty() {
                tokio::select! {
                    maybe_done = rx.recv() => {
                        if let Some(done) = maybe_done {
                            self.finish_target(done, &mut in_flight, &mut recovery_attempts, false);
                            self.fire_progress(&in_flight);
                        }
                    }
                    _ = cancel.cancelled() => {}
                    _ = sleep_until_opt(deadline), if deadline.is_some() && !timed_out => {}
                }
            } else if dispatched == 0 {
                // Nothing running and nothing launched: stall briefly.
                // Resource denial with an empty running set retries after
                // the dispatch poll interval.
                let stall = if denied {
                    self.guard.dispatch_poll()
                } else {
                    IDLE_POLL
                };
                tokio::select! {
                    _ = tokio::time::sleep(stall) => {}
                    _ = cancel.cancelled() => {}
                }
            }
        }

        let summary = self.build_summary(run_id, started.elapsed(), timed_out, &cancel);
        tracing::info!(
            run_id = %run_id,
            completed = summary.completed,
            failed = summary.failed.len(),
            skipped = summary.skipped.len(),
            cancelled = summary.cancelled.len(),
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "sequence finished"
        );
        self.callbacks.fire_sequence_end();
        summary
    }

    /// Handle a worker completion message: record metrics, then apply the
    /// recovery policy to failures. During the post-cancellation drain,
    /// recovery is disabled and failures settle as failures.
    fn finish_target(
        &mut self,
        done: TargetDone,
        in_flight: &mut HashMap<String, Instant>,
        recovery_attempts: &mut HashMap<String, u32>,
        draining: bool,
    ) {
        let started = in_flight.remove(&done.name);
        let Some(target) = self.target(&done.name) else {
            tracing::error!(target = %done.name, "completion for unknown target");
            return;
        };

        if let Some(started) = started {
            self.metrics
                .record_target_duration(&done.name, started.elapsed());
        }
        self.record_task_metrics(&target);

        match done.status {
            TargetStatus::Completed => {
                tracing::info!(target = %done.name, "target completed");
                self.metrics.target_completed();
                self.callbacks
                    .fire_target_end(&done.name, TargetStatus::Completed);
            }
            TargetStatus::Skipped => {
                self.metrics.target_skipped();
                self.callbacks
                    .fire_target_end(&done.name, TargetStatus::Skipped);
            }
            TargetStatus::Cancelled => {
                tracing::info!(target = %done.name, "target cancelled");
                self.metrics.target_cancelled();
                self.callbacks
                    .fire_target_end(&done.name, TargetStatus::Cancelled);
            }
            TargetStatus::Failed => {
                let description = target
                    .error_message()
                    .unwrap_or_else(|| "target failed".to_owned());
                self.callbacks.fire_error(&done.name, &description);

                if draining {
                    self.metrics.target_failed();
                    self.callbacks
                        .fire_target_end(&done.name, TargetStatus::Failed);
                    return;
                }
                self.apply_recovery(&target, &done.name, recovery_attempts);
            }
            TargetStatus::Pending | TargetStatus::InProgress => {
                tracing::error!(
                    target = %done.name,
                    status = %done.status,
                    "worker reported a non-terminal status"
                );
            }
        }
    }

    fn apply_recovery(
        &mut self,
        target: &Arc<Target>,
        name: &str,
        recovery_attempts: &mut HashMap<String, u32>,
    ) {
        match self.recovery {
            RecoveryPolicy::Stop => {
                tracing::warn!(target = %name, "target failed, stopping sequence");
                self.metrics.target_failed();
                self.callbacks.fire_target_end(name, TargetStatus::Failed);
                self.cancel.lock().expect("cancel token poisoned").cancel();
            }
            RecoveryPolicy::Skip => {
                tracing::warn!(target = %name, "target failed, skipping for dependents");
                target.skip_after_failure();
                self.metrics.target_skipped();
                self.callbacks.fire_target_end(name, TargetStatus::Skipped);
            }
            RecoveryPolicy::Retry => {
                let attempts = recovery_attempts.entry(name.to_owned()).or_insert(0);
                if *attempts < target.max_retries() {
                    *attempts += 1;
                    tracing::info!(
                        target = %name,
                        attempt = *attempts,
                        max_retries = target.max_retries(),
                        "target failed, re-enqueueing"
                    );
                    if let Err(err) = target.reset() {
                        tracing::error!(target = %name, error = %err, "failed to reset target for retry");
                        self.metrics.target_failed();
                        self.callbacks.fire_target_end(name, TargetStatus::Failed);
                    }
                } else {
                    tracing::warn!(target = %name, "target failed, retries exhausted");
                    self.metrics.target_failed();
                    self.callbacks.fire_target_end(name, TargetStatus::Failed);
                    self.skip_unreachable(name);
                }
            }
            RecoveryPolicy::Alternative => {
                if let Some(alternative) = self.alternatives.remove(name) {
                    let alt_name = alternative.name().to_owned();
                    tracing::info!(
                        target = %name,
                        alternative = %alt_name,
                        "target failed, splicing alternative"
                    );
                    self.metrics.target_failed();
                    self.callbacks.fire_target_end(name, TargetStatus::Failed);

                    if let Err(err) = self.graph.replace_node(name, &alt_name) {
                        tracing::error!(target = %name, error = %err, "failed to splice alternative");
                        self.cancel.lock().expect("cancel token poisoned").cancel();
                        return;
                    }
                    // The failed primary stays in the target list (terminal,
                    // for reporting); the alternative slots in right after
                    // it and takes over its graph node.
                    match self.targets.iter().position(|t| t.name() == name) {
                        Some(slot) => self.targets.insert(slot + 1, alternative),
                        None => self.targets.push(alternative),
                    }
                } else {
                    tracing::warn!(target = %name, "target failed with no alternative, stopping");
                    self.metrics.target_failed();
                    self.callbacks.fire_target_end(name, TargetStatus::Failed);
                    self.cancel.lock().expect("cancel token poisoned").cancel();
                }
            }
        }
    }

    /// Settle every pending transitive successor of a terminally failed
    /// target as skipped with a dependency annotation.
    fn skip_unreachable(&mut self, failed: &str) {
        for name in self.graph.descendants(failed) {
            if let Some(target) = self.target(&name) {
                if target.status() == TargetStatus::Pending {
                    tracing::info!(
                        target = %name,
                        predecessor = %failed,
                        "skipping target: predecessor failed"
                    );
                    target.mark_skipped(format!("predecessor {failed} failed"));
                    self.metrics.target_skipped();
                    self.callbacks.fire_target_end(&name, TargetStatus::Skipped);
                }
            }
        }
    }

    /// Aggregate per-task counters and timers for a finished target.
    fn record_task_metrics(&self, target: &Arc<Target>) {
        let mut started = 0u64;
        let mut completed = 0u64;
        let mut failed = 0u64;
        let mut cancelled = 0u64;
        for task in target.tasks() {
            started += u64::from(task.attempts());
            match task.status() {
                TaskStatus::Completed => completed += 1,
                TaskStatus::Failed => failed += 1,
                TaskStatus::Cancelled => cancelled += 1,
                _ => {}
            }
            if let Some(duration) = task.last_duration() {
                self.metrics.record_task_duration(task.name(), duration);
            }
        }
        self.metrics.add_tasks_started(started);
        self.metrics.add_tasks_completed(completed);
        self.metrics.add_tasks_failed(failed);
        self.metrics.add_tasks_cancelled(cancelled);
    }

    fn effective_concurrency(&self, adaptive_limit: usize) -> usize {
        match self.strategy {
            ExecutionStrategy::Sequential => 1,
            ExecutionStrategy::Parallel | ExecutionStrategy::Priority => self.max_concurrent,
            ExecutionStrategy::Adaptive => adaptive_limit.min(self.max_concurrent),
        }
    }

    /// Order the ready pool per the scheduling strategy. The pool is an
    /// antichain (no edges between ready nodes), so dependency ordering
    /// reduces to the priority tie-break; FIFO keeps insertion order.
    fn order_pool(&self, pool: &mut [Arc<Target>]) {
        let by_priority = matches!(
            self.scheduling,
            SchedulingStrategy::Priority | SchedulingStrategy::Dependencies
        ) || self.strategy == ExecutionStrategy::Priority;
        if by_priority {
            pool.sort_by_key(|t| std::cmp::Reverse(t.priority()));
        }
    }

    fn fire_progress(&self, in_flight: &HashMap<String, Instant>) {
        let mut running: Vec<&String> = in_flight.keys().collect();
        running.sort();
        let completed = self
            .targets
            .iter()
            .filter(|t| t.status() == TargetStatus::Completed)
            .count();
        let failed = self
            .targets
            .iter()
            .filter(|t| t.status() == TargetStatus::Failed)
            .count();
        let snapshot = json!({
            "progress": self.progress(),
            "runningTargets": running,
            "completed": completed,
            "failed": failed,
        });
        self.callbacks.fire_progress(&snapshot);
    }

    fn build_summary(
        &self,
        run_id: Uuid,
        elapsed: Duration,
        timed_out: bool,
        cancel: &CancellationToken,
    ) -> SequenceSummary {
        let mut completed = 0usize;
        let mut failed = Vec::new();
        let mut skipped = Vec::new();
        let mut cancelled = Vec::new();
        for t in &self.targets {
            match t.status() {
                TargetStatus::Completed => completed += 1,
                TargetStatus::Failed => failed.push(t.name().to_owned()),
                TargetStatus::Skipped => skipped.push(t.name().to_owned()),
                TargetStatus::Cancelled => cancelled.push(t.name().to_owned()),
                _ => {}
            }
        }
        let error = if timed_out {
            Some(TaskErrorKind::Timeout)
        } else if cancel.is_cancelled() {
            Some(TaskErrorKind::Cancelled)
        } else {
            None
        };
        SequenceSummary {
            run_id,
            completed,
            failed,
            skipped,
            cancelled,
            error,
            elapsed,
        }
    }
}

impl std::fmt::Debug for Sequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sequencer")
            .field("targets", &self.target_names())
            .field("strategy", &self.strategy)
            .field("scheduling", &self.scheduling)
            .field("recovery", &self.recovery)
            .field("max_concurrent", &self.max_concurrent)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Sleep until the optional deadline; pends forever when there is none.
async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}
