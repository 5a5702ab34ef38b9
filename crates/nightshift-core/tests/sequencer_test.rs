//! Integration tests for the sequencer dispatch loop: ordering,
//! concurrency, recovery policies, timeouts, and callbacks.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use nightshift_core::resources::ResourceLimits;
use nightshift_core::sequencer::Sequencer;
use nightshift_core::target::Target;
use nightshift_core::task::Task;
use nightshift_types::{
    BackoffKind, ExecutionStrategy, RecoveryPolicy, RetryPolicy, SchedulingStrategy, TargetStatus,
    TaskError, TaskErrorKind, TaskStatus,
};

// ===========================================================================
// Helpers
// ===========================================================================

/// A sequencer that admits dispatches regardless of machine load, so
/// timing assertions stay stable on busy test hosts.
fn test_sequencer() -> Sequencer {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let mut seq = Sequencer::new();
    seq.set_resource_limits(ResourceLimits {
        cpu_ceiling_pct: 101.0,
        ..ResourceLimits::default()
    });
    seq
}

/// Records labelled timestamps from inside task bodies.
#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<(String, Instant)>>>);

impl Recorder {
    fn mark(&self, label: &str) {
        self.0
            .lock()
            .unwrap()
            .push((label.to_owned(), Instant::now()));
    }

    fn time_of(&self, label: &str) -> Instant {
        self.0
            .lock()
            .unwrap()
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, t)| *t)
            .unwrap_or_else(|| panic!("no mark for {label:?}"))
    }

    fn labels(&self) -> Vec<String> {
        self.0.lock().unwrap().iter().map(|(l, _)| l.clone()).collect()
    }
}

/// A target with one task that sleeps then succeeds, marking start and end.
fn sleeping_target(name: &str, sleep: Duration, recorder: &Recorder) -> Target {
    let mut target = Target::new(name);
    let recorder = recorder.clone();
    let label = name.to_owned();
    target.add_task(Task::new(format!("{name}-work"), move |ctx| {
        let recorder = recorder.clone();
        let label = label.clone();
        async move {
            recorder.mark(&format!("{label}:start"));
            ctx.sleep(sleep).await?;
            recorder.mark(&format!("{label}:end"));
            Ok(())
        }
    }));
    target
}

/// A target whose single task always fails with a device error.
fn failing_target(name: &str) -> Target {
    let mut target = Target::new(name);
    target.add_task(Task::new(format!("{name}-work"), |_ctx| async {
        Err(TaskError::Device("simulated device failure".into()))
    }));
    target
}

/// Track the maximum number of concurrently running targets via the
/// progress callback.
fn track_max_running(seq: &mut Sequencer) -> Arc<AtomicUsize> {
    let max_running = Arc::new(AtomicUsize::new(0));
    let tracker = Arc::clone(&max_running);
    seq.callbacks_mut().set_progress(move |snapshot: &Value| {
        let running = snapshot["runningTargets"]
            .as_array()
            .map(|a| a.len())
            .unwrap_or(0);
        tracker.fetch_max(running, Ordering::SeqCst);
    });
    max_running
}

fn assert_all_terminal(seq: &Sequencer) {
    for name in seq.target_names() {
        let status = seq.target_status(&name).unwrap();
        assert!(
            status.is_terminal(),
            "target {name} ended non-terminal: {status}"
        );
    }
}

// ===========================================================================
// S1 -- linear plan
// ===========================================================================

#[tokio::test]
async fn linear_plan_runs_in_dependency_order() {
    let recorder = Recorder::default();
    let mut seq = test_sequencer();
    seq.set_scheduling_strategy(SchedulingStrategy::Fifo);
    seq.set_max_concurrent(4);

    for name in ["a", "b", "c"] {
        seq.add_target(sleeping_target(name, Duration::from_millis(10), &recorder))
            .unwrap();
    }
    seq.add_dependency("a", "b").unwrap();
    seq.add_dependency("b", "c").unwrap();

    let max_running = track_max_running(&mut seq);
    let started = Instant::now();
    let summary = seq.execute_all().await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(summary.completed, 3);
    assert!(summary.failed.is_empty());
    assert_all_terminal(&seq);

    // Dependency order: a finished before b started, b before c.
    assert!(recorder.time_of("a:end") <= recorder.time_of("b:start"));
    assert!(recorder.time_of("b:end") <= recorder.time_of("c:start"));

    // The chain serializes execution even with a wide concurrency cap.
    assert!(max_running.load(Ordering::SeqCst) <= 1);
    assert!(elapsed >= Duration::from_millis(30));
}

// ===========================================================================
// S2 -- parallel fan-out
// ===========================================================================

#[tokio::test]
async fn fan_out_runs_children_concurrently() {
    let recorder = Recorder::default();
    let mut seq = test_sequencer();
    seq.set_strategy(ExecutionStrategy::Parallel);
    seq.set_max_concurrent(3);

    for name in ["root", "x", "y", "z"] {
        seq.add_target(sleeping_target(name, Duration::from_millis(50), &recorder))
            .unwrap();
    }
    for child in ["x", "y", "z"] {
        seq.add_dependency("root", child).unwrap();
    }

    let max_running = track_max_running(&mut seq);
    let started = Instant::now();
    let summary = seq.execute_all().await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(summary.completed, 4);
    let root_end = recorder.time_of("root:end");
    for child in ["x", "y", "z"] {
        assert!(root_end <= recorder.time_of(&format!("{child}:start")));
    }
    // Children overlapped after root: two sequential waves of 50 ms.
    assert!(max_running.load(Ordering::SeqCst) >= 2);
    assert!(elapsed >= Duration::from_millis(100));
    assert!(
        elapsed <= Duration::from_millis(250),
        "children did not run concurrently: {elapsed:?}"
    );
}

// ===========================================================================
// S3 -- retry success
// ===========================================================================

#[tokio::test]
async fn flaky_task_retries_to_success() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut target = Target::new("flaky");
    {
        let calls = Arc::clone(&calls);
        target.add_task(
            Task::new("flaky-work", move |_ctx| {
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(TaskError::Device("intermittent".into()))
                    } else {
                        Ok(())
                    }
                }
            })
            .with_retry(RetryPolicy::new(
                3,
                BackoffKind::Linear,
                Duration::from_millis(20),
            )),
        );
    }

    let mut seq = test_sequencer();
    seq.add_target(target).unwrap();

    let started = Instant::now();
    let summary = seq.execute_all().await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(summary.completed, 1);
    let target = seq.target("flaky").unwrap();
    assert_eq!(target.status(), TargetStatus::Completed);

    let task = &target.tasks()[0];
    assert_eq!(task.attempts(), 3);
    // Linear backoff: 20 ms + 40 ms.
    assert!(elapsed >= Duration::from_millis(60));

    let retries = task
        .history()
        .into_iter()
        .filter(|h| h.event == "retry")
        .count();
    assert_eq!(retries, 2, "two failed->pending transitions in history");
}

// ===========================================================================
// S4 -- stop on failure
// ===========================================================================

#[tokio::test]
async fn stop_recovery_cancels_remaining_targets() {
    let recorder = Recorder::default();
    let mut seq = test_sequencer();
    seq.set_recovery_policy(RecoveryPolicy::Stop);

    seq.add_target(sleeping_target("a", Duration::from_millis(5), &recorder))
        .unwrap();
    let mut b = failing_target("b");
    b.set_max_retries(1);
    seq.add_target(b).unwrap();
    seq.add_target(sleeping_target("c", Duration::from_millis(5), &recorder))
        .unwrap();
    seq.add_dependency("a", "b").unwrap();
    seq.add_dependency("b", "c").unwrap();

    let summary = seq.execute_all().await.unwrap();

    assert_eq!(seq.target_status("a"), Some(TargetStatus::Completed));
    assert_eq!(seq.target_status("b"), Some(TargetStatus::Failed));
    assert_eq!(seq.target_status("c"), Some(TargetStatus::Cancelled));
    assert_eq!(seq.get_failed_targets(), vec!["b"]);
    assert_eq!(summary.failed, vec!["b"]);
    // c never ran.
    assert!(!recorder.labels().iter().any(|l| l.starts_with("c:")));
    assert_all_terminal(&seq);
}

// ===========================================================================
// S5 -- alternative swap
// ===========================================================================

#[tokio::test]
async fn alternative_replaces_failed_target_for_dependents() {
    let recorder = Recorder::default();
    let mut seq = test_sequencer();
    seq.set_recovery_policy(RecoveryPolicy::Alternative);

    seq.add_target(failing_target("primary")).unwrap();
    seq.add_target(sleeping_target(
        "dependent",
        Duration::from_millis(5),
        &recorder,
    ))
    .unwrap();
    seq.add_dependency("primary", "dependent").unwrap();
    seq.register_alternative(
        "primary",
        sleeping_target("backup", Duration::from_millis(5), &recorder),
    )
    .unwrap();

    let summary = seq.execute_all().await.unwrap();

    assert_eq!(seq.target_status("primary"), Some(TargetStatus::Failed));
    assert_eq!(seq.target_status("backup"), Some(TargetStatus::Completed));
    assert_eq!(seq.target_status("dependent"), Some(TargetStatus::Completed));
    assert_eq!(summary.failed, vec!["primary"]);

    // The dependent saw the backup as its predecessor.
    assert!(recorder.time_of("backup:end") <= recorder.time_of("dependent:start"));
    assert_all_terminal(&seq);
}

#[tokio::test]
async fn alternative_without_registration_stops() {
    let recorder = Recorder::default();
    let mut seq = test_sequencer();
    seq.set_recovery_policy(RecoveryPolicy::Alternative);

    seq.add_target(failing_target("primary")).unwrap();
    seq.add_target(sleeping_target(
        "dependent",
        Duration::from_millis(5),
        &recorder,
    ))
    .unwrap();
    seq.add_dependency("primary", "dependent").unwrap();

    seq.execute_all().await.unwrap();

    assert_eq!(seq.target_status("primary"), Some(TargetStatus::Failed));
    assert_eq!(seq.target_status("dependent"), Some(TargetStatus::Cancelled));
    assert_all_terminal(&seq);
}

// ===========================================================================
// S6 -- global timeout
// ===========================================================================

#[tokio::test]
async fn global_timeout_cancels_long_task() {
    let mut target = Target::new("deep-sky");
    target.add_task(Task::new("long-exposure", |ctx| async move {
        ctx.sleep(Duration::from_secs(10)).await?;
        Ok(())
    }));

    let mut seq = test_sequencer();
    seq.set_global_timeout(Some(Duration::from_millis(100)));
    seq.add_target(target).unwrap();

    let started = Instant::now();
    let summary = seq.execute_all().await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(summary.error, Some(TaskErrorKind::Timeout));
    assert_eq!(seq.target_status("deep-sky"), Some(TargetStatus::Cancelled));
    let target = seq.target("deep-sky").unwrap();
    assert_eq!(target.tasks()[0].status(), TaskStatus::Cancelled);
    assert!(
        elapsed < Duration::from_millis(500),
        "cancellation was not prompt: {elapsed:?}"
    );
}

// ===========================================================================
// Recovery: skip and retry
// ===========================================================================

#[tokio::test]
async fn skip_recovery_unblocks_dependents_and_keeps_error() {
    let recorder = Recorder::default();
    let mut seq = test_sequencer();
    seq.set_recovery_policy(RecoveryPolicy::Skip);

    seq.add_target(failing_target("broken")).unwrap();
    seq.add_target(sleeping_target(
        "downstream",
        Duration::from_millis(5),
        &recorder,
    ))
    .unwrap();
    seq.add_dependency("broken", "downstream").unwrap();

    let summary = seq.execute_all().await.unwrap();

    assert_eq!(seq.target_status("broken"), Some(TargetStatus::Skipped));
    assert_eq!(seq.target_status("downstream"), Some(TargetStatus::Completed));
    // The original error is preserved on the skipped target.
    let broken = seq.target("broken").unwrap();
    assert!(broken
        .error_message()
        .unwrap()
        .contains("simulated device failure"));
    assert_eq!(summary.skipped, vec!["broken"]);
    assert!(summary.failed.is_empty());
}

#[tokio::test]
async fn retry_recovery_reenqueues_failed_target() {
    // Fails the first two executions (one dispatch: initial + internal
    // retry), succeeds on the re-dispatched run.
    let calls = Arc::new(AtomicU32::new(0));
    let mut target = Target::new("eventually");
    {
        let calls = Arc::clone(&calls);
        target.add_task(Task::new("eventually-work", move |_ctx| {
            let calls = Arc::clone(&calls);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TaskError::Device("cloudy".into()))
                } else {
                    Ok(())
                }
            }
        }));
    }
    target.set_max_retries(1);

    let mut seq = test_sequencer();
    seq.set_recovery_policy(RecoveryPolicy::Retry);
    seq.add_target(target).unwrap();

    let summary = seq.execute_all().await.unwrap();

    assert_eq!(summary.completed, 1);
    assert_eq!(seq.target_status("eventually"), Some(TargetStatus::Completed));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn retry_recovery_exhaustion_skips_descendants() {
    let recorder = Recorder::default();
    let mut seq = test_sequencer();
    seq.set_recovery_policy(RecoveryPolicy::Retry);

    let mut broken = failing_target("broken");
    broken.set_max_retries(1);
    seq.add_target(broken).unwrap();
    seq.add_target(sleeping_target(
        "blocked",
        Duration::from_millis(5),
        &recorder,
    ))
    .unwrap();
    seq.add_dependency("broken", "blocked").unwrap();

    seq.execute_all().await.unwrap();

    assert_eq!(seq.target_status("broken"), Some(TargetStatus::Failed));
    assert_eq!(seq.target_status("blocked"), Some(TargetStatus::Skipped));
    assert!(!recorder.labels().iter().any(|l| l.starts_with("blocked:")));
    assert_all_terminal(&seq);
}

// ===========================================================================
// Strategies
// ===========================================================================

#[tokio::test]
async fn sequential_strategy_caps_concurrency_at_one() {
    let recorder = Recorder::default();
    let mut seq = test_sequencer();
    seq.set_strategy(ExecutionStrategy::Sequential);
    seq.set_max_concurrent(8);

    for name in ["t1", "t2", "t3"] {
        seq.add_target(sleeping_target(name, Duration::from_millis(10), &recorder))
            .unwrap();
    }

    let max_running = track_max_running(&mut seq);
    let summary = seq.execute_all().await.unwrap();

    assert_eq!(summary.completed, 3);
    assert!(max_running.load(Ordering::SeqCst) <= 1);
}

#[tokio::test]
async fn priority_scheduling_dispatches_high_priority_first() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let recorder = Recorder::default();

    let mut seq = test_sequencer();
    seq.set_strategy(ExecutionStrategy::Sequential);
    seq.set_scheduling_strategy(SchedulingStrategy::Priority);

    let mut low = sleeping_target("low", Duration::from_millis(2), &recorder);
    low.set_priority(1);
    let mut high = sleeping_target("high", Duration::from_millis(2), &recorder);
    high.set_priority(10);
    let mut mid = sleeping_target("mid", Duration::from_millis(2), &recorder);
    mid.set_priority(5);
    seq.add_target(low).unwrap();
    seq.add_target(high).unwrap();
    seq.add_target(mid).unwrap();

    {
        let order = Arc::clone(&order);
        seq.callbacks_mut().set_target_start(move |name, _status| {
            order.lock().unwrap().push(name.to_owned());
        });
    }

    seq.execute_all().await.unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["high", "mid", "low"]);
}

#[tokio::test]
async fn adaptive_strategy_completes_a_plan() {
    let recorder = Recorder::default();
    let mut seq = test_sequencer();
    seq.set_strategy(ExecutionStrategy::Adaptive);
    seq.set_max_concurrent(4);

    for i in 0..6 {
        seq.add_target(sleeping_target(
            &format!("t{i}"),
            Duration::from_millis(5),
            &recorder,
        ))
        .unwrap();
    }

    let summary = seq.execute_all().await.unwrap();
    assert_eq!(summary.completed, 6);
    assert_all_terminal(&seq);
}

// ===========================================================================
// Boundary behaviors
// ===========================================================================

#[tokio::test]
async fn empty_plan_returns_immediately_with_both_sequence_callbacks() {
    let starts = Arc::new(AtomicU32::new(0));
    let ends = Arc::new(AtomicU32::new(0));

    let mut seq = test_sequencer();
    {
        let starts = Arc::clone(&starts);
        seq.callbacks_mut()
            .set_sequence_start(move || {
                starts.fetch_add(1, Ordering::SeqCst);
            });
    }
    {
        let ends = Arc::clone(&ends);
        seq.callbacks_mut().set_sequence_end(move || {
            ends.fetch_add(1, Ordering::SeqCst);
        });
    }

    let summary = seq.execute_all().await.unwrap();
    assert_eq!(summary.completed, 0);
    assert!(summary.error.is_none());
    assert_eq!(starts.load(Ordering::SeqCst), 1);
    assert_eq!(ends.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn disabled_target_is_skipped_without_running() {
    let recorder = Recorder::default();
    let mut seq = test_sequencer();

    let disabled = sleeping_target("off", Duration::from_millis(5), &recorder);
    disabled.set_enabled(false);
    seq.add_target(disabled).unwrap();
    seq.add_target(sleeping_target("on", Duration::from_millis(5), &recorder))
        .unwrap();

    let summary = seq.execute_all().await.unwrap();

    assert_eq!(seq.target_status("off"), Some(TargetStatus::Skipped));
    assert_eq!(seq.target_status("on"), Some(TargetStatus::Completed));
    assert_eq!(summary.skipped, vec!["off"]);
    assert!(!recorder.labels().iter().any(|l| l.starts_with("off:")));
}

#[tokio::test]
async fn dependent_of_disabled_target_still_runs() {
    let recorder = Recorder::default();
    let mut seq = test_sequencer();

    let disabled = sleeping_target("off", Duration::from_millis(5), &recorder);
    disabled.set_enabled(false);
    seq.add_target(disabled).unwrap();
    seq.add_target(sleeping_target("after", Duration::from_millis(5), &recorder))
        .unwrap();
    seq.add_dependency("off", "after").unwrap();

    seq.execute_all().await.unwrap();
    // Skipped counts as a satisfied predecessor.
    assert_eq!(seq.target_status("after"), Some(TargetStatus::Completed));
}

#[tokio::test]
async fn stop_is_idempotent_when_idle() {
    let seq = test_sequencer();
    seq.stop();
    seq.stop();
    seq.cancel();
    assert!(!seq.is_running());
}

#[tokio::test]
async fn duplicate_target_rejected() {
    let mut seq = test_sequencer();
    seq.add_target(Target::new("dup")).unwrap();
    let err = seq.add_target(Target::new("dup")).unwrap_err();
    assert!(err.to_string().contains("dup"));
}

#[tokio::test]
async fn dependency_on_unknown_target_rejected() {
    let mut seq = test_sequencer();
    seq.add_target(Target::new("known")).unwrap();
    assert!(seq.add_dependency("known", "ghost").is_err());
    assert!(seq.add_dependency("ghost", "known").is_err());
}

#[tokio::test]
async fn cycle_in_dependencies_rejected() {
    let mut seq = test_sequencer();
    seq.add_target(Target::new("a")).unwrap();
    seq.add_target(Target::new("b")).unwrap();
    seq.add_dependency("a", "b").unwrap();
    assert!(seq.add_dependency("b", "a").is_err());
}

// ===========================================================================
// Metrics and callbacks
// ===========================================================================

#[tokio::test]
async fn metrics_account_for_every_terminal_target() {
    let recorder = Recorder::default();
    let mut seq = test_sequencer();
    seq.set_recovery_policy(RecoveryPolicy::Skip);

    seq.add_target(sleeping_target("good", Duration::from_millis(2), &recorder))
        .unwrap();
    seq.add_target(failing_target("bad")).unwrap();
    let disabled = sleeping_target("off", Duration::from_millis(2), &recorder);
    disabled.set_enabled(false);
    seq.add_target(disabled).unwrap();

    seq.execute_all().await.unwrap();

    let metrics = seq.metrics();
    assert_eq!(metrics.targets_terminal(), 3);
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot["counters"]["targets"]["completed"], 1);
    // The failed target settled as skipped under skip recovery.
    assert_eq!(snapshot["counters"]["targets"]["skipped"], 2);
}

#[tokio::test]
async fn error_callback_fires_with_description() {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let mut seq = test_sequencer();
    seq.set_recovery_policy(RecoveryPolicy::Skip);
    seq.add_target(failing_target("noisy")).unwrap();

    {
        let errors = Arc::clone(&errors);
        seq.callbacks_mut().set_error(move |name, description| {
            errors
                .lock()
                .unwrap()
                .push((name.to_owned(), description.to_owned()));
        });
    }

    seq.execute_all().await.unwrap();

    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, "noisy");
    assert!(errors[0].1.contains("simulated device failure"));
}

#[tokio::test]
async fn target_callbacks_report_terminal_statuses() {
    let ends = Arc::new(Mutex::new(Vec::new()));
    let recorder = Recorder::default();
    let mut seq = test_sequencer();
    seq.add_target(sleeping_target("only", Duration::from_millis(2), &recorder))
        .unwrap();

    {
        let ends = Arc::clone(&ends);
        seq.callbacks_mut().set_target_end(move |name, status| {
            ends.lock().unwrap().push((name.to_owned(), status));
        });
    }

    seq.execute_all().await.unwrap();
    assert_eq!(
        *ends.lock().unwrap(),
        vec![("only".to_owned(), TargetStatus::Completed)]
    );
}

#[tokio::test]
async fn execution_stats_snapshot_shape() {
    let recorder = Recorder::default();
    let mut seq = test_sequencer();
    seq.add_target(sleeping_target("t", Duration::from_millis(2), &recorder))
        .unwrap();
    seq.execute_all().await.unwrap();

    let stats = seq.execution_stats();
    assert_eq!(stats["running"], Value::Bool(false));
    assert_eq!(stats["targets"]["total"], 1);
    assert_eq!(stats["targets"]["completed"], 1);
    assert!(stats["metrics"]["counters"]["tasks"]["completed"].as_u64().unwrap() >= 1);
}

// ===========================================================================
// Cancellation from the outside
// ===========================================================================

#[tokio::test]
async fn external_cancel_handle_aborts_run() {
    let mut target = Target::new("marathon");
    target.add_task(Task::new("wait", |ctx| async move {
        ctx.sleep(Duration::from_secs(30)).await?;
        Ok(())
    }));

    let mut seq = test_sequencer();
    seq.add_target(target).unwrap();

    let handle: CancellationToken = seq.cancel_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();
    });

    let started = Instant::now();
    let summary = seq.execute_all().await.unwrap();

    assert_eq!(summary.error, Some(TaskErrorKind::Cancelled));
    assert_eq!(seq.target_status("marathon"), Some(TargetStatus::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(5));
}
