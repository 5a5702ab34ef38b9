//! Plan document round-trip: import through the factory, export, compare.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use nightshift_core::factory::{TaskFactory, TaskInfo};
use nightshift_core::params::{ParamKind, ParamSpec};
use nightshift_core::plan::{parse_plan_json, PlanDocument};
use nightshift_core::resources::ResourceLimits;
use nightshift_core::sequencer::{Sequencer, SequencerError};
use nightshift_core::task::Task;
use nightshift_types::TargetStatus;

// ===========================================================================
// Helpers
// ===========================================================================

fn wait_schema() -> Vec<ParamSpec> {
    vec![ParamSpec::optional(
        "delay_ms",
        ParamKind::Integer,
        Some(json!(1)),
    )]
}

/// A factory with a single `Wait` task type that sleeps briefly.
fn wait_factory() -> TaskFactory {
    let factory = TaskFactory::new();
    factory
        .register(
            "Wait",
            TaskInfo {
                name: "Wait".to_owned(),
                category: "Test".to_owned(),
                version: "1.0".to_owned(),
                parameter_schema: wait_schema(),
            },
            Arc::new(|name, config| {
                Ok(Task::new(name, |ctx| async move {
                    let delay = ctx
                        .param("delay_ms")
                        .and_then(Value::as_u64)
                        .unwrap_or(1);
                    ctx.sleep(Duration::from_millis(delay)).await?;
                    Ok(())
                })
                .with_schema(wait_schema())
                .with_params(config.as_object().cloned().unwrap_or_default()))
            }),
        )
        .expect("register Wait");
    factory
}

const PLAN: &str = r#"
{
    "targets": [
        {
            "name": "calibration",
            "enabled": true,
            "priority": 5,
            "cooldown_ms": 250,
            "maxRetries": 2,
            "params": {"gain": 120},
            "tasks": [
                {
                    "name": "darks",
                    "type": "Wait",
                    "params": {"delay_ms": 2},
                    "timeout_ms": 5000,
                    "retry": {"maxAttempts": 2, "backoff": "exponential", "baseDelay_ms": 10}
                },
                {"name": "flats", "type": "Wait", "params": {}, "frame": "flat"}
            ],
            "observer": "dome-2"
        },
        {"name": "m101", "tasks": [{"name": "lights", "type": "Wait", "params": {"delay_ms": 3}}]}
    ],
    "dependencies": [["calibration", "m101"]],
    "strategy": "priority",
    "scheduling": "dependencies",
    "recovery": "skip",
    "maxConcurrent": 2,
    "globalTimeout_ms": 60000,
    "site": {"lat": 31.96, "lon": -111.6}
}
"#;

// ===========================================================================
// Tests
// ===========================================================================

#[test]
fn import_then_export_preserves_plan() {
    let factory = wait_factory();
    let doc = parse_plan_json(PLAN).expect("plan parses");
    let seq = Sequencer::from_plan(&factory, &doc).expect("plan imports");
    let exported = seq.export_plan();

    // Targets: same names, order, and knobs.
    assert_eq!(exported.targets.len(), 2);
    assert_eq!(exported.targets[0].name, "calibration");
    assert_eq!(exported.targets[0].priority, 5);
    assert_eq!(exported.targets[0].cooldown_ms, 250);
    assert_eq!(exported.targets[0].max_retries, 2);
    assert_eq!(exported.targets[0].params["gain"], json!(120));
    assert_eq!(exported.targets[1].name, "m101");

    // Tasks: order, params, timeout, and retry survive.
    let darks = &exported.targets[0].tasks[0];
    assert_eq!(darks.name, "darks");
    assert_eq!(darks.type_tag, "Wait");
    assert_eq!(darks.timeout_ms, Some(5000));
    let retry = darks.retry.as_ref().expect("retry kept");
    assert_eq!(retry.max_attempts, 2);
    assert_eq!(retry.backoff, "exponential");
    assert_eq!(retry.base_delay_ms, 10);
    assert_eq!(exported.targets[0].tasks[1].name, "flats");

    // Strategy fields.
    assert_eq!(exported.strategy, "priority");
    assert_eq!(exported.scheduling, "dependencies");
    assert_eq!(exported.recovery, "skip");
    assert_eq!(exported.max_concurrent, 2);
    assert_eq!(exported.global_timeout_ms, Some(60000));

    // Dependencies as a set.
    let deps: HashSet<(String, String)> = exported.dependencies.iter().cloned().collect();
    assert!(deps.contains(&("calibration".to_owned(), "m101".to_owned())));
    assert_eq!(deps.len(), 1);

    // Unknown fields preserved at every level.
    assert_eq!(exported.extra["site"]["lat"], json!(31.96));
    assert_eq!(exported.targets[0].extra["observer"], json!("dome-2"));
    assert_eq!(exported.targets[0].tasks[1].extra["frame"], json!("flat"));
}

#[test]
fn exported_plan_reparses_identically() {
    let factory = wait_factory();
    let doc = parse_plan_json(PLAN).expect("plan parses");
    let seq = Sequencer::from_plan(&factory, &doc).expect("plan imports");
    let exported = seq.export_plan();

    let serialized = serde_json::to_string_pretty(&exported).expect("serialize");
    let reparsed = parse_plan_json(&serialized).expect("reparse");
    assert_eq!(exported, reparsed);
}

#[tokio::test]
async fn imported_plan_executes_to_completion() {
    let factory = wait_factory();
    let doc = parse_plan_json(PLAN).expect("plan parses");
    let mut seq = Sequencer::from_plan(&factory, &doc).expect("plan imports");
    seq.set_resource_limits(ResourceLimits {
        cpu_ceiling_pct: 101.0,
        ..ResourceLimits::default()
    });

    let summary = seq.execute_all().await.unwrap();
    assert_eq!(summary.completed, 2);
    assert_eq!(seq.target_status("calibration"), Some(TargetStatus::Completed));
    assert_eq!(seq.target_status("m101"), Some(TargetStatus::Completed));
}

#[test]
fn plan_file_roundtrip_via_disk() {
    let factory = wait_factory();
    let doc = parse_plan_json(PLAN).expect("plan parses");
    let seq = Sequencer::from_plan(&factory, &doc).expect("plan imports");

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("plan.json");
    let serialized = serde_json::to_string_pretty(&seq.export_plan()).expect("serialize");
    std::fs::write(&path, &serialized).expect("write plan file");

    let content = std::fs::read_to_string(&path).expect("read plan file");
    let reloaded = parse_plan_json(&content).expect("parse plan file");
    assert_eq!(reloaded, seq.export_plan());
}

#[test]
fn unknown_task_type_fails_import() {
    let factory = wait_factory();
    let doc = parse_plan_json(
        r#"{"targets": [{"name": "t", "tasks": [{"name": "x", "type": "Mystery"}]}]}"#,
    )
    .expect("plan parses");

    let err = Sequencer::from_plan(&factory, &doc).unwrap_err();
    assert!(matches!(err, SequencerError::Factory(_)));
}

#[test]
fn invalid_strategy_fails_import() {
    let factory = wait_factory();
    let doc = PlanDocument {
        strategy: "warp".to_owned(),
        ..parse_plan_json(r#"{"targets": []}"#).expect("empty plan parses")
    };

    let err = Sequencer::from_plan(&factory, &doc).unwrap_err();
    assert!(matches!(err, SequencerError::Plan(_)));
}
