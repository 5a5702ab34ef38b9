//! Filter wheel task: `FilterSequence`.
//!
//! Cycles the wheel through a list of slots, taking one exposure per
//! filter position.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use nightshift_core::factory::{FactoryError, TaskFactory, TaskInfo};
use nightshift_core::params::{ParamKind, ParamSpec};
use nightshift_core::task::{Task, TaskContext};
use nightshift_types::TaskError;

use crate::registry::DeviceRegistry;
use crate::traits::{Camera, FilterWheel};

use super::validation::validate_exposure;
use super::{config_device_name, config_params, require_f64};

const EXPOSURE_GRACE: Duration = Duration::from_secs(5);

fn filter_sequence_schema() -> Vec<ParamSpec> {
    vec![
        ParamSpec::required("slots", ParamKind::Array),
        ParamSpec::required("exposure", ParamKind::Number),
        ParamSpec::optional("gain", ParamKind::Integer, Some(json!(100))),
    ]
}

fn parse_slots(ctx: &TaskContext) -> Result<Vec<usize>, TaskError> {
    let raw = ctx
        .param("slots")
        .and_then(Value::as_array)
        .ok_or_else(|| TaskError::Internal("parameter slots missing after validation".into()))?;

    let mut slots = Vec::with_capacity(raw.len());
    let mut errors = Vec::new();
    for (i, value) in raw.iter().enumerate() {
        match value.as_u64() {
            Some(slot) => slots.push(slot as usize),
            None => errors.push(format!("slots[{i}] must be a non-negative integer")),
        }
    }
    if !errors.is_empty() {
        return Err(TaskError::InvalidParameter { errors });
    }
    if slots.is_empty() {
        return Err(TaskError::InvalidParameter {
            errors: vec!["slots must not be empty".to_owned()],
        });
    }
    Ok(slots)
}

/// Register `FilterSequence`.
pub fn register(factory: &TaskFactory, devices: &Arc<DeviceRegistry>) -> Result<(), FactoryError> {
    let registry = Arc::clone(devices);
    factory.register(
        "FilterSequence",
        TaskInfo {
            name: "FilterSequence".to_owned(),
            category: "Filter".to_owned(),
            version: "1.0".to_owned(),
            parameter_schema: filter_sequence_schema(),
        },
        Arc::new(move |name, config| {
            let wheel_name = config_device_name(config, "filter_wheel");
            let wheel: Arc<dyn FilterWheel> = registry.filter_wheel(&wheel_name).ok_or_else(|| {
                FactoryError::InvalidConfig {
                    tag: "FilterSequence".to_owned(),
                    message: format!("filter wheel {wheel_name:?} not registered"),
                }
            })?;
            let camera_name = config_device_name(config, "camera");
            let camera: Arc<dyn Camera> = registry.camera(&camera_name).ok_or_else(|| {
                FactoryError::InvalidConfig {
                    tag: "FilterSequence".to_owned(),
                    message: format!("camera {camera_name:?} not registered"),
                }
            })?;

            Ok(Task::new(name, move |ctx| {
                let wheel = Arc::clone(&wheel);
                let camera = Arc::clone(&camera);
                async move {
                    let slots = parse_slots(&ctx)?;
                    let exposure = require_f64(&ctx, "exposure")?;
                    validate_exposure(exposure)?;

                    tracing::info!(
                        wheel = wheel.name(),
                        camera = camera.name(),
                        filters = slots.len(),
                        exposure,
                        "starting filter sequence"
                    );

                    let total = slots.len();
                    for (i, slot) in slots.into_iter().enumerate() {
                        ctx.checkpoint()?;
                        wheel.set_position(slot).await?;
                        camera.start_exposure(exposure).await?;

                        let wait = Duration::from_secs_f64(exposure) + EXPOSURE_GRACE;
                        let cancel_token = ctx.cancel_token();
                        tokio::select! {
                            result = camera.wait_for_exposure(wait) => { result?; }
                            _ = cancel_token.cancelled() => {
                                if let Err(err) = camera.abort_exposure().await {
                                    tracing::warn!(camera = camera.name(), error = %err, "failed to abort exposure");
                                }
                                return Err(TaskError::Cancelled);
                            }
                        }
                        ctx.report_progress((i + 1) as f64 / total as f64);
                    }
                    Ok(())
                }
            })
            .with_schema(filter_sequence_schema())
            .with_params(config_params(config)))
        }),
    )
}
