//! Camera exposure tasks: `TakeExposure` and `TakeManyExposure`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use nightshift_core::factory::{FactoryError, TaskFactory, TaskInfo};
use nightshift_core::params::{ParamKind, ParamSpec};
use nightshift_core::task::{Task, TaskContext};
use nightshift_types::TaskError;

use crate::registry::DeviceRegistry;
use crate::traits::Camera;

use super::validation::{validate_count, validate_exposure, validate_gain, validate_offset};
use super::{config_device_name, config_params, require_f64, require_i64};

/// Slack added to the device-side wait beyond the nominal exposure time.
const EXPOSURE_GRACE: Duration = Duration::from_secs(5);

fn exposure_schema() -> Vec<ParamSpec> {
    vec![
        ParamSpec::required("exposure", ParamKind::Number),
        ParamSpec::optional("gain", ParamKind::Integer, Some(json!(100))),
        ParamSpec::optional("offset", ParamKind::Integer, Some(json!(10))),
    ]
}

fn many_exposure_schema() -> Vec<ParamSpec> {
    let mut schema = exposure_schema();
    schema.insert(1, ParamSpec::required("count", ParamKind::Integer));
    schema
}

fn resolve_camera(
    tag: &str,
    devices: &Arc<DeviceRegistry>,
    config: &Value,
) -> Result<Arc<dyn Camera>, FactoryError> {
    let name = config_device_name(config, "camera");
    devices
        .camera(&name)
        .ok_or_else(|| FactoryError::InvalidConfig {
            tag: tag.to_owned(),
            message: format!("camera {name:?} not registered"),
        })
}

/// One cancellable exposure: start, wait, report.
async fn run_exposure(
    ctx: &TaskContext,
    camera: &Arc<dyn Camera>,
    seconds: f64,
) -> Result<(), TaskError> {
    ctx.checkpoint()?;
    camera.start_exposure(seconds).await?;

    let wait = Duration::from_secs_f64(seconds) + EXPOSURE_GRACE;
    let cancel_token = ctx.cancel_token();
    tokio::select! {
        result = camera.wait_for_exposure(wait) => {
            result?;
            Ok(())
        }
        _ = cancel_token.cancelled() => {
            if let Err(err) = camera.abort_exposure().await {
                tracing::warn!(camera = camera.name(), error = %err, "failed to abort exposure");
            }
            Err(TaskError::Cancelled)
        }
    }
}

fn validate_common(ctx: &TaskContext) -> Result<f64, TaskError> {
    let exposure = require_f64(ctx, "exposure")?;
    validate_exposure(exposure)?;
    validate_gain(require_i64(ctx, "gain")?)?;
    validate_offset(require_i64(ctx, "offset")?)?;
    Ok(exposure)
}

/// Register `TakeExposure` and `TakeManyExposure`.
pub fn register(factory: &TaskFactory, devices: &Arc<DeviceRegistry>) -> Result<(), FactoryError> {
    let registry = Arc::clone(devices);
    factory.register(
        "TakeExposure",
        TaskInfo {
            name: "TakeExposure".to_owned(),
            category: "Camera".to_owned(),
            version: "1.0".to_owned(),
            parameter_schema: exposure_schema(),
        },
        Arc::new(move |name, config| {
            let camera = resolve_camera("TakeExposure", &registry, config)?;
            Ok(Task::new(name, move |ctx| {
                let camera = Arc::clone(&camera);
                async move {
                    let exposure = validate_common(&ctx)?;
                    tracing::info!(camera = camera.name(), exposure, "starting exposure");
                    ctx.report_progress(0.05);
                    run_exposure(&ctx, &camera, exposure).await?;
                    ctx.report_progress(1.0);
                    Ok(())
                }
            })
            .with_schema(exposure_schema())
            .with_params(config_params(config)))
        }),
    )?;

    let registry = Arc::clone(devices);
    factory.register(
        "TakeManyExposure",
        TaskInfo {
            name: "TakeManyExposure".to_owned(),
            category: "Camera".to_owned(),
            version: "1.0".to_owned(),
            parameter_schema: many_exposure_schema(),
        },
        Arc::new(move |name, config| {
            let camera = resolve_camera("TakeManyExposure", &registry, config)?;
            Ok(Task::new(name, move |ctx| {
                let camera = Arc::clone(&camera);
                async move {
                    let exposure = validate_common(&ctx)?;
                    let count = require_i64(&ctx, "count")?;
                    validate_count(count)?;
                    tracing::info!(
                        camera = camera.name(),
                        exposure,
                        count,
                        "starting exposure series"
                    );
                    for i in 0..count {
                        run_exposure(&ctx, &camera, exposure).await?;
                        ctx.report_progress((i + 1) as f64 / count as f64);
                    }
                    Ok(())
                }
            })
            .with_schema(many_exposure_schema())
            .with_params(config_params(config)))
        }),
    )?;

    Ok(())
}
