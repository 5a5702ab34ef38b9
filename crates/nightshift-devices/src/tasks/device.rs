//! Device housekeeping task: `DeviceConnect`.

use std::sync::Arc;

use serde_json::Value;

use nightshift_core::factory::{FactoryError, TaskFactory, TaskInfo};
use nightshift_core::params::{ParamKind, ParamSpec};
use nightshift_core::task::Task;

use crate::registry::DeviceRegistry;

use super::config_params;

fn device_connect_schema() -> Vec<ParamSpec> {
    vec![ParamSpec::required("device", ParamKind::String)]
}

/// Register `DeviceConnect`.
pub fn register(factory: &TaskFactory, devices: &Arc<DeviceRegistry>) -> Result<(), FactoryError> {
    let registry = Arc::clone(devices);
    factory.register(
        "DeviceConnect",
        TaskInfo {
            name: "DeviceConnect".to_owned(),
            category: "Device".to_owned(),
            version: "1.0".to_owned(),
            parameter_schema: device_connect_schema(),
        },
        Arc::new(move |name, config| {
            let device_name = config
                .get("device")
                .and_then(Value::as_str)
                .ok_or_else(|| FactoryError::InvalidConfig {
                    tag: "DeviceConnect".to_owned(),
                    message: "config must name a device".to_owned(),
                })?
                .to_owned();
            let handle =
                registry
                    .get(&device_name)
                    .ok_or_else(|| FactoryError::InvalidConfig {
                        tag: "DeviceConnect".to_owned(),
                        message: format!("device {device_name:?} not registered"),
                    })?;

            Ok(Task::new(name, move |ctx| {
                let handle = handle.clone();
                async move {
                    ctx.checkpoint()?;
                    tracing::info!(device = %handle.name(), role = handle.role(), "connecting device");
                    handle.connect().await?;
                    ctx.report_progress(1.0);
                    Ok(())
                }
            })
            .with_schema(device_connect_schema())
            .with_params(config_params(config)))
        }),
    )
}
