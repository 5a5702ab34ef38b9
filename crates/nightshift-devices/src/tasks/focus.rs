//! Focuser task: `FocusTo` -- move to an absolute focuser position.

use std::sync::Arc;

use nightshift_core::factory::{FactoryError, TaskFactory, TaskInfo};
use nightshift_core::params::{ParamKind, ParamSpec};
use nightshift_core::task::Task;

use crate::registry::DeviceRegistry;
use crate::traits::Focuser;

use super::validation::validate_focus_position;
use super::{config_device_name, config_params, require_i64};

fn focus_to_schema() -> Vec<ParamSpec> {
    vec![ParamSpec::required("position", ParamKind::Integer)]
}

/// Register `FocusTo`.
pub fn register(factory: &TaskFactory, devices: &Arc<DeviceRegistry>) -> Result<(), FactoryError> {
    let registry = Arc::clone(devices);
    factory.register(
        "FocusTo",
        TaskInfo {
            name: "FocusTo".to_owned(),
            category: "Focus".to_owned(),
            version: "1.0".to_owned(),
            parameter_schema: focus_to_schema(),
        },
        Arc::new(move |name, config| {
            let focuser_name = config_device_name(config, "focuser");
            let focuser: Arc<dyn Focuser> = registry.focuser(&focuser_name).ok_or_else(|| {
                FactoryError::InvalidConfig {
                    tag: "FocusTo".to_owned(),
                    message: format!("focuser {focuser_name:?} not registered"),
                }
            })?;

            Ok(Task::new(name, move |ctx| {
                let focuser = Arc::clone(&focuser);
                async move {
                    let position = require_i64(&ctx, "position")?;
                    validate_focus_position(position)?;
                    ctx.checkpoint()?;
                    tracing::info!(focuser = focuser.name(), position, "moving focuser");
                    focuser.move_to(position).await?;
                    ctx.report_progress(1.0);
                    Ok(())
                }
            })
            .with_schema(focus_to_schema())
            .with_params(config_params(config)))
        }),
    )
}
