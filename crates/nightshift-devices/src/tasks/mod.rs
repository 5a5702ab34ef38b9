//! Built-in observation tasks.
//!
//! Each task family registers its constructors with the [`TaskFactory`]
//! under a stable type tag. Constructors resolve their device handles by
//! name from the [`DeviceRegistry`] at creation time, so a plan can be
//! rejected early when it references hardware that is not present.

pub mod camera;
pub mod device;
pub mod filter;
pub mod focus;
pub mod validation;

use std::sync::Arc;

use serde_json::{Map, Value};

use nightshift_core::factory::{FactoryError, TaskFactory};
use nightshift_core::task::TaskContext;
use nightshift_types::TaskError;

use crate::registry::DeviceRegistry;

/// Register every built-in task family. Call once at startup.
///
/// Registered tags: `TakeExposure`, `TakeManyExposure`, `FilterSequence`,
/// `FocusTo`, `DeviceConnect`.
pub fn register_builtin_tasks(
    factory: &TaskFactory,
    devices: &Arc<DeviceRegistry>,
) -> Result<(), FactoryError> {
    camera::register(factory, devices)?;
    filter::register(factory, devices)?;
    focus::register(factory, devices)?;
    device::register(factory, devices)?;
    Ok(())
}

/// Device name referenced by a task config, with a role-based default.
pub(crate) fn config_device_name(config: &Value, key: &str) -> String {
    config
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or(key)
        .to_owned()
}

/// Task-level parameters from a JSON config object.
pub(crate) fn config_params(config: &Value) -> Map<String, Value> {
    config.as_object().cloned().unwrap_or_default()
}

/// Read a required number parameter. The schema guarantees presence and
/// kind; absence here is an internal error.
pub(crate) fn require_f64(ctx: &TaskContext, key: &str) -> Result<f64, TaskError> {
    ctx.param(key)
        .and_then(Value::as_f64)
        .ok_or_else(|| TaskError::Internal(format!("parameter {key} missing after validation")))
}

pub(crate) fn require_i64(ctx: &TaskContext, key: &str) -> Result<i64, TaskError> {
    ctx.param(key)
        .and_then(Value::as_i64)
        .ok_or_else(|| TaskError::Internal(format!("parameter {key} missing after validation")))
}
