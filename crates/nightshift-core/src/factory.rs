//! Task factory -- a registry of task constructors keyed by type tag.
//!
//! The factory lets plans refer to tasks by a string tag (e.g.
//! `"TakeExposure"`) and build them from a JSON configuration. Built-in
//! task families register themselves once at startup; concurrent
//! registration is serialized by the registry lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::params::ParamSpec;
use crate::task::Task;

/// Constructor stored in the registry: `(name, json config) -> Task`.
pub type TaskConstructor =
    Arc<dyn Fn(&str, &Value) -> Result<Task, FactoryError> + Send + Sync>;

/// Errors from factory operations.
#[derive(Debug, thiserror::Error)]
pub enum FactoryError {
    #[error("task type already registered: {0}")]
    DuplicateTaskType(String),

    #[error("task type not found: {0}")]
    TaskNotFound(String),

    #[error("invalid config for task type {tag}: {message}")]
    InvalidConfig { tag: String, message: String },
}

/// Descriptive metadata for a registered task type.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub name: String,
    pub category: String,
    pub version: String,
    pub parameter_schema: Vec<ParamSpec>,
}

struct FactoryEntry {
    info: TaskInfo,
    build: TaskConstructor,
}

/// Registry of task constructors, keyed by type tag.
#[derive(Default)]
pub struct TaskFactory {
    entries: Mutex<HashMap<String, FactoryEntry>>,
}

impl TaskFactory {
    /// Create an empty factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task type. Registering the same tag twice fails.
    pub fn register(
        &self,
        tag: impl Into<String>,
        info: TaskInfo,
        build: TaskConstructor,
    ) -> Result<(), FactoryError> {
        let tag = tag.into();
        let mut entries = self.entries.lock().expect("factory registry poisoned");
        if entries.contains_key(&tag) {
            return Err(FactoryError::DuplicateTaskType(tag));
        }
        tracing::debug!(tag = %tag, category = %info.category, "registered task type");
        entries.insert(tag, FactoryEntry { info, build });
        Ok(())
    }

    /// Build a task of the given type. The constructor stamps the type tag
    /// onto the created task.
    pub fn create(&self, tag: &str, name: &str, config: &Value) -> Result<Task, FactoryError> {
        let entries = self.entries.lock().expect("factory registry poisoned");
        let entry = entries
            .get(tag)
            .ok_or_else(|| FactoryError::TaskNotFound(tag.to_owned()))?;
        let task = (entry.build)(name, config)?;
        Ok(task.with_type_tag(tag))
    }

    /// Whether a type tag has been registered.
    pub fn is_registered(&self, tag: &str) -> bool {
        self.entries
            .lock()
            .expect("factory registry poisoned")
            .contains_key(tag)
    }

    /// All registered type tags, sorted for stable output.
    pub fn list_types(&self) -> Vec<String> {
        let mut tags: Vec<String> = self
            .entries
            .lock()
            .expect("factory registry poisoned")
            .keys()
            .cloned()
            .collect();
        tags.sort();
        tags
    }

    /// Metadata for a registered type, if any.
    pub fn get_info(&self, tag: &str) -> Option<TaskInfo> {
        self.entries
            .lock()
            .expect("factory registry poisoned")
            .get(tag)
            .map(|e| e.info.clone())
    }

    /// Registered type tags grouped by category.
    pub fn tasks_by_category(&self) -> BTreeMap<String, Vec<String>> {
        let entries = self.entries.lock().expect("factory registry poisoned");
        let mut by_category: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (tag, entry) in entries.iter() {
            by_category
                .entry(entry.info.category.clone())
                .or_default()
                .push(tag.clone());
        }
        for tags in by_category.values_mut() {
            tags.sort();
        }
        by_category
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("factory registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries
            .lock()
            .expect("factory registry poisoned")
            .is_empty()
    }
}

impl std::fmt::Debug for TaskFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskFactory")
            .field("types", &self.list_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamKind;

    fn noop_constructor() -> TaskConstructor {
        Arc::new(|name, _config| Ok(Task::new(name, |_ctx| async { Ok(()) })))
    }

    fn info(name: &str, category: &str) -> TaskInfo {
        TaskInfo {
            name: name.to_owned(),
            category: category.to_owned(),
            version: "1.0".to_owned(),
            parameter_schema: vec![ParamSpec::required("exposure", ParamKind::Number)],
        }
    }

    #[test]
    fn factory_starts_empty() {
        let factory = TaskFactory::new();
        assert!(factory.is_empty());
        assert_eq!(factory.len(), 0);
        assert!(factory.list_types().is_empty());
    }

    #[test]
    fn register_and_create() {
        let factory = TaskFactory::new();
        factory
            .register("TakeExposure", info("TakeExposure", "Camera"), noop_constructor())
            .expect("first registration succeeds");

        assert!(factory.is_registered("TakeExposure"));
        let task = factory
            .create("TakeExposure", "m31_lights", &Value::Null)
            .expect("create succeeds");
        assert_eq!(task.name(), "m31_lights");
        assert_eq!(task.type_tag(), "TakeExposure");
    }

    #[test]
    fn duplicate_registration_fails() {
        let factory = TaskFactory::new();
        factory
            .register("AutoFocus", info("AutoFocus", "Focus"), noop_constructor())
            .unwrap();
        let err = factory
            .register("AutoFocus", info("AutoFocus", "Focus"), noop_constructor())
            .unwrap_err();
        assert!(matches!(err, FactoryError::DuplicateTaskType(ref t) if t == "AutoFocus"));
        assert_eq!(factory.len(), 1);
    }

    #[test]
    fn create_unknown_tag_fails() {
        let factory = TaskFactory::new();
        let err = factory.create("Nonexistent", "x", &Value::Null).unwrap_err();
        assert!(matches!(err, FactoryError::TaskNotFound(ref t) if t == "Nonexistent"));
    }

    #[test]
    fn list_types_sorted() {
        let factory = TaskFactory::new();
        factory
            .register("FilterSequence", info("FilterSequence", "Filter"), noop_constructor())
            .unwrap();
        factory
            .register("AutoFocus", info("AutoFocus", "Focus"), noop_constructor())
            .unwrap();
        factory
            .register("TakeExposure", info("TakeExposure", "Camera"), noop_constructor())
            .unwrap();

        assert_eq!(
            factory.list_types(),
            vec!["AutoFocus", "FilterSequence", "TakeExposure"]
        );
    }

    #[test]
    fn get_info_exposes_schema() {
        let factory = TaskFactory::new();
        factory
            .register("TakeExposure", info("TakeExposure", "Camera"), noop_constructor())
            .unwrap();

        let info = factory.get_info("TakeExposure").expect("info exists");
        assert_eq!(info.category, "Camera");
        assert_eq!(info.parameter_schema.len(), 1);
        assert!(factory.get_info("Missing").is_none());
    }

    #[test]
    fn tasks_grouped_by_category() {
        let factory = TaskFactory::new();
        factory
            .register("TakeExposure", info("TakeExposure", "Camera"), noop_constructor())
            .unwrap();
        factory
            .register("TakeManyExposure", info("TakeManyExposure", "Camera"), noop_constructor())
            .unwrap();
        factory
            .register("AutoFocus", info("AutoFocus", "Focus"), noop_constructor())
            .unwrap();

        let by_category = factory.tasks_by_category();
        assert_eq!(by_category["Camera"], vec!["TakeExposure", "TakeManyExposure"]);
        assert_eq!(by_category["Focus"], vec!["AutoFocus"]);
    }
}
