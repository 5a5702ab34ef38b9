//! Host callback surface.
//!
//! All callbacks run on the controller loop, serialized, with plain value
//! payloads. Workers never invoke callbacks directly.

use serde_json::Value;

use nightshift_types::TargetStatus;

type SequenceHook = Box<dyn Fn() + Send + Sync>;
type TargetHook = Box<dyn Fn(&str, TargetStatus) + Send + Sync>;
type ErrorHook = Box<dyn Fn(&str, &str) + Send + Sync>;
type ProgressHook = Box<dyn Fn(&Value) + Send + Sync>;

/// Optional host callbacks, invoked by the sequencer controller.
#[derive(Default)]
pub struct Callbacks {
    sequence_start: Option<SequenceHook>,
    sequence_end: Option<SequenceHook>,
    target_start: Option<TargetHook>,
    target_end: Option<TargetHook>,
    error: Option<ErrorHook>,
    progress: Option<ProgressHook>,
}

impl Callbacks {
    pub fn set_sequence_start(&mut self, f: impl Fn() + Send + Sync + 'static) {
        self.sequence_start = Some(Box::new(f));
    }

    pub fn set_sequence_end(&mut self, f: impl Fn() + Send + Sync + 'static) {
        self.sequence_end = Some(Box::new(f));
    }

    pub fn set_target_start(&mut self, f: impl Fn(&str, TargetStatus) + Send + Sync + 'static) {
        self.target_start = Some(Box::new(f));
    }

    pub fn set_target_end(&mut self, f: impl Fn(&str, TargetStatus) + Send + Sync + 'static) {
        self.target_end = Some(Box::new(f));
    }

    pub fn set_error(&mut self, f: impl Fn(&str, &str) + Send + Sync + 'static) {
        self.error = Some(Box::new(f));
    }

    pub fn set_progress(&mut self, f: impl Fn(&Value) + Send + Sync + 'static) {
        self.progress = Some(Box::new(f));
    }

    pub(crate) fn fire_sequence_start(&self) {
        if let Some(f) = &self.sequence_start {
            f();
        }
    }

    pub(crate) fn fire_sequence_end(&self) {
        if let Some(f) = &self.sequence_end {
            f();
        }
    }

    pub(crate) fn fire_target_start(&self, name: &str, status: TargetStatus) {
        if let Some(f) = &self.target_start {
            f(name, status);
        }
    }

    pub(crate) fn fire_target_end(&self, name: &str, status: TargetStatus) {
        if let Some(f) = &self.target_end {
            f(name, status);
        }
    }

    pub(crate) fn fire_error(&self, name: &str, description: &str) {
        if let Some(f) = &self.error {
            f(name, description);
        }
    }

    pub(crate) fn fire_progress(&self, snapshot: &Value) {
        if let Some(f) = &self.progress {
            f(snapshot);
        }
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("sequence_start", &self.sequence_start.is_some())
            .field("sequence_end", &self.sequence_end.is_some())
            .field("target_start", &self.target_start.is_some())
            .field("target_end", &self.target_end.is_some())
            .field("error", &self.error.is_some())
            .field("progress", &self.progress.is_some())
            .finish()
    }
}
