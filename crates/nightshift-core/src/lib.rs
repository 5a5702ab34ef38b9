//! Core of the nightshift exposure sequencer.
//!
//! The sequencer coordinates long-running observation plans across
//! heterogeneous hardware. A plan is a set of [`target::Target`]s (ordered
//! groups of [`task::Task`]s) connected by a [`graph::DependencyGraph`];
//! the [`sequencer::Sequencer`] drives every target to a terminal state,
//! honoring concurrency caps, resource budgets, global timeouts, and a
//! recovery policy.

pub mod factory;
pub mod graph;
pub mod metrics;
pub mod params;
pub mod plan;
pub mod resources;
pub mod sequencer;
pub mod target;
pub mod task;

pub use factory::{TaskFactory, TaskInfo};
pub use graph::DependencyGraph;
pub use metrics::MetricsCollector;
pub use params::{ParamKind, ParamSpec};
pub use sequencer::{SequenceSummary, Sequencer};
pub use target::Target;
pub use task::{Task, TaskContext};
