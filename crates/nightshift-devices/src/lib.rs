//! Device capability layer for the nightshift sequencer.
//!
//! Task bodies never talk to a concrete driver; they hold a role-typed
//! handle ([`Camera`], [`Focuser`], [`FilterWheel`], [`Mount`]) resolved
//! by name from a [`DeviceRegistry`] at task construction. Simulated
//! devices back the built-in observation tasks in tests and dry runs.

pub mod error;
pub mod registry;
pub mod sim;
pub mod tasks;
pub mod traits;

pub use error::DeviceError;
pub use registry::{DeviceHandle, DeviceRegistry};
pub use sim::{SimCamera, SimFilterWheel, SimFocuser, SimMount};
pub use tasks::register_builtin_tasks;
pub use traits::{Camera, Device, FilterWheel, Focuser, Mount};
