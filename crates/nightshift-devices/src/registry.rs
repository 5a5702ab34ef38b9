//! Device registry -- a named collection of role-typed device handles.
//!
//! Tasks resolve their handles here by name at construction time; the
//! registry itself is shared behind an `Arc` and safe to consult from any
//! worker.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::DeviceError;
use crate::traits::{Camera, FilterWheel, Focuser, Mount};

/// A shared handle to a device of a known role.
#[derive(Clone)]
pub enum DeviceHandle {
    Camera(Arc<dyn Camera>),
    Focuser(Arc<dyn Focuser>),
    FilterWheel(Arc<dyn FilterWheel>),
    Mount(Arc<dyn Mount>),
}

impl DeviceHandle {
    pub fn role(&self) -> &'static str {
        match self {
            Self::Camera(_) => "camera",
            Self::Focuser(_) => "focuser",
            Self::FilterWheel(_) => "filter_wheel",
            Self::Mount(_) => "mount",
        }
    }

    pub fn name(&self) -> String {
        match self {
            Self::Camera(d) => d.name().to_owned(),
            Self::Focuser(d) => d.name().to_owned(),
            Self::FilterWheel(d) => d.name().to_owned(),
            Self::Mount(d) => d.name().to_owned(),
        }
    }

    pub async fn connect(&self) -> Result<(), DeviceError> {
        match self {
            Self::Camera(d) => d.connect().await,
            Self::Focuser(d) => d.connect().await,
            Self::FilterWheel(d) => d.connect().await,
            Self::Mount(d) => d.connect().await,
        }
    }

    pub async fn disconnect(&self) -> Result<(), DeviceError> {
        match self {
            Self::Camera(d) => d.disconnect().await,
            Self::Focuser(d) => d.disconnect().await,
            Self::FilterWheel(d) => d.disconnect().await,
            Self::Mount(d) => d.disconnect().await,
        }
    }

    pub fn is_connected(&self) -> bool {
        match self {
            Self::Camera(d) => d.is_connected(),
            Self::Focuser(d) => d.is_connected(),
            Self::FilterWheel(d) => d.is_connected(),
            Self::Mount(d) => d.is_connected(),
        }
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DeviceHandle({} {:?})", self.role(), self.name())
    }
}

/// A collection of registered devices, keyed by stable name.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, DeviceHandle>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device handle under a name. An existing handle under
    /// the same name is replaced and returned.
    pub fn register(&self, name: impl Into<String>, handle: DeviceHandle) -> Option<DeviceHandle> {
        let name = name.into();
        tracing::debug!(device = %name, role = handle.role(), "registered device");
        self.devices
            .write()
            .expect("device registry poisoned")
            .insert(name, handle)
    }

    pub fn register_camera(&self, name: impl Into<String>, camera: Arc<dyn Camera>) {
        self.register(name, DeviceHandle::Camera(camera));
    }

    pub fn register_focuser(&self, name: impl Into<String>, focuser: Arc<dyn Focuser>) {
        self.register(name, DeviceHandle::Focuser(focuser));
    }

    pub fn register_filter_wheel(&self, name: impl Into<String>, wheel: Arc<dyn FilterWheel>) {
        self.register(name, DeviceHandle::FilterWheel(wheel));
    }

    pub fn register_mount(&self, name: impl Into<String>, mount: Arc<dyn Mount>) {
        self.register(name, DeviceHandle::Mount(mount));
    }

    /// Look up any device by name.
    pub fn get(&self, name: &str) -> Option<DeviceHandle> {
        self.devices
            .read()
            .expect("device registry poisoned")
            .get(name)
            .cloned()
    }

    /// Look up a camera by name; `None` when absent or a different role.
    pub fn camera(&self, name: &str) -> Option<Arc<dyn Camera>> {
        match self.get(name) {
            Some(DeviceHandle::Camera(c)) => Some(c),
            _ => None,
        }
    }

    pub fn focuser(&self, name: &str) -> Option<Arc<dyn Focuser>> {
        match self.get(name) {
            Some(DeviceHandle::Focuser(f)) => Some(f),
            _ => None,
        }
    }

    pub fn filter_wheel(&self, name: &str) -> Option<Arc<dyn FilterWheel>> {
        match self.get(name) {
            Some(DeviceHandle::FilterWheel(w)) => Some(w),
            _ => None,
        }
    }

    pub fn mount(&self, name: &str) -> Option<Arc<dyn Mount>> {
        match self.get(name) {
            Some(DeviceHandle::Mount(m)) => Some(m),
            _ => None,
        }
    }

    /// Names of all registered devices, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .devices
            .read()
            .expect("device registry poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.devices.read().expect("device registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices
            .read()
            .expect("device registry poisoned")
            .is_empty()
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.list())
            .finish()
    }
}
