//! Role-typed device capability traits.
//!
//! Each trait is object-safe so handles can be stored as `Arc<dyn _>` in
//! the [`super::DeviceRegistry`]. Every operation returns a
//! [`DeviceError`] with a textual description on failure.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::DeviceError;

/// Base capability shared by every device role.
#[async_trait]
pub trait Device: Send + Sync {
    /// Stable device name, as registered.
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<(), DeviceError>;

    async fn disconnect(&self) -> Result<(), DeviceError>;

    fn is_connected(&self) -> bool;
}

/// An imaging camera.
#[async_trait]
pub trait Camera: Device {
    /// Begin an exposure of the given length.
    async fn start_exposure(&self, seconds: f64) -> Result<(), DeviceError>;

    /// Abort the in-flight exposure, if any.
    async fn abort_exposure(&self) -> Result<(), DeviceError>;

    fn is_exposing(&self) -> bool;

    /// Block until the current exposure finishes, or fail with
    /// [`DeviceError::Timeout`] after `timeout`.
    async fn wait_for_exposure(&self, timeout: Duration) -> Result<(), DeviceError>;
}

/// An absolute-position focuser.
#[async_trait]
pub trait Focuser: Device {
    async fn move_to(&self, position: i64) -> Result<(), DeviceError>;

    fn position(&self) -> i64;
}

/// A filter wheel addressed by slot index.
#[async_trait]
pub trait FilterWheel: Device {
    async fn set_position(&self, slot: usize) -> Result<(), DeviceError>;

    fn position(&self) -> usize;
}

/// An equatorial mount.
#[async_trait]
pub trait Mount: Device {
    /// Slew to the given coordinates (RA in hours, Dec in degrees).
    async fn slew_to(&self, ra_hours: f64, dec_degrees: f64) -> Result<(), DeviceError>;

    fn is_slewing(&self) -> bool;

    async fn park(&self) -> Result<(), DeviceError>;
}

// Compile-time assertions: every role trait must stay object-safe.
const _: () = {
    fn _assert_object_safe(
        _: &dyn Camera,
        _: &dyn Focuser,
        _: &dyn FilterWheel,
        _: &dyn Mount,
    ) {
    }
};
