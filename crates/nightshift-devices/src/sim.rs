//! Simulated devices with configurable timing and fault injection.
//!
//! Used by tests and dry runs. A `time_scale` below 1.0 compresses
//! exposure and movement times so suites stay fast.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::DeviceError;
use crate::traits::{Camera, Device, FilterWheel, Focuser, Mount};

fn scaled(seconds: f64, time_scale: f64) -> Duration {
    Duration::from_secs_f64((seconds * time_scale).max(0.0))
}

// ---------------------------------------------------------------------------
// SimCamera
// ---------------------------------------------------------------------------

/// In-memory camera. Exposures run on the tokio clock.
pub struct SimCamera {
    name: String,
    time_scale: f64,
    connected: AtomicBool,
    fail_next: AtomicBool,
    exposure_end: Mutex<Option<tokio::time::Instant>>,
}

impl SimCamera {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            time_scale: 1.0,
            connected: AtomicBool::new(true),
            fail_next: AtomicBool::new(false),
            exposure_end: Mutex::new(None),
        }
    }

    /// Compress simulated exposure time by the given factor.
    pub fn with_time_scale(mut self, time_scale: f64) -> Self {
        self.time_scale = time_scale;
        self
    }

    /// Make the next `start_exposure` fail with a device fault.
    pub fn fail_next_exposure(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Device for SimCamera {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<(), DeviceError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), DeviceError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Camera for SimCamera {
    async fn start_exposure(&self, seconds: f64) -> Result<(), DeviceError> {
        if !self.is_connected() {
            return Err(DeviceError::NotConnected(self.name.clone()));
        }
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(DeviceError::Fault(format!(
                "{}: simulated exposure failure",
                self.name
            )));
        }
        let mut end = self.exposure_end.lock().expect("camera state poisoned");
        if end.is_some() {
            return Err(DeviceError::Busy(format!("{}: already exposing", self.name)));
        }
        *end = Some(tokio::time::Instant::now() + scaled(seconds, self.time_scale));
        Ok(())
    }

    async fn abort_exposure(&self) -> Result<(), DeviceError> {
        *self.exposure_end.lock().expect("camera state poisoned") = None;
        Ok(())
    }

    fn is_exposing(&self) -> bool {
        self.exposure_end
            .lock()
            .expect("camera state poisoned")
            .is_some_and(|end| tokio::time::Instant::now() < end)
    }

    async fn wait_for_exposure(&self, timeout: Duration) -> Result<(), DeviceError> {
        let end = *self.exposure_end.lock().expect("camera state poisoned");
        let Some(end) = end else {
            return Ok(());
        };
        let now = tokio::time::Instant::now();
        let remaining = end.saturating_duration_since(now);
        if remaining > timeout {
            tokio::time::sleep(timeout).await;
            return Err(DeviceError::Timeout(format!(
                "{}: exposure still running",
                self.name
            )));
        }
        tokio::time::sleep(remaining).await;
        *self.exposure_end.lock().expect("camera state poisoned") = None;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SimFocuser
// ---------------------------------------------------------------------------

/// In-memory focuser holding an absolute position.
pub struct SimFocuser {
    name: String,
    connected: AtomicBool,
    position: AtomicI64,
    move_delay: Duration,
}

impl SimFocuser {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connected: AtomicBool::new(true),
            position: AtomicI64::new(0),
            move_delay: Duration::ZERO,
        }
    }

    pub fn with_move_delay(mut self, delay: Duration) -> Self {
        self.move_delay = delay;
        self
    }
}

#[async_trait]
impl Device for SimFocuser {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<(), DeviceError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), DeviceError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Focuser for SimFocuser {
    async fn move_to(&self, position: i64) -> Result<(), DeviceError> {
        if !self.is_connected() {
            return Err(DeviceError::NotConnected(self.name.clone()));
        }
        tokio::time::sleep(self.move_delay).await;
        self.position.store(position, Ordering::SeqCst);
        Ok(())
    }

    fn position(&self) -> i64 {
        self.position.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// SimFilterWheel
// ---------------------------------------------------------------------------

/// In-memory filter wheel with a fixed slot count.
pub struct SimFilterWheel {
    name: String,
    connected: AtomicBool,
    slots: usize,
    position: AtomicUsize,
    settle_delay: Duration,
}

impl SimFilterWheel {
    pub fn new(name: impl Into<String>, slots: usize) -> Self {
        Self {
            name: name.into(),
            connected: AtomicBool::new(true),
            slots,
            position: AtomicUsize::new(0),
            settle_delay: Duration::ZERO,
        }
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn slots(&self) -> usize {
        self.slots
    }
}

#[async_trait]
impl Device for SimFilterWheel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<(), DeviceError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), DeviceError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FilterWheel for SimFilterWheel {
    async fn set_position(&self, slot: usize) -> Result<(), DeviceError> {
        if !self.is_connected() {
            return Err(DeviceError::NotConnected(self.name.clone()));
        }
        if slot >= self.slots {
            return Err(DeviceError::Fault(format!(
                "{}: slot {} out of range (wheel has {})",
                self.name, slot, self.slots
            )));
        }
        tokio::time::sleep(self.settle_delay).await;
        self.position.store(slot, Ordering::SeqCst);
        Ok(())
    }

    fn position(&self) -> usize {
        self.position.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// SimMount
// ---------------------------------------------------------------------------

/// In-memory mount tracking pointed coordinates.
pub struct SimMount {
    name: String,
    connected: AtomicBool,
    slewing: AtomicBool,
    coordinates: Mutex<(f64, f64)>,
    slew_delay: Duration,
}

impl SimMount {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connected: AtomicBool::new(true),
            slewing: AtomicBool::new(false),
            coordinates: Mutex::new((0.0, 0.0)),
            slew_delay: Duration::ZERO,
        }
    }

    pub fn with_slew_delay(mut self, delay: Duration) -> Self {
        self.slew_delay = delay;
        self
    }

    pub fn coordinates(&self) -> (f64, f64) {
        *self.coordinates.lock().expect("mount state poisoned")
    }
}

#[async_trait]
impl Device for SimMount {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<(), DeviceError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), DeviceError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Mount for SimMount {
    async fn slew_to(&self, ra_hours: f64, dec_degrees: f64) -> Result<(), DeviceError> {
        if !self.is_connected() {
            return Err(DeviceError::NotConnected(self.name.clone()));
        }
        self.slewing.store(true, Ordering::SeqCst);
        tokio::time::sleep(self.slew_delay).await;
        *self.coordinates.lock().expect("mount state poisoned") = (ra_hours, dec_degrees);
        self.slewing.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_slewing(&self) -> bool {
        self.slewing.load(Ordering::SeqCst)
    }

    async fn park(&self) -> Result<(), DeviceError> {
        if !self.is_connected() {
            return Err(DeviceError::NotConnected(self.name.clone()));
        }
        self.slewing.store(false, Ordering::SeqCst);
        Ok(())
    }
}
