//! Exclusive, scoped access to capture hardware.
//!
//! A [`DeviceHandle`] is the only way to read a sample from a device. Handles are released
//! explicitly through [`CaptureDeviceAdapter::release`] or [`DeviceHandle::release`], and
//! `Drop` releases anything still open, so every exit path gives the device back.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::domain::DeviceKind;
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_CAPTURE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("{kind} unavailable: {reason}")]
    Unavailable { kind: DeviceKind, reason: String },
    #[error("{0} is already held by another capture")]
    Busy(DeviceKind),
    #[error("{0} did not open in time")]
    OpenTimeout(DeviceKind),
    #[error("{0} capture timed out")]
    CaptureTimeout(DeviceKind),
    #[error("no {0} is registered with this kiosk")]
    NotRegistered(DeviceKind),
    #[error("{0} handle was already released")]
    Released(DeviceKind),
}

/// One still image or fingerprint scan, or the typed voter id for identity lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub device: Option<DeviceKind>,
    pub bytes: Vec<u8>,
    pub captured_at: DateTime<Utc>,
}

impl Sample {
    pub fn from_device(device: DeviceKind, bytes: Vec<u8>) -> Self {
        Self {
            device: Some(device),
            bytes,
            captured_at: Utc::now(),
        }
    }

    pub fn typed(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            device: None,
            bytes: bytes.into(),
            captured_at: Utc::now(),
        }
    }
}

/// Driver for one physical capture device.
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    fn kind(&self) -> DeviceKind;
    /// Claims the hardware (camera track, serial port, ...).
    async fn open(&self) -> Result<(), DeviceError>;
    async fn read_sample(&self) -> Result<Vec<u8>, DeviceError>;
    /// Gives the hardware back. Called exactly once for every successful `open`.
    fn close(&self);
}

type HeldDevices = Arc<Mutex<HashSet<DeviceKind>>>;

struct HandleInner {
    id: u64,
    kind: DeviceKind,
    device: Arc<dyn CaptureDevice>,
    held: HeldDevices,
    opened: AtomicBool,
    released: AtomicBool,
}

impl HandleInner {
    fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        if self.opened.load(Ordering::Acquire) {
            self.device.close();
        }
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.kind);
        true
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

/// Exclusive ownership of one device between `acquire` and `release`.
pub struct DeviceHandle {
    inner: Arc<HandleInner>,
}

impl DeviceHandle {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn kind(&self) -> DeviceKind {
        self.inner.kind
    }

    pub fn is_released(&self) -> bool {
        self.inner.is_released()
    }

    /// Idempotent; returns `true` only for the call that actually released the device.
    pub fn release(&self) -> bool {
        let released = self.inner.release();
        if released {
            debug!(handle = self.inner.id, device = %self.inner.kind, "device released");
        }
        released
    }

    /// Read access for a capture running without the owner's lock held.
    pub(crate) fn lease(&self) -> CaptureLease {
        CaptureLease {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        if self.inner.release() {
            debug!(handle = self.inner.id, device = %self.inner.kind, "device released on drop");
        }
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("released", &self.inner.is_released())
            .finish()
    }
}

/// Borrowed view of a handle that can read samples but never releases the device.
pub(crate) struct CaptureLease {
    inner: Arc<HandleInner>,
}

impl CaptureLease {
    pub(crate) fn kind(&self) -> DeviceKind {
        self.inner.kind
    }
}

pub struct CaptureDeviceAdapter {
    devices: HashMap<DeviceKind, Arc<dyn CaptureDevice>>,
    held: HeldDevices,
    capture_timeout: Duration,
    next_handle_id: AtomicU64,
}

impl CaptureDeviceAdapter {
    pub fn new(capture_timeout: Duration) -> Self {
        Self {
            devices: HashMap::new(),
            held: Arc::new(Mutex::new(HashSet::new())),
            capture_timeout,
            next_handle_id: AtomicU64::new(1),
        }
    }

    pub fn with_device(mut self, device: Arc<dyn CaptureDevice>) -> Self {
        self.register(device);
        self
    }

    pub fn register(&mut self, device: Arc<dyn CaptureDevice>) {
        self.devices.insert(device.kind(), device);
    }

    /// Bounds both `open` and each sample read.
    pub fn capture_timeout(&self) -> Duration {
        self.capture_timeout
    }

    pub fn is_held(&self, kind: DeviceKind) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&kind)
    }

    pub async fn acquire(&self, kind: DeviceKind) -> Result<DeviceHandle, DeviceError> {
        let device = self
            .devices
            .get(&kind)
            .cloned()
            .ok_or(DeviceError::NotRegistered(kind))?;

        if !self
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind)
        {
            return Err(DeviceError::Busy(kind));
        }

        // From here on the slot is owned by `handle`; dropping it on any path frees the slot.
        let handle = DeviceHandle {
            inner: Arc::new(HandleInner {
                id: self.next_handle_id.fetch_add(1, Ordering::Relaxed),
                kind,
                device: Arc::clone(&device),
                held: Arc::clone(&self.held),
                opened: AtomicBool::new(false),
                released: AtomicBool::new(false),
            }),
        };

        match tokio::time::timeout(self.capture_timeout, device.open()).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                warn!(device = %kind, %error, "device open failed");
                return Err(error);
            }
            Err(_) => {
                warn!(device = %kind, timeout_ms = self.capture_timeout.as_millis() as u64, "device open timed out");
                return Err(DeviceError::OpenTimeout(kind));
            }
        }
        handle.inner.opened.store(true, Ordering::Release);
        debug!(handle = handle.id(), device = %kind, "device acquired");
        Ok(handle)
    }

    pub async fn capture(&self, handle: &DeviceHandle) -> Result<Sample, DeviceError> {
        self.capture_leased(handle.lease()).await
    }

    pub(crate) async fn capture_leased(&self, lease: CaptureLease) -> Result<Sample, DeviceError> {
        let kind = lease.kind();
        if lease.inner.is_released() {
            return Err(DeviceError::Released(kind));
        }

        let bytes = match tokio::time::timeout(self.capture_timeout, lease.inner.device.read_sample())
            .await
        {
            Ok(result) => result?,
            Err(_) => {
                warn!(device = %kind, timeout_ms = self.capture_timeout.as_millis() as u64, "capture timed out");
                return Err(DeviceError::CaptureTimeout(kind));
            }
        };

        // A concurrent release means the sample no longer belongs to a live handle.
        if lease.inner.is_released() {
            return Err(DeviceError::Released(kind));
        }
        Ok(Sample::from_device(kind, bytes))
    }

    pub fn release(&self, handle: &DeviceHandle) {
        handle.release();
    }
}

#[cfg(test)]
#[path = "tests/device_tests.rs"]
mod tests;
