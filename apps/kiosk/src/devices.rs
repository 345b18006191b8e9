//! Capture devices backed by sample files, for kiosks without attached hardware.

use std::path::PathBuf;

use async_trait::async_trait;
use kiosk_core::{CaptureDevice, DeviceError};
use shared::domain::DeviceKind;
use tracing::debug;

pub struct FileCaptureDevice {
    kind: DeviceKind,
    path: PathBuf,
}

impl FileCaptureDevice {
    pub fn new(kind: DeviceKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }

    fn unavailable(&self, reason: impl Into<String>) -> DeviceError {
        DeviceError::Unavailable {
            kind: self.kind,
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl CaptureDevice for FileCaptureDevice {
    fn kind(&self) -> DeviceKind {
        self.kind
    }

    async fn open(&self) -> Result<(), DeviceError> {
        let metadata = tokio::fs::metadata(&self.path)
            .await
            .map_err(|e| self.unavailable(format!("{}: {e}", self.path.display())))?;
        if !metadata.is_file() {
            return Err(self.unavailable(format!("{} is not a file", self.path.display())));
        }
        debug!(device = %self.kind, path = %self.path.display(), "file device opened");
        Ok(())
    }

    async fn read_sample(&self) -> Result<Vec<u8>, DeviceError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|e| self.unavailable(format!("{}: {e}", self.path.display())))?;
        if bytes.is_empty() {
            return Err(self.unavailable(format!("{} is empty", self.path.display())));
        }
        Ok(bytes)
    }

    fn close(&self) {
        debug!(device = %self.kind, "file device closed");
    }
}
