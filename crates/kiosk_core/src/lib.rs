//! Kiosk-side voter verification.
//!
//! The [`VerificationOrchestrator`] drives one voter through the required identity, face and
//! fingerprint checks, owns the capture devices for the duration of each capture and hands
//! the ballot to the ledger once every factor has passed.

pub mod ballot;
pub mod device;
pub mod error;
pub mod monitor;
pub mod orchestrator;
pub mod session;
pub mod verifier;

pub use ballot::{HttpVoteClient, VoteSubmissionClient, VoteSubmissionError};
pub use device::{
    CaptureDevice, CaptureDeviceAdapter, DeviceError, DeviceHandle, Sample,
    DEFAULT_CAPTURE_TIMEOUT,
};
pub use error::OrchestratorError;
pub use monitor::{
    ConnectivitySnapshot, DeviceStatusSource, HttpDeviceStatusSource, ScannerConnectivityMonitor,
    ScannerStatusView,
};
pub use orchestrator::{OrchestratorPolicy, SessionEvent, VerificationOrchestrator};
pub use session::{FactorOutcome, SessionState, VerificationSession};
pub use verifier::{HttpVerifierClient, VerifierClient, VerifierError};

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
