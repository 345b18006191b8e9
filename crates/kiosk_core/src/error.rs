use shared::domain::{DeviceKind, FactorKind};
use thiserror::Error;

use crate::{
    ballot::VoteSubmissionError, device::DeviceError, session::SessionState,
    verifier::VerifierError,
};

/// Every way an orchestrator operation can fail.
///
/// Sequencing and precondition violations ([`OutOfSequence`], [`IncompleteVerification`],
/// [`SessionClosed`], [`DuplicateVote`]) mean the caller drove the flow incorrectly. Device,
/// verifier and ledger errors are user facing, and the session is always left in a state
/// from which the same step can be attempted again.
///
/// [`OutOfSequence`]: OrchestratorError::OutOfSequence
/// [`IncompleteVerification`]: OrchestratorError::IncompleteVerification
/// [`SessionClosed`]: OrchestratorError::SessionClosed
/// [`DuplicateVote`]: OrchestratorError::DuplicateVote
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OrchestratorError {
    #[error("invalid session: {0}")]
    InvalidSession(String),
    #[error("{operation} is out of sequence (session is {state})")]
    OutOfSequence {
        operation: String,
        state: SessionState,
    },
    #[error("{0} is not available")]
    DeviceUnavailable(DeviceKind),
    #[error("{0} is already in use")]
    DeviceBusy(DeviceKind),
    #[error("{0} capture timed out")]
    CaptureTimeout(DeviceKind),
    #[error("{factor} verification rejected (attempt {attempt_count})")]
    VerifierRejected { factor: FactorKind, attempt_count: u32 },
    #[error("verification service unreachable: {0}")]
    VerifierTransport(String),
    #[error("{factor} failed {attempts} times; session cannot continue")]
    RetryLimitExceeded { factor: FactorKind, attempts: u32 },
    #[error("verification incomplete; pending factors: {pending:?}")]
    IncompleteVerification { pending: Vec<FactorKind> },
    #[error("a vote submission is already in progress for this session")]
    DuplicateVote,
    #[error("vote was not recorded: {0}")]
    VoteRejected(String),
    #[error("the ledger already holds a vote for this voter")]
    AlreadyVoted,
    #[error("session is closed")]
    SessionClosed,
    #[error("session expired after {idle_secs}s of inactivity")]
    SessionExpired { idle_secs: u64 },
}

impl OrchestratorError {
    /// Whether the voter may simply retry the step that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::DeviceUnavailable(_)
                | OrchestratorError::DeviceBusy(_)
                | OrchestratorError::CaptureTimeout(_)
                | OrchestratorError::VerifierRejected { .. }
                | OrchestratorError::VerifierTransport(_)
                | OrchestratorError::VoteRejected(_)
        )
    }

    /// Errors that only a misbehaving caller can trigger. These are reported, never retried.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            OrchestratorError::OutOfSequence { .. }
                | OrchestratorError::IncompleteVerification { .. }
                | OrchestratorError::SessionClosed
                | OrchestratorError::DuplicateVote
        )
    }
}

impl From<DeviceError> for OrchestratorError {
    fn from(value: DeviceError) -> Self {
        match value {
            DeviceError::Unavailable { kind, .. } => OrchestratorError::DeviceUnavailable(kind),
            DeviceError::Busy(kind) => OrchestratorError::DeviceBusy(kind),
            DeviceError::CaptureTimeout(kind) => OrchestratorError::CaptureTimeout(kind),
            DeviceError::OpenTimeout(kind)
            | DeviceError::NotRegistered(kind)
            | DeviceError::Released(kind) => {
                OrchestratorError::DeviceUnavailable(kind)
            }
        }
    }
}

impl From<VerifierError> for OrchestratorError {
    fn from(value: VerifierError) -> Self {
        OrchestratorError::VerifierTransport(value.to_string())
    }
}

impl From<VoteSubmissionError> for OrchestratorError {
    fn from(value: VoteSubmissionError) -> Self {
        match value {
            VoteSubmissionError::AlreadyVoted(_) => OrchestratorError::AlreadyVoted,
            other => OrchestratorError::VoteRejected(other.to_string()),
        }
    }
}
