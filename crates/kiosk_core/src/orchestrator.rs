//! The verification state machine.
//!
//! [`VerificationOrchestrator`] owns the single active [`VerificationSession`], sequences
//! its factors, holds the one open [`DeviceHandle`] and decides when the voter may cast a
//! ballot. State lives behind one lock that is never held across a capture, verifier or
//! ledger round-trip; each of those calls carries the generation it was issued under, and
//! a result whose generation no longer matches is dropped.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use shared::{
    domain::{DeviceKind, FactorKind, PollingStationId, ScannerStatus, SessionId, VoterId},
    protocol::{CastVoteRequest, VerifyRequest, VerifyResponse},
};
use tokio::{
    sync::{broadcast, Mutex},
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    ballot::VoteSubmissionClient,
    device::{CaptureDeviceAdapter, DeviceHandle, Sample},
    error::OrchestratorError,
    monitor::ScannerStatusView,
    session::{FactorOutcome, SessionState, VerificationSession},
    verifier::{build_verify_request, VerifierClient},
};

pub const DEFAULT_VERIFIER_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_VOTE_TIMEOUT: Duration = Duration::from_secs(30);
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct OrchestratorPolicy {
    pub verifier_timeout: Duration,
    pub vote_timeout: Duration,
    /// Rejections tolerated per factor before the session fails. `None` means unlimited.
    pub max_attempts_per_factor: Option<u32>,
    pub session_idle_timeout: Option<Duration>,
}

impl Default for OrchestratorPolicy {
    fn default() -> Self {
        Self {
            verifier_timeout: DEFAULT_VERIFIER_TIMEOUT,
            vote_timeout: DEFAULT_VOTE_TIMEOUT,
            max_attempts_per_factor: None,
            session_idle_timeout: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged {
        session_id: SessionId,
        from: SessionState,
        to: SessionState,
    },
    FactorRecorded {
        session_id: SessionId,
        outcome: FactorOutcome,
    },
    /// User-facing status line; every failure produces one.
    Notice {
        session_id: SessionId,
        message: String,
    },
    VoteRecorded {
        session_id: SessionId,
        transaction_ref: String,
    },
}

struct OrchestratorState {
    generation: u64,
    session: Option<VerificationSession>,
    device: Option<DeviceHandle>,
    vote_in_flight: bool,
}

#[derive(Debug, Clone, Copy)]
struct Ticket {
    generation: u64,
    factor: FactorKind,
}

pub struct VerificationOrchestrator {
    devices: Arc<CaptureDeviceAdapter>,
    verifier: Arc<dyn VerifierClient>,
    ballot: Arc<dyn VoteSubmissionClient>,
    scanner: ScannerStatusView,
    policy: OrchestratorPolicy,
    inner: Mutex<OrchestratorState>,
    events: broadcast::Sender<SessionEvent>,
}

impl VerificationOrchestrator {
    pub fn new(
        devices: Arc<CaptureDeviceAdapter>,
        verifier: Arc<dyn VerifierClient>,
        ballot: Arc<dyn VoteSubmissionClient>,
    ) -> Arc<Self> {
        Self::new_with_dependencies(
            devices,
            verifier,
            ballot,
            ScannerStatusView::unmonitored(),
            OrchestratorPolicy::default(),
        )
    }

    pub fn new_with_dependencies(
        devices: Arc<CaptureDeviceAdapter>,
        verifier: Arc<dyn VerifierClient>,
        ballot: Arc<dyn VoteSubmissionClient>,
        scanner: ScannerStatusView,
        policy: OrchestratorPolicy,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            devices,
            verifier,
            ballot,
            scanner,
            policy,
            inner: Mutex::new(OrchestratorState {
                generation: 0,
                session: None,
                device: None,
                vote_in_flight: false,
            }),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn scanner_status(&self) -> ScannerStatus {
        self.scanner.last_status()
    }

    pub async fn state(&self) -> SessionState {
        self.inner
            .lock()
            .await
            .session
            .as_ref()
            .map_or(SessionState::Idle, |session| session.state)
    }

    pub async fn snapshot(&self) -> Option<VerificationSession> {
        self.inner.lock().await.session.clone()
    }

    pub async fn start_session(
        &self,
        voter_id: VoterId,
        polling_station: PollingStationId,
        required_factors: Vec<FactorKind>,
    ) -> Result<VerificationSession, OrchestratorError> {
        if voter_id.is_blank() {
            return Err(OrchestratorError::InvalidSession(
                "voter id is required".to_string(),
            ));
        }
        if polling_station.is_blank() {
            return Err(OrchestratorError::InvalidSession(
                "polling station is required".to_string(),
            ));
        }
        let Some(&first) = required_factors.first() else {
            return Err(OrchestratorError::InvalidSession(
                "at least one verification factor is required".to_string(),
            ));
        };
        for (index, factor) in required_factors.iter().enumerate() {
            if required_factors[..index].contains(factor) {
                return Err(OrchestratorError::InvalidSession(format!(
                    "factor {factor} is listed more than once"
                )));
            }
        }

        let mut inner = self.inner.lock().await;
        // An idle session past its deadline must not block a new voter.
        let _ = self.expire_if_idle(&mut inner);
        if let Some(active) = inner.session.as_ref().filter(|s| !s.state.is_terminal()) {
            return Err(OrchestratorError::InvalidSession(format!(
                "session {} is still {}",
                active.session_id, active.state
            )));
        }

        if let Some(handle) = inner.device.take() {
            handle.release();
        }
        inner.vote_in_flight = false;
        inner.generation += 1;

        let mut session =
            VerificationSession::new(voter_id, polling_station, required_factors, inner.generation);
        self.move_to(&mut session, SessionState::AwaitingFactor(first));
        info!(
            session_id = %session.session_id,
            voter_id = %session.voter_id,
            polling_station = %session.polling_station,
            factors = ?session.required_factors,
            generation = session.generation,
            "verification session started"
        );
        inner.session = Some(session.clone());
        Ok(session)
    }

    pub async fn begin_capture(&self, factor: FactorKind) -> Result<(), OrchestratorError> {
        let operation = format!("capture of {factor}");
        let ticket = {
            let mut inner = self.inner.lock().await;
            self.expire_if_idle(&mut inner)?;
            let generation = inner.generation;
            let session = open_session(&mut inner.session, &operation)?;

            let in_turn = session.state == SessionState::AwaitingFactor(factor)
                && session.next_pending_factor() == Some(factor);
            if !in_turn {
                warn!(session_id = %session.session_id, %factor, state = %session.state, "capture requested out of sequence");
                return Err(OrchestratorError::OutOfSequence {
                    operation,
                    state: session.state,
                });
            }

            if factor.device_kind() == Some(DeviceKind::FingerprintScanner)
                && self.scanner.last_status() == ScannerStatus::Disconnected
            {
                self.notify(
                    session,
                    "Fingerprint scanner is not connected. Check the connection and try again.",
                );
                return Err(OrchestratorError::DeviceUnavailable(
                    DeviceKind::FingerprintScanner,
                ));
            }
            Ticket { generation, factor }
        };

        // Opening a device can stall; cancel and status reads must not wait behind it.
        let acquired = match factor.device_kind() {
            Some(kind) => Some(self.devices.acquire(kind).await),
            None => None,
        };

        let mut inner = self.inner.lock().await;
        let OrchestratorState {
            session,
            device,
            generation,
            ..
        } = &mut *inner;
        let Some(session) = session
            .as_mut()
            .filter(|s| *generation == ticket.generation && !s.state.is_terminal())
        else {
            debug!(generation = ticket.generation, %factor, "discarding device opened for a closed session");
            return Err(OrchestratorError::SessionClosed);
        };
        if session.state != SessionState::AwaitingFactor(factor) {
            return Err(OrchestratorError::OutOfSequence {
                operation,
                state: session.state,
            });
        }

        match acquired {
            Some(Ok(handle)) => {
                if let Some(stale) = device.replace(handle) {
                    stale.release();
                }
            }
            Some(Err(error)) => {
                let error = OrchestratorError::from(error);
                self.notify(session, format!("{error}. Please try again."));
                return Err(error);
            }
            None => {}
        }

        self.move_to(session, SessionState::Capturing(factor));
        Ok(())
    }

    /// Verifies a sample the UI captured itself.
    pub async fn submit_capture(&self, sample: Sample) -> Result<FactorOutcome, OrchestratorError> {
        self.submit(None, sample).await
    }

    /// Reads the sample from the held device (or the typed voter id for identity lookup)
    /// and verifies it.
    pub async fn capture_and_submit(&self) -> Result<FactorOutcome, OrchestratorError> {
        let (ticket, lease, voter_id) = {
            let mut inner = self.inner.lock().await;
            self.expire_if_idle(&mut inner)?;
            let OrchestratorState {
                session,
                device,
                generation,
                ..
            } = &mut *inner;
            let session = open_session(session, "capture")?;
            let SessionState::Capturing(factor) = session.state else {
                return Err(OrchestratorError::OutOfSequence {
                    operation: "capture".to_string(),
                    state: session.state,
                });
            };
            let ticket = Ticket {
                generation: *generation,
                factor,
            };
            (
                ticket,
                device.as_ref().map(DeviceHandle::lease),
                session.voter_id.clone(),
            )
        };

        let sample = match lease {
            None => Sample::typed(voter_id.as_str().as_bytes()),
            Some(lease) => match self.devices.capture_leased(lease).await {
                Ok(sample) => sample,
                Err(error) => return Err(self.abort_capture(ticket, error.into()).await),
            },
        };

        self.submit(Some(ticket), sample).await
    }

    pub async fn cancel(&self) -> Result<(), OrchestratorError> {
        let mut inner = self.inner.lock().await;
        let OrchestratorState {
            session,
            device,
            generation,
            ..
        } = &mut *inner;
        let Some(session) = session.as_mut() else {
            return Ok(());
        };

        match session.state {
            SessionState::Cancelled => return Ok(()),
            SessionState::VoteComplete => return Err(OrchestratorError::SessionClosed),
            SessionState::VoteSubmitting => {
                return Err(OrchestratorError::OutOfSequence {
                    operation: "cancel".to_string(),
                    state: session.state,
                })
            }
            _ => {}
        }

        if let Some(handle) = device.take() {
            handle.release();
        }
        *generation += 1;
        let from = self.move_to(session, SessionState::Cancelled);
        self.notify(session, "Verification cancelled.");
        info!(session_id = %session.session_id, from = %from, "verification session cancelled");
        Ok(())
    }

    /// Casts the ballot once every factor has passed. Returns the ledger transaction reference.
    pub async fn request_vote(&self) -> Result<String, OrchestratorError> {
        let (generation, request) = {
            let mut inner = self.inner.lock().await;
            self.expire_if_idle(&mut inner)?;
            let OrchestratorState {
                session,
                generation,
                vote_in_flight,
                ..
            } = &mut *inner;
            let Some(session) = session.as_mut() else {
                return Err(OrchestratorError::InvalidSession(
                    "no session has been started".to_string(),
                ));
            };

            match session.state {
                SessionState::VoteSubmitting => return Err(OrchestratorError::DuplicateVote),
                state if state.is_terminal() => return Err(OrchestratorError::SessionClosed),
                SessionState::AllFactorsComplete if session.all_factors_satisfied() => {}
                _ => {
                    return Err(OrchestratorError::IncompleteVerification {
                        pending: session.pending_factors(),
                    })
                }
            }
            if *vote_in_flight {
                return Err(OrchestratorError::DuplicateVote);
            }

            // Set before dispatch so a second caller sees it while the first is in flight.
            *vote_in_flight = true;
            self.move_to(session, SessionState::VoteSubmitting);
            let request = CastVoteRequest {
                voter_id: session.voter_id.clone(),
                polling_station: session.polling_station.clone(),
                factor_evidence_refs: session.evidence_refs(),
            };
            (*generation, request)
        };

        let result = timeout(self.policy.vote_timeout, self.ballot.cast_vote(request)).await;

        let mut inner = self.inner.lock().await;
        let OrchestratorState {
            session,
            generation: current,
            vote_in_flight,
            ..
        } = &mut *inner;
        let Some(session) = session
            .as_mut()
            .filter(|s| *current == generation && s.state == SessionState::VoteSubmitting)
        else {
            debug!(generation, "discarding stale ledger response");
            return Err(OrchestratorError::SessionClosed);
        };

        let outcome = match result {
            Err(_) => Err(OrchestratorError::VoteRejected(format!(
                "ledger did not answer within {:?}",
                self.policy.vote_timeout
            ))),
            Ok(Err(error)) => Err(error.into()),
            Ok(Ok(response)) if !response.success => Err(OrchestratorError::VoteRejected(
                "ledger declined the vote".to_string(),
            )),
            Ok(Ok(response)) => Ok(response.transaction_ref),
        };

        match outcome {
            Ok(transaction_ref) => {
                session.vote_submitted = true;
                self.move_to(session, SessionState::VoteComplete);
                self.notify(session, "Vote recorded successfully.");
                info!(
                    session_id = %session.session_id,
                    voter_id = %session.voter_id,
                    %transaction_ref,
                    "vote submitted"
                );
                let _ = self.events.send(SessionEvent::VoteRecorded {
                    session_id: session.session_id,
                    transaction_ref: transaction_ref.clone(),
                });
                Ok(transaction_ref)
            }
            Err(OrchestratorError::AlreadyVoted) => {
                // Typically a retry after a timed-out submission the ledger did record.
                *vote_in_flight = false;
                *current += 1;
                self.move_to(session, SessionState::Cancelled);
                self.notify(
                    session,
                    "This voter already has a vote on record. Please ask an official for help.",
                );
                warn!(session_id = %session.session_id, voter_id = %session.voter_id, "ledger already holds a vote for this voter");
                Err(OrchestratorError::AlreadyVoted)
            }
            Err(error) => {
                *vote_in_flight = false;
                self.move_to(session, SessionState::AllFactorsComplete);
                self.notify(session, format!("{error}. Please try again."));
                warn!(session_id = %session.session_id, %error, "vote submission failed");
                Err(error)
            }
        }
    }

    async fn submit(
        &self,
        expected: Option<Ticket>,
        sample: Sample,
    ) -> Result<FactorOutcome, OrchestratorError> {
        let (ticket, request) = {
            let mut inner = self.inner.lock().await;
            if expected.is_none() {
                self.expire_if_idle(&mut inner)?;
            }
            let OrchestratorState {
                session,
                device,
                generation,
                ..
            } = &mut *inner;

            if let Some(expected) = expected {
                let still_capturing = session.as_ref().is_some_and(|s| {
                    s.state == SessionState::Capturing(expected.factor)
                });
                if *generation != expected.generation || !still_capturing {
                    debug!(generation = expected.generation, factor = %expected.factor, "discarding stale capture");
                    return Err(OrchestratorError::SessionClosed);
                }
            }

            let session = open_session(session, "sample submission")?;
            let SessionState::Capturing(factor) = session.state else {
                return Err(OrchestratorError::OutOfSequence {
                    operation: "sample submission".to_string(),
                    state: session.state,
                });
            };

            if let Some(handle) = device.take() {
                handle.release();
            }
            self.move_to(session, SessionState::Verifying(factor));
            let request =
                build_verify_request(&sample, &session.voter_id, &session.polling_station, factor);
            (
                Ticket {
                    generation: *generation,
                    factor,
                },
                request,
            )
        };

        self.run_verification(ticket, request).await
    }

    async fn run_verification(
        &self,
        ticket: Ticket,
        request: VerifyRequest,
    ) -> Result<FactorOutcome, OrchestratorError> {
        let result = timeout(self.policy.verifier_timeout, self.verifier.verify(request)).await;

        let mut inner = self.inner.lock().await;
        let OrchestratorState {
            session,
            generation,
            ..
        } = &mut *inner;
        let Some(session) = session.as_mut().filter(|s| {
            *generation == ticket.generation && s.state == SessionState::Verifying(ticket.factor)
        }) else {
            debug!(generation = ticket.generation, factor = %ticket.factor, "discarding stale verifier response");
            return Err(OrchestratorError::SessionClosed);
        };

        let response = match result {
            Err(_) => Err(OrchestratorError::VerifierTransport(format!(
                "no answer within {:?}",
                self.policy.verifier_timeout
            ))),
            Ok(Err(error)) => Err(OrchestratorError::from(error)),
            Ok(Ok(response)) => Ok(response),
        };

        match response {
            Ok(response) => self.apply_decision(session, ticket.factor, response),
            Err(error) => {
                warn!(session_id = %session.session_id, factor = %ticket.factor, %error, "verification did not complete");
                self.move_to(session, SessionState::AwaitingFactor(ticket.factor));
                self.notify(session, format!("{error}. Please try again."));
                Err(error)
            }
        }
    }

    fn apply_decision(
        &self,
        session: &mut VerificationSession,
        factor: FactorKind,
        response: VerifyResponse,
    ) -> Result<FactorOutcome, OrchestratorError> {
        let now = Utc::now();
        let attempted_at = match session.factor_results.get(&factor) {
            Some(previous) if previous.attempted_at >= now => {
                previous.attempted_at + chrono::Duration::microseconds(1)
            }
            _ => now,
        };
        let outcome = FactorOutcome {
            factor_kind: factor,
            success: response.success,
            confidence: response.confidence,
            method: response.method,
            evidence_ref: response.evidence_ref,
            attempted_at,
            attempt_count: session.attempt_count(factor) + 1,
        };
        session.record_outcome(outcome.clone());
        let _ = self.events.send(SessionEvent::FactorRecorded {
            session_id: session.session_id,
            outcome: outcome.clone(),
        });

        if outcome.success {
            info!(
                session_id = %session.session_id,
                %factor,
                confidence = outcome.confidence,
                attempts = outcome.attempt_count,
                "factor verified"
            );
            self.move_to(session, SessionState::FactorComplete(factor));
            let next = match session.next_pending_factor() {
                Some(next) => SessionState::AwaitingFactor(next),
                None => SessionState::AllFactorsComplete,
            };
            self.move_to(session, next);
            self.notify(session, format!("{factor} verification successful."));
            return Ok(outcome);
        }

        let attempts = outcome.attempt_count;
        if let Some(max) = self
            .policy
            .max_attempts_per_factor
            .filter(|max| attempts >= *max)
        {
            warn!(session_id = %session.session_id, %factor, attempts, max, "retry limit reached");
            self.move_to(session, SessionState::Failed(factor));
            self.notify(
                session,
                format!("{factor} verification failed {attempts} times. Please ask an official for help."),
            );
            return Err(OrchestratorError::RetryLimitExceeded { factor, attempts });
        }

        info!(session_id = %session.session_id, %factor, attempts, "factor rejected");
        self.move_to(session, SessionState::AwaitingFactor(factor));
        self.notify(session, format!("{factor} verification failed. Please try again."));
        Err(OrchestratorError::VerifierRejected {
            factor,
            attempt_count: attempts,
        })
    }

    /// Gives the device back after a failed capture and reopens the same step.
    async fn abort_capture(&self, ticket: Ticket, error: OrchestratorError) -> OrchestratorError {
        let mut inner = self.inner.lock().await;
        let OrchestratorState {
            session,
            device,
            generation,
            ..
        } = &mut *inner;
        let Some(session) = session.as_mut().filter(|s| {
            *generation == ticket.generation && s.state == SessionState::Capturing(ticket.factor)
        }) else {
            return OrchestratorError::SessionClosed;
        };

        if let Some(handle) = device.take() {
            handle.release();
        }
        warn!(session_id = %session.session_id, factor = %ticket.factor, %error, "capture failed");
        self.move_to(session, SessionState::AwaitingFactor(ticket.factor));
        self.notify(session, format!("{error}. Please try again."));
        error
    }

    fn expire_if_idle(&self, inner: &mut OrchestratorState) -> Result<(), OrchestratorError> {
        let Some(limit) = self.policy.session_idle_timeout else {
            return Ok(());
        };
        let OrchestratorState {
            session: Some(session),
            device,
            generation,
            ..
        } = inner
        else {
            return Ok(());
        };
        if session.state.is_terminal() || session.state == SessionState::VoteSubmitting {
            return Ok(());
        }

        let idle = Utc::now()
            .signed_duration_since(session.last_transition_at)
            .to_std()
            .unwrap_or_default();
        if idle <= limit {
            return Ok(());
        }

        if let Some(handle) = device.take() {
            handle.release();
        }
        *generation += 1;
        self.move_to(session, SessionState::Cancelled);
        self.notify(session, "Session expired. Please start again.");
        warn!(session_id = %session.session_id, idle_secs = idle.as_secs(), "session expired");
        Err(OrchestratorError::SessionExpired {
            idle_secs: idle.as_secs(),
        })
    }

    fn move_to(&self, session: &mut VerificationSession, to: SessionState) -> SessionState {
        let from = session.transition(to);
        debug!(session_id = %session.session_id, %from, %to, "session transition");
        let _ = self.events.send(SessionEvent::StateChanged {
            session_id: session.session_id,
            from,
            to,
        });
        from
    }

    fn notify(&self, session: &mut VerificationSession, message: impl Into<String>) {
        let message = message.into();
        session.last_message = Some(message.clone());
        let _ = self.events.send(SessionEvent::Notice {
            session_id: session.session_id,
            message,
        });
    }
}

fn open_session<'a>(
    slot: &'a mut Option<VerificationSession>,
    operation: &str,
) -> Result<&'a mut VerificationSession, OrchestratorError> {
    match slot {
        None => Err(OrchestratorError::OutOfSequence {
            operation: operation.to_string(),
            state: SessionState::Idle,
        }),
        Some(session) if session.state.is_terminal() => Err(OrchestratorError::SessionClosed),
        Some(session) => Ok(session),
    }
}

#[cfg(test)]
#[path = "tests/orchestrator_tests.rs"]
mod tests;
