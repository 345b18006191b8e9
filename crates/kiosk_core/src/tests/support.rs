//! Scripted collaborators shared by the unit tests.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use shared::{
    domain::{DeviceKind, FactorKind},
    protocol::{CastVoteRequest, CastVoteResponse, VerifyRequest, VerifyResponse},
};
use tokio::sync::Notify;

use crate::{
    ballot::{VoteSubmissionClient, VoteSubmissionError},
    device::{CaptureDevice, DeviceError},
    verifier::{VerifierClient, VerifierError},
};

pub struct ScriptedDevice {
    kind: DeviceKind,
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    fail_open: AtomicBool,
    open_delay: Mutex<Option<Duration>>,
    capture_delay: Mutex<Option<Duration>>,
    sample: Vec<u8>,
}

impl ScriptedDevice {
    pub fn new(kind: DeviceKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            opens: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            fail_open: AtomicBool::new(false),
            open_delay: Mutex::new(None),
            capture_delay: Mutex::new(None),
            sample: format!("{kind}-sample").into_bytes(),
        })
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn set_open_delay(&self, delay: Option<Duration>) {
        *self.open_delay.lock().expect("delay lock") = delay;
    }

    pub fn set_capture_delay(&self, delay: Option<Duration>) {
        *self.capture_delay.lock().expect("delay lock") = delay;
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptureDevice for ScriptedDevice {
    fn kind(&self) -> DeviceKind {
        self.kind
    }

    async fn open(&self) -> Result<(), DeviceError> {
        let delay = *self.open_delay.lock().expect("delay lock");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(DeviceError::Unavailable {
                kind: self.kind,
                reason: "unplugged".to_string(),
            });
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read_sample(&self) -> Result<Vec<u8>, DeviceError> {
        let delay = *self.capture_delay.lock().expect("delay lock");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.sample.clone())
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub enum VerifierStep {
    Accept,
    Reject,
    Transport,
    /// Waits for [`ScriptedVerifier::release_gate`] and then accepts.
    GatedAccept,
}

pub struct ScriptedVerifier {
    script: Mutex<VecDeque<VerifierStep>>,
    pub requests: Mutex<Vec<VerifyRequest>>,
    gate: Notify,
    pub entered_gate: Notify,
}

impl ScriptedVerifier {
    pub fn new(steps: impl IntoIterator<Item = VerifierStep>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(steps.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
            gate: Notify::new(),
            entered_gate: Notify::new(),
        })
    }

    pub fn accepting() -> Arc<Self> {
        Self::new(std::iter::empty())
    }

    pub fn release_gate(&self) {
        self.gate.notify_one();
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().expect("requests lock").len()
    }

    pub fn factors_seen(&self) -> Vec<FactorKind> {
        self.requests
            .lock()
            .expect("requests lock")
            .iter()
            .map(|request| request.factor_kind)
            .collect()
    }
}

pub fn accepted(factor: FactorKind) -> VerifyResponse {
    VerifyResponse {
        success: true,
        confidence: 0.93,
        method: factor.path_segment().to_string(),
        evidence_ref: format!("0x{factor}-evidence"),
    }
}

#[async_trait]
impl VerifierClient for ScriptedVerifier {
    async fn verify(&self, request: VerifyRequest) -> Result<VerifyResponse, VerifierError> {
        let factor = request.factor_kind;
        self.requests.lock().expect("requests lock").push(request);
        let step = self
            .script
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or(VerifierStep::Accept);
        match step {
            VerifierStep::Accept => Ok(accepted(factor)),
            VerifierStep::Reject => Ok(VerifyResponse {
                success: false,
                confidence: 0.41,
                method: factor.path_segment().to_string(),
                evidence_ref: String::new(),
            }),
            VerifierStep::Transport => Err(VerifierError::Transport("connection reset".to_string())),
            VerifierStep::GatedAccept => {
                self.entered_gate.notify_one();
                self.gate.notified().await;
                Ok(accepted(factor))
            }
        }
    }
}

pub struct CountingVoteClient {
    pub dispatched: AtomicUsize,
    fail_next: AtomicBool,
    already_voted_next: AtomicBool,
    delay: Duration,
    pub requests: Mutex<Vec<CastVoteRequest>>,
}

impl CountingVoteClient {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            dispatched: AtomicUsize::new(0),
            fail_next: AtomicBool::new(false),
            already_voted_next: AtomicBool::new(false),
            delay,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// The next submission is answered as if the ledger already held this voter's vote.
    pub fn already_voted_next(&self) {
        self.already_voted_next.store(true, Ordering::SeqCst);
    }

    pub fn dispatched(&self) -> usize {
        self.dispatched.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VoteSubmissionClient for CountingVoteClient {
    async fn cast_vote(
        &self,
        request: CastVoteRequest,
    ) -> Result<CastVoteResponse, VoteSubmissionError> {
        self.dispatched.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().expect("requests lock").push(request);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(VoteSubmissionError::Transport("ledger offline".to_string()));
        }
        if self.already_voted_next.swap(false, Ordering::SeqCst) {
            return Err(VoteSubmissionError::AlreadyVoted(
                "voter has already voted".to_string(),
            ));
        }
        Ok(CastVoteResponse {
            success: true,
            transaction_ref: "0xvote".to_string(),
        })
    }
}
