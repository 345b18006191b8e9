use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha2::{Digest, Sha256};
use shared::{
    domain::{FactorKind, VoterId},
    error::{ApiError, ErrorCode},
    protocol::{
        CastVoteRequest, CastVoteResponse, LedgerBlock, RegisterFingerprintRequest,
        RegisterFingerprintResponse, ScannerStatusResponse, StationConfigResponse, VerifyRequest,
        VerifyResponse,
    },
};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::ledger::{Ledger, LedgerError};

#[derive(Debug, Clone, Copy)]
pub struct MatchPolicy {
    /// Minimum biometric similarity accepted as a match.
    pub similarity_threshold: f64,
    /// Similarity the simulated matcher reports for every biometric sample.
    pub simulated_confidence: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ScannerState {
    pub connected: bool,
    pub port: Option<String>,
}

#[derive(Clone)]
pub struct StationContext {
    pub roster: Arc<HashSet<VoterId>>,
    pub policy: MatchPolicy,
    pub default_scanner_port: String,
    pub scanner: Arc<RwLock<ScannerState>>,
    /// SHA-256 of each voter's enrolled fingerprint scan.
    pub fingerprints: Arc<RwLock<HashMap<VoterId, [u8; 32]>>>,
    pub ledger: Arc<Mutex<Ledger>>,
}

impl StationContext {
    pub fn new(
        roster: impl IntoIterator<Item = VoterId>,
        policy: MatchPolicy,
        default_scanner_port: impl Into<String>,
        scanner: ScannerState,
    ) -> Self {
        Self {
            roster: Arc::new(roster.into_iter().collect()),
            policy,
            default_scanner_port: default_scanner_port.into(),
            scanner: Arc::new(RwLock::new(scanner)),
            fingerprints: Arc::new(RwLock::new(HashMap::new())),
            ledger: Arc::new(Mutex::new(Ledger::new())),
        }
    }
}

pub async fn verify_factor(
    ctx: &StationContext,
    factor: FactorKind,
    request: VerifyRequest,
) -> Result<VerifyResponse, ApiError> {
    if request.factor_kind != factor {
        return Err(validation(format!(
            "request is for {} but was posted to /verify/{factor}",
            request.factor_kind
        )));
    }
    if request.voter_id.is_blank() || request.polling_station.is_blank() {
        return Err(validation("voter_id and polling_station are required"));
    }
    let sample = STANDARD
        .decode(request.sample_b64.as_bytes())
        .map_err(|e| validation(format!("sample is not valid base64: {e}")))?;
    if sample.is_empty() {
        return Err(validation("sample is empty"));
    }

    if factor == FactorKind::Fingerprint && !ctx.scanner.read().await.connected {
        warn!(voter_id = %request.voter_id, "fingerprint verification requested with scanner disconnected");
        return Err(ApiError::new(
            ErrorCode::DeviceUnavailable,
            "fingerprint scanner not connected",
        ));
    }

    let registered = ctx.roster.contains(&request.voter_id);
    // An enrolled template must match the scan; voters without one fall back to the simulator.
    let template_mismatch = factor == FactorKind::Fingerprint
        && ctx
            .fingerprints
            .read()
            .await
            .get(&request.voter_id)
            .is_some_and(|template| *template != scan_digest(&sample));
    let confidence = match factor {
        FactorKind::IdentityLookup if registered => 1.0,
        FactorKind::IdentityLookup => 0.0,
        FactorKind::Fingerprint if template_mismatch => 0.0,
        FactorKind::Face | FactorKind::Fingerprint if registered => {
            ctx.policy.simulated_confidence.clamp(0.0, 1.0)
        }
        FactorKind::Face | FactorKind::Fingerprint => 0.0,
    };
    let success = match factor {
        FactorKind::IdentityLookup => registered,
        _ => registered && confidence >= ctx.policy.similarity_threshold,
    };

    let evidence_ref = if success {
        evidence_ref(factor, &request, &sample)
    } else {
        String::new()
    };
    info!(
        voter_id = %request.voter_id,
        polling_station = %request.polling_station,
        %factor,
        success,
        confidence,
        "verification decided"
    );

    Ok(VerifyResponse {
        success,
        confidence,
        method: method_name(factor).to_string(),
        evidence_ref,
    })
}

pub async fn cast_vote(
    ctx: &StationContext,
    request: CastVoteRequest,
) -> Result<CastVoteResponse, ApiError> {
    if !ctx.roster.contains(&request.voter_id) {
        return Err(ApiError::new(
            ErrorCode::NotFound,
            format!("voter {} is not registered", request.voter_id),
        ));
    }

    let block = ctx
        .ledger
        .lock()
        .await
        .append(
            request.voter_id,
            request.polling_station,
            request.factor_evidence_refs,
        )
        .map_err(|error| match error {
            LedgerError::AlreadyVoted(_) => {
                ApiError::new(ErrorCode::AlreadyVoted, "voter has already voted")
            }
            LedgerError::MissingEvidence => validation(error.to_string()),
        })?;

    info!(voter_id = %block.voter_id, index = block.index, hash = %block.hash, "vote appended to ledger");
    Ok(CastVoteResponse {
        success: true,
        transaction_ref: format!("0x{}", block.hash),
    })
}

pub async fn register_fingerprint(
    ctx: &StationContext,
    request: RegisterFingerprintRequest,
) -> Result<RegisterFingerprintResponse, ApiError> {
    if request.voter_id.is_blank() {
        return Err(validation("voter_id is required"));
    }
    let sample = STANDARD
        .decode(request.sample_b64.as_bytes())
        .map_err(|e| validation(format!("sample is not valid base64: {e}")))?;
    if sample.is_empty() {
        return Err(validation("sample is empty"));
    }
    if !ctx.roster.contains(&request.voter_id) {
        return Err(ApiError::new(
            ErrorCode::NotFound,
            format!("voter {} is not registered", request.voter_id),
        ));
    }
    if !ctx.scanner.read().await.connected {
        return Err(ApiError::new(
            ErrorCode::DeviceUnavailable,
            "fingerprint scanner not connected",
        ));
    }

    let mut fingerprints = ctx.fingerprints.write().await;
    if fingerprints.contains_key(&request.voter_id) {
        return Err(validation(format!(
            "voter {} already has an enrolled fingerprint",
            request.voter_id
        )));
    }
    fingerprints.insert(request.voter_id.clone(), scan_digest(&sample));
    info!(voter_id = %request.voter_id, "fingerprint enrolled");
    Ok(RegisterFingerprintResponse {
        success: true,
        message: "Fingerprint registered successfully".to_string(),
    })
}

pub async fn station_config(ctx: &StationContext) -> StationConfigResponse {
    StationConfigResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        similarity_threshold: ctx.policy.similarity_threshold,
        registered_voters: ctx.roster.len(),
        enrolled_fingerprints: ctx.fingerprints.read().await.len(),
    }
}

pub async fn scanner_status(ctx: &StationContext) -> ScannerStatusResponse {
    let scanner = ctx.scanner.read().await;
    ScannerStatusResponse {
        connected: scanner.connected,
        port: scanner.port.clone(),
    }
}

pub async fn connect_scanner(ctx: &StationContext, port: Option<String>) -> ScannerStatusResponse {
    let port = port
        .filter(|p| !p.trim().is_empty())
        .unwrap_or_else(|| ctx.default_scanner_port.clone());
    let mut scanner = ctx.scanner.write().await;
    scanner.connected = true;
    scanner.port = Some(port.clone());
    info!(%port, "fingerprint scanner connected");
    ScannerStatusResponse {
        connected: true,
        port: Some(port),
    }
}

pub async fn disconnect_scanner(ctx: &StationContext) -> ScannerStatusResponse {
    let mut scanner = ctx.scanner.write().await;
    if scanner.connected {
        info!(port = ?scanner.port, "fingerprint scanner disconnected");
    }
    scanner.connected = false;
    scanner.port = None;
    ScannerStatusResponse {
        connected: false,
        port: None,
    }
}

pub async fn ledger_blocks(ctx: &StationContext) -> Vec<LedgerBlock> {
    ctx.ledger.lock().await.blocks().to_vec()
}

/// Whether the chain still verifies, and its length.
pub async fn audit_ledger(ctx: &StationContext) -> (bool, usize) {
    let ledger = ctx.ledger.lock().await;
    (ledger.verify_chain(), ledger.blocks().len())
}

fn method_name(factor: FactorKind) -> &'static str {
    match factor {
        FactorKind::IdentityLookup => "roster_lookup",
        FactorKind::Face => "face_similarity",
        FactorKind::Fingerprint => "fingerprint_similarity",
    }
}

fn evidence_ref(factor: FactorKind, request: &VerifyRequest, sample: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(factor.path_segment().as_bytes());
    hasher.update([0]);
    hasher.update(request.voter_id.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(request.polling_station.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(sample);
    format!("0x{}", hex::encode(&hasher.finalize()[..16]))
}

fn scan_digest(sample: &[u8]) -> [u8; 32] {
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&Sha256::digest(sample));
    digest
}

fn validation(message: impl Into<String>) -> ApiError {
    ApiError::new(ErrorCode::Validation, message)
}

#[cfg(test)]
#[path = "tests/mod_tests.rs"]
mod tests;
