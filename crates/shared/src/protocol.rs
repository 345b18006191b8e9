use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{FactorKind, PollingStationId, VoterId};

/// Body of `POST /verify/{factor}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyRequest {
    pub factor_kind: FactorKind,
    pub sample_b64: String,
    pub voter_id: VoterId,
    pub polling_station: PollingStationId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub success: bool,
    pub confidence: f64,
    pub method: String,
    pub evidence_ref: String,
}

/// Body of `POST /vote`. Evidence references follow the session's factor order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CastVoteRequest {
    pub voter_id: VoterId,
    pub polling_station: PollingStationId,
    pub factor_evidence_refs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CastVoteResponse {
    pub success: bool,
    pub transaction_ref: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannerStatusResponse {
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConnectRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
}

/// Body of `POST /register`: enrolls a fingerprint template for a voter on the roster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterFingerprintRequest {
    pub voter_id: VoterId,
    pub sample_b64: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterFingerprintResponse {
    pub success: bool,
    pub message: String,
}

/// Non-sensitive station settings, as returned by `GET /config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationConfigResponse {
    pub version: String,
    pub similarity_threshold: f64,
    pub registered_voters: usize,
    pub enrolled_fingerprints: usize,
}

/// One hash-chained entry of the station ledger, as returned by `GET /ledger`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerBlock {
    pub index: u64,
    pub voter_id: VoterId,
    pub polling_station: PollingStationId,
    pub factor_evidence_refs: Vec<String>,
    pub previous_hash: String,
    pub hash: String,
    pub recorded_at: DateTime<Utc>,
}
