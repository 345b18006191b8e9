use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::Client;
use shared::{
    domain::{FactorKind, PollingStationId, VoterId},
    error::ApiError,
    protocol::{VerifyRequest, VerifyResponse},
};
use thiserror::Error;
use tracing::debug;

use crate::device::Sample;

/// Failures that prevented the verification service from giving a decision.
/// A rejected sample is not an error; it comes back as `success: false`.
#[derive(Debug, Error)]
pub enum VerifierError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("verification service returned {status}: {message}")]
    Service { status: u16, message: String },
    #[error("malformed verifier response: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for VerifierError {
    fn from(value: reqwest::Error) -> Self {
        VerifierError::Transport(value.to_string())
    }
}

#[async_trait]
pub trait VerifierClient: Send + Sync {
    async fn verify(&self, request: VerifyRequest) -> Result<VerifyResponse, VerifierError>;
}

pub fn build_verify_request(
    sample: &Sample,
    voter_id: &VoterId,
    polling_station: &PollingStationId,
    factor_kind: FactorKind,
) -> VerifyRequest {
    VerifyRequest {
        factor_kind,
        sample_b64: STANDARD.encode(&sample.bytes),
        voter_id: voter_id.clone(),
        polling_station: polling_station.clone(),
    }
}

pub struct HttpVerifierClient {
    http: Client,
    base_url: String,
}

impl HttpVerifierClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl VerifierClient for HttpVerifierClient {
    async fn verify(&self, request: VerifyRequest) -> Result<VerifyResponse, VerifierError> {
        let url = format!(
            "{}/verify/{}",
            self.base_url,
            request.factor_kind.path_segment()
        );
        debug!(%url, voter_id = %request.voter_id, "submitting verification sample");

        let response = self.http.post(&url).json(&request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VerifierError::Service {
                status: status.as_u16(),
                message: api_error_message(body),
            });
        }

        let body: VerifyResponse = response
            .json()
            .await
            .map_err(|e| VerifierError::Malformed(e.to_string()))?;
        validate_response(body)
    }
}

/// Prefers the `ApiError` message of an error body, falling back to the raw text.
pub(crate) fn api_error_message(body: String) -> String {
    serde_json::from_str::<ApiError>(&body)
        .map(|api| api.message)
        .unwrap_or(body)
}

fn validate_response(body: VerifyResponse) -> Result<VerifyResponse, VerifierError> {
    if !body.confidence.is_finite() || !(0.0..=1.0).contains(&body.confidence) {
        return Err(VerifierError::Malformed(format!(
            "confidence {} outside [0, 1]",
            body.confidence
        )));
    }
    if body.success && body.evidence_ref.trim().is_empty() {
        return Err(VerifierError::Malformed(
            "successful verification without evidence reference".to_string(),
        ));
    }
    Ok(body)
}

#[cfg(test)]
#[path = "tests/http_clients_tests.rs"]
mod tests;
