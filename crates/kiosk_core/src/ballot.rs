use async_trait::async_trait;
use reqwest::Client;
use shared::{
    error::{ApiError, ErrorCode},
    protocol::{CastVoteRequest, CastVoteResponse},
};
use thiserror::Error;
use tracing::info;

use crate::verifier::api_error_message;

#[derive(Debug, Error)]
pub enum VoteSubmissionError {
    #[error("transport failure: {0}")]
    Transport(String),
    /// The ledger already holds a vote for this voter; retrying cannot succeed.
    #[error("ledger already holds a vote for this voter: {0}")]
    AlreadyVoted(String),
    #[error("ledger returned {status}: {message}")]
    Ledger { status: u16, message: String },
    #[error("malformed ledger response: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for VoteSubmissionError {
    fn from(value: reqwest::Error) -> Self {
        VoteSubmissionError::Transport(value.to_string())
    }
}

#[async_trait]
pub trait VoteSubmissionClient: Send + Sync {
    async fn cast_vote(&self, request: CastVoteRequest)
        -> Result<CastVoteResponse, VoteSubmissionError>;
}

pub struct HttpVoteClient {
    http: Client,
    base_url: String,
}

impl HttpVoteClient {
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
impl VoteSubmissionClient for HttpVoteClient {
    async fn cast_vote(
        &self,
        request: CastVoteRequest,
    ) -> Result<CastVoteResponse, VoteSubmissionError> {
        let response = self
            .http
            .post(format!("{}/vote", self.base_url))
            .json(&request)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if let Ok(api) = serde_json::from_str::<ApiError>(&body) {
                if api.code == ErrorCode::AlreadyVoted {
                    return Err(VoteSubmissionError::AlreadyVoted(api.message));
                }
            }
            return Err(VoteSubmissionError::Ledger {
                status: status.as_u16(),
                message: api_error_message(body),
            });
        }

        let body: CastVoteResponse = response
            .json()
            .await
            .map_err(|e| VoteSubmissionError::Malformed(e.to_string()))?;
        if body.success {
            info!(voter_id = %request.voter_id, transaction_ref = %body.transaction_ref, "vote recorded on ledger");
        }
        Ok(body)
    }
}
