//! Append-only, hash-chained vote ledger kept in memory.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use shared::{
    domain::{PollingStationId, VoterId},
    protocol::LedgerBlock,
};
use thiserror::Error;

pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("voter {0} has already voted")]
    AlreadyVoted(VoterId),
    #[error("a vote must reference the evidence of at least one verified factor")]
    MissingEvidence,
}

#[derive(Debug, Default)]
pub struct Ledger {
    blocks: Vec<LedgerBlock>,
    voted: HashSet<VoterId>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_voted(&self, voter_id: &VoterId) -> bool {
        self.voted.contains(voter_id)
    }

    pub fn blocks(&self) -> &[LedgerBlock] {
        &self.blocks
    }

    pub fn append(
        &mut self,
        voter_id: VoterId,
        polling_station: PollingStationId,
        factor_evidence_refs: Vec<String>,
    ) -> Result<LedgerBlock, LedgerError> {
        if self.has_voted(&voter_id) {
            return Err(LedgerError::AlreadyVoted(voter_id));
        }
        if factor_evidence_refs.iter().all(|r| r.trim().is_empty()) {
            return Err(LedgerError::MissingEvidence);
        }

        let index = self.blocks.len() as u64;
        let previous_hash = self
            .blocks
            .last()
            .map_or_else(|| GENESIS_HASH.to_string(), |block| block.hash.clone());
        let recorded_at = Utc::now();
        let hash = block_hash(
            index,
            &voter_id,
            &polling_station,
            &factor_evidence_refs,
            &previous_hash,
            &recorded_at,
        );

        let block = LedgerBlock {
            index,
            voter_id: voter_id.clone(),
            polling_station,
            factor_evidence_refs,
            previous_hash,
            hash,
            recorded_at,
        };
        self.voted.insert(voter_id);
        self.blocks.push(block.clone());
        Ok(block)
    }

    /// Recomputes every hash and link from the genesis hash forward.
    pub fn verify_chain(&self) -> bool {
        let mut expected_previous = GENESIS_HASH;
        for (position, block) in self.blocks.iter().enumerate() {
            if block.index != position as u64 || block.previous_hash != expected_previous {
                return false;
            }
            let recomputed = block_hash(
                block.index,
                &block.voter_id,
                &block.polling_station,
                &block.factor_evidence_refs,
                &block.previous_hash,
                &block.recorded_at,
            );
            if recomputed != block.hash {
                return false;
            }
            expected_previous = &block.hash;
        }
        true
    }
}

fn block_hash(
    index: u64,
    voter_id: &VoterId,
    polling_station: &PollingStationId,
    factor_evidence_refs: &[String],
    previous_hash: &str,
    recorded_at: &DateTime<Utc>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(index.to_be_bytes());
    let recorded_at = recorded_at.to_rfc3339();
    // Length prefixes keep field boundaries unambiguous.
    for field in [
        voter_id.as_str(),
        polling_station.as_str(),
        previous_hash,
        recorded_at.as_str(),
    ] {
        hasher.update((field.len() as u64).to_be_bytes());
        hasher.update(field.as_bytes());
    }
    hasher.update((factor_evidence_refs.len() as u64).to_be_bytes());
    for evidence in factor_evidence_refs {
        hasher.update((evidence.len() as u64).to_be_bytes());
        hasher.update(evidence.as_bytes());
    }
    hex::encode(hasher.finalize())
}
