use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::domain::{FactorKind, PollingStationId, SessionId, VoterId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "factor", rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    AwaitingFactor(FactorKind),
    Capturing(FactorKind),
    Verifying(FactorKind),
    FactorComplete(FactorKind),
    AllFactorsComplete,
    VoteSubmitting,
    VoteComplete,
    Failed(FactorKind),
    Cancelled,
}

impl SessionState {
    /// States from which no further progress is possible for the session.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::VoteComplete | SessionState::Failed(_) | SessionState::Cancelled
        )
    }

    pub fn factor(self) -> Option<FactorKind> {
        match self {
            SessionState::AwaitingFactor(k)
            | SessionState::Capturing(k)
            | SessionState::Verifying(k)
            | SessionState::FactorComplete(k)
            | SessionState::Failed(k) => Some(k),
            _ => None,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => f.write_str("idle"),
            SessionState::AwaitingFactor(k) => write!(f, "awaiting {k}"),
            SessionState::Capturing(k) => write!(f, "capturing {k}"),
            SessionState::Verifying(k) => write!(f, "verifying {k}"),
            SessionState::FactorComplete(k) => write!(f, "{k} complete"),
            SessionState::AllFactorsComplete => f.write_str("all factors complete"),
            SessionState::VoteSubmitting => f.write_str("submitting vote"),
            SessionState::VoteComplete => f.write_str("vote complete"),
            SessionState::Failed(k) => write!(f, "failed at {k}"),
            SessionState::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FactorOutcome {
    pub factor_kind: FactorKind,
    pub success: bool,
    pub confidence: f64,
    pub method: String,
    pub evidence_ref: String,
    pub attempted_at: DateTime<Utc>,
    pub attempt_count: u32,
}

/// One voter's verification attempt at one polling station.
#[derive(Debug, Clone, Serialize)]
pub struct VerificationSession {
    pub session_id: SessionId,
    pub voter_id: VoterId,
    pub polling_station: PollingStationId,
    pub required_factors: Vec<FactorKind>,
    pub factor_results: BTreeMap<FactorKind, FactorOutcome>,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,
    pub vote_submitted: bool,
    pub generation: u64,
    pub last_message: Option<String>,
}

impl VerificationSession {
    pub(crate) fn new(
        voter_id: VoterId,
        polling_station: PollingStationId,
        required_factors: Vec<FactorKind>,
        generation: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: SessionId::random(),
            voter_id,
            polling_station,
            required_factors,
            factor_results: BTreeMap::new(),
            state: SessionState::Idle,
            created_at: now,
            last_transition_at: now,
            vote_submitted: false,
            generation,
            last_message: None,
        }
    }

    pub fn is_factor_satisfied(&self, factor: FactorKind) -> bool {
        self.factor_results
            .get(&factor)
            .is_some_and(|outcome| outcome.success)
    }

    /// First required factor without a successful outcome.
    pub fn next_pending_factor(&self) -> Option<FactorKind> {
        self.required_factors
            .iter()
            .copied()
            .find(|factor| !self.is_factor_satisfied(*factor))
    }

    pub fn pending_factors(&self) -> Vec<FactorKind> {
        self.required_factors
            .iter()
            .copied()
            .filter(|factor| !self.is_factor_satisfied(*factor))
            .collect()
    }

    pub fn all_factors_satisfied(&self) -> bool {
        self.next_pending_factor().is_none()
    }

    pub fn attempt_count(&self, factor: FactorKind) -> u32 {
        self.factor_results
            .get(&factor)
            .map_or(0, |outcome| outcome.attempt_count)
    }

    /// Evidence references of the satisfied factors, in required order.
    pub fn evidence_refs(&self) -> Vec<String> {
        self.required_factors
            .iter()
            .filter_map(|factor| self.factor_results.get(factor))
            .filter(|outcome| outcome.success)
            .map(|outcome| outcome.evidence_ref.clone())
            .collect()
    }

    pub(crate) fn transition(&mut self, to: SessionState) -> SessionState {
        let from = std::mem::replace(&mut self.state, to);
        self.last_transition_at = Utc::now();
        from
    }

    /// Stores an outcome unless the factor is foreign to the session or the
    /// stored outcome is newer. Returns whether the outcome was kept.
    pub(crate) fn record_outcome(&mut self, outcome: FactorOutcome) -> bool {
        if !self.required_factors.contains(&outcome.factor_kind) {
            return false;
        }
        if let Some(existing) = self.factor_results.get(&outcome.factor_kind) {
            if existing.attempted_at > outcome.attempted_at {
                return false;
            }
        }
        self.factor_results.insert(outcome.factor_kind, outcome);
        true
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn session() -> VerificationSession {
        VerificationSession::new(
            VoterId::new("V-100"),
            PollingStationId::new("PS-1"),
            vec![FactorKind::IdentityLookup, FactorKind::Face],
            1,
        )
    }

    fn outcome(factor: FactorKind, success: bool, at: DateTime<Utc>) -> FactorOutcome {
        FactorOutcome {
            factor_kind: factor,
            success,
            confidence: 0.9,
            method: factor.path_segment().to_string(),
            evidence_ref: format!("{factor}-ref"),
            attempted_at: at,
            attempt_count: 1,
        }
    }

    #[test]
    fn foreign_factor_is_never_recorded() {
        let mut session = session();
        assert!(!session.record_outcome(outcome(FactorKind::Fingerprint, true, Utc::now())));
        assert!(session.factor_results.is_empty());
    }

    #[test]
    fn older_outcome_does_not_overwrite_newer_one() {
        let mut session = session();
        let now = Utc::now();
        assert!(session.record_outcome(outcome(FactorKind::Face, true, now)));
        assert!(!session.record_outcome(outcome(
            FactorKind::Face,
            false,
            now - Duration::seconds(5)
        )));
        assert!(session.is_factor_satisfied(FactorKind::Face));
    }

    #[test]
    fn pending_factors_follow_required_order() {
        let mut session = session();
        assert_eq!(session.next_pending_factor(), Some(FactorKind::IdentityLookup));
        session.record_outcome(outcome(FactorKind::IdentityLookup, true, Utc::now()));
        assert_eq!(session.pending_factors(), vec![FactorKind::Face]);
        session.record_outcome(outcome(FactorKind::Face, true, Utc::now()));
        assert!(session.all_factors_satisfied());
        assert_eq!(
            session.evidence_refs(),
            vec!["identity-ref".to_string(), "face-ref".to_string()]
        );
    }

    #[test]
    fn terminal_states() {
        assert!(SessionState::Cancelled.is_terminal());
        assert!(SessionState::Failed(FactorKind::Face).is_terminal());
        assert!(!SessionState::AllFactorsComplete.is_terminal());
        assert_eq!(
            SessionState::Verifying(FactorKind::Face).factor(),
            Some(FactorKind::Face)
        );
    }
}
