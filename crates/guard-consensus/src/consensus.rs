// CONSENSUS ROUND
// One quorum vote over a proposal for a single chain.
//
// SAFETY INVARIANTS:
// 1. Outcome moves only Open → Tallying → {Committed | Failed}
// 2. A round is immutable once Committed or Failed
// 3. Only validators eligible at open may vote, at most once each
// 4. Eligible validators that never voted count as negative votes
// 5. Commit iff positive / total ≥ threshold (inclusive); total == 0 fails
// 6. An aborted round is Failed(LedgerUnavailable) whatever its votes

use crate::attestation::Proposal;
use crate::engine::ConsensusError;
use chrono::{DateTime, Utc};
use guard_core::{ChainId, RoundFailureReason, ValidatorId, VotePayload};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub valid: bool,
    pub signature_ref: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundOutcome {
    Open,
    Tallying,
    Committed,
    Failed(RoundFailureReason),
}

impl RoundOutcome {
    pub fn is_terminal(self) -> bool {
        matches!(self, RoundOutcome::Committed | RoundOutcome::Failed(_))
    }
}

impl fmt::Display for RoundOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoundOutcome::Open => write!(f, "OPEN"),
            RoundOutcome::Tallying => write!(f, "TALLYING"),
            RoundOutcome::Committed => write!(f, "COMMITTED"),
            RoundOutcome::Failed(RoundFailureReason::QuorumNotReached) => {
                write!(f, "FAILED(QUORUM_NOT_REACHED)")
            }
            RoundOutcome::Failed(RoundFailureReason::NoQuorumPossible) => {
                write!(f, "FAILED(NO_QUORUM_POSSIBLE)")
            }
            RoundOutcome::Failed(RoundFailureReason::LedgerUnavailable) => {
                write!(f, "FAILED(LEDGER_UNAVAILABLE)")
            }
        }
    }
}

/// Quorum rule. Pure so the boundary can be checked in isolation.
pub fn tally(positive: usize, total: usize, threshold: f64) -> Result<(), RoundFailureReason> {
    if total == 0 {
        return Err(RoundFailureReason::NoQuorumPossible);
    }
    if positive as f64 / total as f64 >= threshold {
        Ok(())
    } else {
        Err(RoundFailureReason::QuorumNotReached)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusRound {
    pub chain: ChainId,
    pub round: u64,
    pub height: u64,
    pub digest: String,
    pub transactions: usize,
    eligible: Vec<ValidatorId>,
    votes: BTreeMap<ValidatorId, Vote>,
    outcome: RoundOutcome,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl ConsensusRound {
    /// Open a round. `eligible` is the active set snapshot at open time.
    pub fn open(proposal: &Proposal, eligible: Vec<ValidatorId>) -> Self {
        ConsensusRound {
            chain: proposal.chain.clone(),
            round: proposal.round,
            height: proposal.height,
            digest: proposal.digest.clone(),
            transactions: proposal.transactions.len(),
            eligible,
            votes: BTreeMap::new(),
            outcome: RoundOutcome::Open,
            opened_at: Utc::now(),
            closed_at: None,
        }
    }

    pub fn outcome(&self) -> RoundOutcome {
        self.outcome
    }

    pub fn eligible(&self) -> &[ValidatorId] {
        &self.eligible
    }

    pub fn votes(&self) -> &BTreeMap<ValidatorId, Vote> {
        &self.votes
    }

    pub fn vote_of(&self, validator: &ValidatorId) -> Option<&Vote> {
        self.votes.get(validator)
    }

    pub fn cast(&mut self, validator: ValidatorId, vote: Vote) -> Result<(), ConsensusError> {
        if self.outcome != RoundOutcome::Open {
            return Err(ConsensusError::RoundClosed {
                chain: self.chain.clone(),
                round: self.round,
            });
        }
        if !self.eligible.contains(&validator) {
            return Err(ConsensusError::NotEligible { validator, round: self.round });
        }
        if self.votes.contains_key(&validator) {
            return Err(ConsensusError::DuplicateVote { validator, round: self.round });
        }
        self.votes.insert(validator, vote);
        Ok(())
    }

    pub fn positive_votes(&self) -> usize {
        self.votes.values().filter(|v| v.valid).count()
    }

    pub fn total_votes(&self) -> usize {
        self.eligible.len()
    }

    /// Validators that voted valid, in id order.
    pub fn positive_voters(&self) -> Vec<ValidatorId> {
        self.votes.iter().filter(|(_, v)| v.valid).map(|(id, _)| id.clone()).collect()
    }

    /// Stop accepting votes.
    pub fn begin_tally(&mut self) -> Result<(), ConsensusError> {
        match self.outcome {
            RoundOutcome::Open => {
                self.outcome = RoundOutcome::Tallying;
                Ok(())
            }
            RoundOutcome::Tallying => Ok(()),
            _ => Err(ConsensusError::RoundClosed { chain: self.chain.clone(), round: self.round }),
        }
    }

    /// Decide the round. Idempotent once terminal.
    pub fn close(&mut self, threshold: f64) -> RoundOutcome {
        if self.outcome.is_terminal() {
            return self.outcome;
        }
        self.outcome = match tally(self.positive_votes(), self.total_votes(), threshold) {
            Ok(()) => RoundOutcome::Committed,
            Err(reason) => RoundOutcome::Failed(reason),
        };
        self.closed_at = Some(Utc::now());
        self.outcome
    }

    /// End the round without a tally because its ledger failed underneath it.
    pub fn abort(&mut self) -> RoundOutcome {
        if self.outcome.is_terminal() {
            return self.outcome;
        }
        self.outcome = RoundOutcome::Failed(RoundFailureReason::LedgerUnavailable);
        self.closed_at = Some(Utc::now());
        self.outcome
    }

    /// Aborted rounds say nothing about the validators that sat in them.
    pub fn charges_validators(&self) -> bool {
        self.outcome != RoundOutcome::Failed(RoundFailureReason::LedgerUnavailable)
    }

    pub fn to_payload(&self) -> VotePayload {
        VotePayload {
            chain: self.chain.clone(),
            round: self.round,
            height: self.height,
            digest: self.digest.clone(),
            committed: self.outcome == RoundOutcome::Committed,
            positive_votes: self.positive_votes(),
            total_votes: self.total_votes(),
            signatures: self
                .votes
                .values()
                .filter(|v| v.valid)
                .filter_map(|v| v.signature_ref.clone())
                .collect(),
        }
    }
}

impl fmt::Display for ConsensusRound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Round {}#{} at height {} [{}] {}/{}",
            self.chain,
            self.round,
            self.height,
            self.outcome,
            self.positive_votes(),
            self.total_votes()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_with(ids: &[&str]) -> ConsensusRound {
        let proposal = Proposal::new(ChainId::new("alpha"), 1, 10, vec![]);
        ConsensusRound::open(&proposal, ids.iter().map(|id| ValidatorId::new(*id)).collect())
    }

    fn yes() -> Vote {
        Vote { valid: true, signature_ref: Some("sig".into()) }
    }

    #[test]
    fn test_tally_boundaries() {
        assert_eq!(tally(4, 5, 0.67), Ok(()));
        assert_eq!(tally(3, 5, 0.67), Err(RoundFailureReason::QuorumNotReached));
        assert_eq!(tally(3, 5, 0.6), Ok(()));
        assert_eq!(tally(0, 0, 0.5), Err(RoundFailureReason::NoQuorumPossible));
        assert_eq!(tally(1, 1, 1.0), Ok(()));
    }

    #[test]
    fn test_missing_votes_count_against_commit() {
        let mut round = round_with(&["v1", "v2", "v3"]);
        round.cast(ValidatorId::new("v1"), yes()).unwrap();
        round.cast(ValidatorId::new("v2"), yes()).unwrap();
        round.begin_tally().unwrap();
        assert_eq!(round.close(0.67), RoundOutcome::Failed(RoundFailureReason::QuorumNotReached));
    }

    #[test]
    fn test_empty_round_has_no_quorum() {
        let mut round = round_with(&[]);
        assert_eq!(round.close(0.5), RoundOutcome::Failed(RoundFailureReason::NoQuorumPossible));
    }

    #[test]
    fn test_vote_rules() {
        let mut round = round_with(&["v1"]);
        assert!(matches!(
            round.cast(ValidatorId::new("v9"), yes()),
            Err(ConsensusError::NotEligible { .. })
        ));
        round.cast(ValidatorId::new("v1"), yes()).unwrap();
        assert!(matches!(
            round.cast(ValidatorId::new("v1"), yes()),
            Err(ConsensusError::DuplicateVote { .. })
        ));
    }

    #[test]
    fn test_abort_ignores_votes() {
        let mut round = round_with(&["v1", "v2"]);
        round.cast(ValidatorId::new("v1"), yes()).unwrap();
        round.cast(ValidatorId::new("v2"), yes()).unwrap();
        round.begin_tally().unwrap();
        assert_eq!(round.abort(), RoundOutcome::Failed(RoundFailureReason::LedgerUnavailable));
        assert!(!round.charges_validators());
        assert!(!round.to_payload().committed);
        assert_eq!(round.close(0.5), RoundOutcome::Failed(RoundFailureReason::LedgerUnavailable));
    }

    #[test]
    fn test_terminal_round_is_immutable() {
        let mut round = round_with(&["v1", "v2"]);
        round.cast(ValidatorId::new("v1"), yes()).unwrap();
        round.cast(ValidatorId::new("v2"), yes()).unwrap();
        assert_eq!(round.close(0.5), RoundOutcome::Committed);

        assert!(matches!(round.begin_tally(), Err(ConsensusError::RoundClosed { .. })));
        assert_eq!(round.close(1.0), RoundOutcome::Committed);

        let payload = round.to_payload();
        assert!(payload.committed);
        assert_eq!(payload.signatures.len(), 2);
    }
}
