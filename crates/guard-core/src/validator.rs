// VALIDATOR RECORD
//
// SAFETY INVARIANTS:
// 1. Reputation is always within [MIN_REPUTATION, MAX_REPUTATION]
// 2. A Slashed validator never returns to Active without external reinstatement
// 3. The registered public key is immutable after registration

use crate::types::{ChainId, ValidatorId};
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const MIN_REPUTATION: f64 = 0.0;
pub const MAX_REPUTATION: f64 = 100.0;

/// Clamp a raw score into the reputation bounds. NaN maps to the minimum.
pub fn clamp_reputation(score: f64) -> f64 {
    if score.is_nan() {
        return MIN_REPUTATION;
    }
    score.clamp(MIN_REPUTATION, MAX_REPUTATION)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValidatorStatus {
    /// Participating in consensus for its chain
    Active,
    /// Removed from the active set; needs external reinstatement
    Slashed,
    /// Temporarily not participating
    Offline,
}

impl fmt::Display for ValidatorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidatorStatus::Active => write!(f, "ACTIVE"),
            ValidatorStatus::Slashed => write!(f, "SLASHED"),
            ValidatorStatus::Offline => write!(f, "OFFLINE"),
        }
    }
}

/// Authoritative validator record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Validator {
    pub id: ValidatorId,
    /// Chain whose consensus rounds this validator votes in
    pub chain: ChainId,
    reputation: f64,
    pub status: ValidatorStatus,
    pub consecutive_failures: u32,
    /// Registered ed25519 public key
    pub public_key: [u8; 32],
    /// Member of the designated bridge-signer subset
    pub bridge_signer: bool,
    pub rounds_voted: u64,
    pub positive_votes: u64,
}

impl Validator {
    pub fn new(
        id: ValidatorId,
        chain: ChainId,
        public_key: [u8; 32],
        initial_reputation: f64,
        bridge_signer: bool,
    ) -> Self {
        Validator {
            id,
            chain,
            reputation: clamp_reputation(initial_reputation),
            status: ValidatorStatus::Active,
            consecutive_failures: 0,
            public_key,
            bridge_signer,
            rounds_voted: 0,
            positive_votes: 0,
        }
    }

    pub fn reputation(&self) -> f64 {
        self.reputation
    }

    pub fn is_active(&self) -> bool {
        self.status == ValidatorStatus::Active
    }

    pub fn is_slashed(&self) -> bool {
        self.status == ValidatorStatus::Slashed
    }

    /// Increase reputation, capped at MAX_REPUTATION.
    pub fn reward(&mut self, amount: f64) {
        self.reputation = clamp_reputation(self.reputation + amount.max(0.0));
    }

    /// Decrease reputation, floored at MIN_REPUTATION.
    pub fn penalize(&mut self, amount: f64) {
        self.reputation = clamp_reputation(self.reputation - amount.max(0.0));
    }

    /// Record a valid vote. Resets the consecutive failure counter.
    pub fn record_success(&mut self) {
        self.rounds_voted += 1;
        self.positive_votes += 1;
        self.consecutive_failures = 0;
    }

    /// Record an invalid or missing vote. Returns the new consecutive count.
    pub fn record_failure(&mut self) -> u32 {
        self.rounds_voted += 1;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_failures
    }

    pub fn slash(&mut self, penalty: f64) {
        self.status = ValidatorStatus::Slashed;
        self.penalize(penalty);
    }

    /// Restore persisted mutable state onto a freshly configured record.
    pub fn restore_from(&mut self, stored: &Validator) {
        self.reputation = clamp_reputation(stored.reputation);
        self.status = stored.status;
        self.consecutive_failures = stored.consecutive_failures;
        self.rounds_voted = stored.rounds_voted;
        self.positive_votes = stored.positive_votes;
    }

    pub fn verifying_key(&self) -> Result<VerifyingKey, ed25519_dalek::SignatureError> {
        VerifyingKey::from_bytes(&self.public_key)
    }
}

impl fmt::Display for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Validator {} on {} (status={}, reputation={:.1}, failures={})",
            self.id, self.chain, self.status, self.reputation, self.consecutive_failures
        )
    }
}
