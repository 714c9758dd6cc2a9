// AUTOMATIC SLASHING ENGINE
// Deterministic downtime slashing driven by consecutive failed rounds.
//
// SAFETY INVARIANTS:
// 1. Slashing is automatic (no manual override possible)
// 2. Same failure streak → same decision
// 3. A validator is slashed at most once per streak; slashed validators are
//    out of the active set and stop accumulating failures
// 4. Every slash is recorded in the audit history

use chrono::{DateTime, Utc};
use guard_core::{ChainId, ReputationConfig, Validator, ValidatorId};
use log::warn;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlashingEvent {
    pub validator: ValidatorId,
    pub chain: ChainId,
    /// Round that completed the failure window
    pub round: u64,
    pub consecutive_failures: u32,
    pub penalty: f64,
    pub reputation_after: f64,
    pub timestamp: DateTime<Utc>,
}

pub struct SlashingEngine {
    failure_window: u32,
    penalty: f64,
    history: Mutex<Vec<SlashingEvent>>,
}

impl SlashingEngine {
    pub fn new(failure_window: u32, penalty: f64) -> Self {
        SlashingEngine {
            failure_window: failure_window.max(1),
            penalty: penalty.max(0.0),
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn from_config(config: &ReputationConfig) -> Self {
        Self::new(config.failure_window, config.slash_penalty)
    }

    pub fn failure_window(&self) -> u32 {
        self.failure_window
    }

    /// Slash `validator` if its failure streak has reached the window.
    ///
    /// Call with the validator's record lock held, right after the failure
    /// was recorded.
    pub fn evaluate(&self, validator: &mut Validator, round: u64) -> Option<SlashingEvent> {
        if !validator.is_active() || validator.consecutive_failures < self.failure_window {
            return None;
        }

        validator.slash(self.penalty);
        let event = SlashingEvent {
            validator: validator.id.clone(),
            chain: validator.chain.clone(),
            round,
            consecutive_failures: validator.consecutive_failures,
            penalty: self.penalty,
            reputation_after: validator.reputation(),
            timestamp: Utc::now(),
        };
        warn!(
            "[Slashing] {} slashed after {} consecutive failures (round {}, reputation now {:.1})",
            event.validator, event.consecutive_failures, round, event.reputation_after
        );
        self.history.lock().push(event.clone());
        Some(event)
    }

    pub fn history(&self) -> Vec<SlashingEvent> {
        self.history.lock().clone()
    }
}
