// VALIDATOR REGISTRY
// Single mutable source of truth for validator identity, reputation and
// active-set membership.
//
// SAFETY INVARIANTS:
// 1. Records live in an append-only arena; the id index maps to arena slots
// 2. Every mutation of a record happens under that record's own lock
//    (exclusive access per validator id, never a registry-wide write lock)
// 3. The arena lock is held only to find a slot, never across a record mutation

use crate::consensus::{ConsensusRound, RoundOutcome};
use crate::slashing_engine::{SlashingEngine, SlashingEvent};
use guard_core::{ChainId, Validator, ValidatorId};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("validator {0} is already registered")]
    Duplicate(ValidatorId),
    #[error("unknown validator {0}")]
    Unknown(ValidatorId),
}

#[derive(Default)]
struct Arena {
    records: Vec<Arc<Mutex<Validator>>>,
    index: HashMap<ValidatorId, usize>,
}

#[derive(Default)]
pub struct ValidatorRegistry {
    arena: RwLock<Arena>,
}

impl ValidatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, validator: Validator) -> Result<(), RegistryError> {
        let mut arena = self.arena.write();
        if arena.index.contains_key(&validator.id) {
            return Err(RegistryError::Duplicate(validator.id));
        }
        let slot = arena.records.len();
        info!("[Registry] registered {}", validator);
        arena.index.insert(validator.id.clone(), slot);
        arena.records.push(Arc::new(Mutex::new(validator)));
        Ok(())
    }

    fn slot(&self, id: &ValidatorId) -> Option<Arc<Mutex<Validator>>> {
        let arena = self.arena.read();
        arena.index.get(id).map(|&slot| arena.records[slot].clone())
    }

    fn all_slots(&self) -> Vec<Arc<Mutex<Validator>>> {
        self.arena.read().records.clone()
    }

    pub fn len(&self) -> usize {
        self.arena.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &ValidatorId) -> bool {
        self.arena.read().index.contains_key(id)
    }

    /// Snapshot of one record.
    pub fn get(&self, id: &ValidatorId) -> Option<Validator> {
        self.slot(id).map(|record| record.lock().clone())
    }

    /// Run `f` with exclusive access to one validator record.
    pub fn with_validator<R>(
        &self,
        id: &ValidatorId,
        f: impl FnOnce(&mut Validator) -> R,
    ) -> Result<R, RegistryError> {
        let record = self.slot(id).ok_or_else(|| RegistryError::Unknown(id.clone()))?;
        let mut guard = record.lock();
        Ok(f(&mut guard))
    }

    /// Active validators of `chain`, ordered by id.
    pub fn active_validators(&self, chain: &ChainId) -> Vec<Validator> {
        let mut active: Vec<Validator> = self
            .all_slots()
            .iter()
            .map(|record| record.lock().clone())
            .filter(|v| &v.chain == chain && v.is_active())
            .collect();
        active.sort_by(|a, b| a.id.cmp(&b.id));
        active
    }

    pub fn active_ids(&self, chain: &ChainId) -> Vec<ValidatorId> {
        self.active_validators(chain).into_iter().map(|v| v.id).collect()
    }

    pub fn is_active(&self, id: &ValidatorId) -> bool {
        self.slot(id).map(|record| record.lock().is_active()).unwrap_or(false)
    }

    /// Designated bridge signers, regardless of status.
    pub fn bridge_signers(&self) -> Vec<Validator> {
        let mut signers: Vec<Validator> = self
            .all_slots()
            .iter()
            .map(|record| record.lock().clone())
            .filter(|v| v.bridge_signer)
            .collect();
        signers.sort_by(|a, b| a.id.cmp(&b.id));
        signers
    }

    /// Apply a terminal round to every validator that was eligible in it.
    ///
    /// Valid voters reset their failure streak and, on commit, earn `reward`.
    /// Invalid or missing votes extend the streak and may trigger a slash.
    /// Each record is updated under its own lock.
    pub fn apply_round_result(
        &self,
        round: &ConsensusRound,
        reward: f64,
        slashing: &SlashingEngine,
    ) -> Vec<SlashingEvent> {
        if !round.outcome().is_terminal() {
            warn!("[Registry] refusing to apply non-terminal round {}", round);
            return Vec::new();
        }
        if !round.charges_validators() {
            debug!("[Registry] {} aborted by its ledger, reputations unchanged", round);
            return Vec::new();
        }
        let committed = round.outcome() == RoundOutcome::Committed;
        let mut slashed = Vec::new();

        for id in round.eligible() {
            let voted_valid = round.vote_of(id).map(|v| v.valid).unwrap_or(false);
            let result = self.with_validator(id, |validator| {
                if voted_valid {
                    validator.record_success();
                    if committed {
                        validator.reward(reward);
                    }
                    None
                } else {
                    validator.record_failure();
                    slashing.evaluate(validator, round.round)
                }
            });
            match result {
                Ok(Some(event)) => slashed.push(event),
                Ok(None) => {}
                Err(e) => warn!("[Registry] round {} references {}", round.round, e),
            }
        }
        slashed
    }

    /// Slash a validator outright, removing it from the active set.
    pub fn slash(&self, id: &ValidatorId, penalty: f64) -> Result<(), RegistryError> {
        self.with_validator(id, |validator| {
            validator.slash(penalty);
            warn!("[Registry] {} slashed", validator);
        })
    }

    pub fn snapshot(&self) -> Vec<Validator> {
        self.all_slots().iter().map(|record| record.lock().clone()).collect()
    }

    /// Apply persisted mutable state onto registered validators.
    ///
    /// Identity (key, chain, bridge membership) always comes from
    /// configuration; stored records for unknown ids are skipped.
    pub fn restore(&self, stored: &[Validator]) -> usize {
        let mut restored = 0;
        for record in stored {
            match self.with_validator(&record.id, |v| v.restore_from(record)) {
                Ok(()) => restored += 1,
                Err(_) => warn!(
                    "[Registry] skipping stored record for unconfigured validator {}",
                    record.id
                ),
            }
        }
        restored
    }
}
