pub mod attestation;
pub mod consensus;
pub mod engine;
pub mod slashing_engine;
pub mod validator_registry;

pub use attestation::{Attestation, AttestationError, Attestor, Proposal};
pub use consensus::{tally, ConsensusRound, RoundOutcome, Vote};
pub use engine::{ConsensusEngine, ConsensusError, EngineConfig, RoundResult};
pub use slashing_engine::{SlashingEngine, SlashingEvent};
pub use validator_registry::{RegistryError, ValidatorRegistry};
