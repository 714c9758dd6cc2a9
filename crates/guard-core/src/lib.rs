//! GUARD core: the records shared by every cluster component.
//!
//! Chain nodes, validators and bridge transfers live here together with the
//! cluster configuration surface, the typed event bus and the ledger
//! collaborator traits. Orchestration logic lives in the sibling crates.

pub mod chain;
pub mod config;
pub mod error;
pub mod events;
pub mod ledger;
pub mod transfer;
pub mod types;
pub mod validator;

pub use chain::{ChainNode, EndpointAdvance, SyncStatus};
pub use config::{
    AutoscalerConfig, ChainConfig, ClusterConfig, ReputationConfig, ShardingConfig, StorageConfig,
    TimingConfig, ValidatorConfig, MAX_CALL_RETRIES, MAX_TRANSFER_DEADLINE_SECS,
};
pub use error::{ConfigurationError, TransitionError};
pub use events::{
    ClusterEvent, EventBus, EventSink, RoundFailureReason, ScaleDirection, TransferFailure,
};
pub use ledger::{LedgerClient, LedgerConnector, LedgerError, VotePayload};
pub use transfer::{BridgeTransfer, TransferStatus};
pub use types::{ChainId, ShardId, TransferId, ValidatorId};
pub use validator::{Validator, ValidatorStatus, MAX_REPUTATION, MIN_REPUTATION};
