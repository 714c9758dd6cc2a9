use crate::transfer::TransferStatus;
use thiserror::Error;

/// Startup configuration errors. These are the only fatal errors in the cluster.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("at least one supported chain is required")]
    NoChains,
    #[error("chain {chain} has no endpoints")]
    EmptyEndpoints { chain: String },
    #[error("chain {chain} is configured more than once")]
    DuplicateChain { chain: String },
    #[error("consensus threshold {0} must be in (0, 1]")]
    InvalidThreshold(f64),
    #[error("shard count must be > 0")]
    InvalidShardCount,
    #[error("bridge signature threshold {threshold} must be within 1..={available} bridge signers")]
    InvalidBridgeThreshold { threshold: usize, available: usize },
    #[error("max transfer amount must be > 0")]
    InvalidTransferCap,
    #[error("validator {validator} is bound to unknown chain {chain}")]
    UnknownValidatorChain { validator: String, chain: String },
    #[error("validator {validator} is configured more than once")]
    DuplicateValidator { validator: String },
    #[error("validator {validator} has an invalid public key: {reason}")]
    InvalidPublicKey { validator: String, reason: String },
    #[error("invalid reputation settings: {0}")]
    InvalidReputation(&'static str),
    #[error("invalid timing settings: {0}")]
    InvalidTiming(&'static str),
    #[error("invalid autoscaler settings: {0}")]
    InvalidAutoscaler(&'static str),
}

/// A bridge transfer was asked to move against its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid transfer transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: TransferStatus,
    pub to: TransferStatus,
}
