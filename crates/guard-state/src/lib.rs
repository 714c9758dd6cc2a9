pub mod sharding;
pub mod state_storage;

pub use sharding::{partition, Batch, Shard, ShardError, ShardRoundState, ShardingLayer};
pub use state_storage::{MemoryStore, SledStore, StateStore, StorageError};
