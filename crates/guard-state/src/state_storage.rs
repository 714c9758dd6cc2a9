// DURABLE RECORD STORAGE
// Chain nodes, validators and bridge transfers survive restarts.
//
// INVARIANTS:
// 1. Records are bincode-encoded and keyed by their stable id
// 2. A save replaces the record stored under the same key
// 3. Loading never panics on a corrupt record; it reports StorageError

use guard_core::{BridgeTransfer, ChainNode, Validator};
use log::debug;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use thiserror::Error;

const CHAINS: &str = "chains";
const VALIDATORS: &str = "validators";
const TRANSFERS: &str = "transfers";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(#[from] sled::Error),
    #[error("record encoding error: {0}")]
    Codec(#[from] bincode::Error),
}

pub trait StateStore: Send + Sync {
    fn save_chains(&self, chains: &[ChainNode]) -> Result<(), StorageError>;
    fn load_chains(&self) -> Result<Vec<ChainNode>, StorageError>;

    fn save_validators(&self, validators: &[Validator]) -> Result<(), StorageError>;
    fn load_validators(&self) -> Result<Vec<Validator>, StorageError>;

    fn save_transfers(&self, transfers: &[BridgeTransfer]) -> Result<(), StorageError>;
    fn load_transfers(&self) -> Result<Vec<BridgeTransfer>, StorageError>;

    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

fn chain_key(node: &ChainNode) -> Vec<u8> {
    node.chain_id.as_str().as_bytes().to_vec()
}

fn validator_key(validator: &Validator) -> Vec<u8> {
    validator.id.as_str().as_bytes().to_vec()
}

fn transfer_key(transfer: &BridgeTransfer) -> Vec<u8> {
    transfer.id.as_bytes().to_vec()
}

type Encoded = Vec<(Vec<u8>, Vec<u8>)>;

fn encode_all<T: Serialize>(
    records: &[T],
    key: impl Fn(&T) -> Vec<u8>,
) -> Result<Encoded, StorageError> {
    records
        .iter()
        .map(|record| -> Result<(Vec<u8>, Vec<u8>), StorageError> {
            Ok((key(record), bincode::serialize(record)?))
        })
        .collect()
}

/// sled-backed store with one tree per record kind.
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Ok(SledStore { db })
    }

    /// Store that is deleted when dropped.
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(SledStore { db })
    }

    fn save<T: Serialize>(
        &self,
        tree: &str,
        records: &[T],
        key: impl Fn(&T) -> Vec<u8>,
    ) -> Result<(), StorageError> {
        let tree = self.db.open_tree(tree)?;
        let mut batch = sled::Batch::default();
        for (k, v) in encode_all(records, key)? {
            batch.insert(k, v);
        }
        tree.apply_batch(batch)?;
        debug!("[Storage] saved {} records", records.len());
        Ok(())
    }

    fn load<T: DeserializeOwned>(&self, tree: &str) -> Result<Vec<T>, StorageError> {
        let tree = self.db.open_tree(tree)?;
        let mut records = Vec::new();
        for entry in tree.iter() {
            let (_, value) = entry?;
            records.push(bincode::deserialize(&value)?);
        }
        Ok(records)
    }
}

impl StateStore for SledStore {
    fn save_chains(&self, chains: &[ChainNode]) -> Result<(), StorageError> {
        self.save(CHAINS, chains, chain_key)
    }

    fn load_chains(&self) -> Result<Vec<ChainNode>, StorageError> {
        self.load(CHAINS)
    }

    fn save_validators(&self, validators: &[Validator]) -> Result<(), StorageError> {
        self.save(VALIDATORS, validators, validator_key)
    }

    fn load_validators(&self) -> Result<Vec<Validator>, StorageError> {
        self.load(VALIDATORS)
    }

    fn save_transfers(&self, transfers: &[BridgeTransfer]) -> Result<(), StorageError> {
        self.save(TRANSFERS, transfers, transfer_key)
    }

    fn load_transfers(&self) -> Result<Vec<BridgeTransfer>, StorageError> {
        self.load(TRANSFERS)
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

/// In-process store with the same encoding as [`SledStore`].
#[derive(Default)]
pub struct MemoryStore {
    trees: Mutex<HashMap<&'static str, BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn save<T: Serialize>(
        &self,
        tree: &'static str,
        records: &[T],
        key: impl Fn(&T) -> Vec<u8>,
    ) -> Result<(), StorageError> {
        let encoded = encode_all(records, key)?;
        self.trees.lock().entry(tree).or_default().extend(encoded);
        Ok(())
    }

    fn load<T: DeserializeOwned>(&self, tree: &'static str) -> Result<Vec<T>, StorageError> {
        let trees = self.trees.lock();
        let Some(records) = trees.get(tree) else {
            return Ok(Vec::new());
        };
        records
            .values()
            .map(|value| bincode::deserialize(value).map_err(StorageError::from))
            .collect()
    }
}

impl StateStore for MemoryStore {
    fn save_chains(&self, chains: &[ChainNode]) -> Result<(), StorageError> {
        self.save(CHAINS, chains, chain_key)
    }

    fn load_chains(&self) -> Result<Vec<ChainNode>, StorageError> {
        self.load(CHAINS)
    }

    fn save_validators(&self, validators: &[Validator]) -> Result<(), StorageError> {
        self.save(VALIDATORS, validators, validator_key)
    }

    fn load_validators(&self) -> Result<Vec<Validator>, StorageError> {
        self.load(VALIDATORS)
    }

    fn save_transfers(&self, transfers: &[BridgeTransfer]) -> Result<(), StorageError> {
        self.save(TRANSFERS, transfers, transfer_key)
    }

    fn load_transfers(&self) -> Result<Vec<BridgeTransfer>, StorageError> {
        self.load(TRANSFERS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use guard_core::{ChainId, TransferFailure, TransferStatus, ValidatorId};

    fn records() -> (ChainNode, Validator, BridgeTransfer) {
        let mut chain =
            ChainNode::new("alpha", vec!["a1".into(), "a2".into()], Some("fb".into())).unwrap();
        chain.observe_height(42);
        let mut validator =
            Validator::new(ValidatorId::new("v1"), ChainId::new("alpha"), [5u8; 32], 50.0, true);
        validator.record_failure();
        let now = Utc::now();
        let (alpha, beta) = (ChainId::new("alpha"), ChainId::new("beta"));
        let deadline = now + Duration::seconds(60);
        let mut transfer = BridgeTransfer::new(alpha, beta, "GUARD", 100, 3, now, deadline);
        transfer.fail(TransferFailure::Expired).unwrap();
        (chain, validator, transfer)
    }

    fn exercise(store: &dyn StateStore) {
        let (chain, validator, transfer) = records();
        store.save_chains(&[chain.clone()]).unwrap();
        store.save_validators(&[validator.clone()]).unwrap();
        store.save_transfers(&[transfer.clone()]).unwrap();
        store.flush().unwrap();

        assert_eq!(store.load_chains().unwrap(), vec![chain]);
        assert_eq!(store.load_validators().unwrap(), vec![validator.clone()]);
        let loaded = store.load_transfers().unwrap();
        assert_eq!(loaded, vec![transfer]);
        assert_eq!(loaded[0].status(), TransferStatus::Failed);

        let mut updated = validator;
        updated.reward(10.0);
        store.save_validators(&[updated.clone()]).unwrap();
        assert_eq!(store.load_validators().unwrap(), vec![updated]);
    }

    #[test]
    fn test_sled_store_persists_records() {
        exercise(&SledStore::temporary().unwrap());
    }

    #[test]
    fn test_memory_store_persists_records() {
        exercise(&MemoryStore::new());
    }

    #[test]
    fn test_empty_store_loads_nothing() {
        let store = MemoryStore::new();
        assert!(store.load_chains().unwrap().is_empty());
        assert!(SledStore::temporary().unwrap().load_transfers().unwrap().is_empty());
    }
}
