//! Durable log for the pending block and committed state
//!
//! Uses a sled embedded database. Everything the aggregator needs to survive
//! a crash lives here: the transition records of the pending block, the
//! transition count, the pending block number, the committed state leaves and
//! their tree root. Writes become durable on `flush`.

use crate::error::StoreError;
use crate::types::{Hash, StorageWrite, TransitionRecord};
use serde::{Deserialize, Serialize};
use sled::Db;
use std::path::Path;

const TRANSACTION_COUNT_KEY: &[u8] = b"transaction_count";
const PENDING_BLOCK_NUMBER_KEY: &[u8] = b"pending_block_number";
const TREE_ROOT_KEY: &[u8] = b"tree_root";
const LAST_SUBMISSION_KEY: &[u8] = b"last_submission";

/// Metadata about the most recent block submission
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SubmissionMetadata {
    /// Number of the submitted block
    pub block_number: u64,
    /// State root the block was sealed with
    pub state_root: [u8; 32],
    /// Transitions the block carried
    pub transition_count: u64,
    /// Submission timestamp, unix seconds
    pub submitted_ts: i64,
}

/// Durable key-value log backing the aggregator
pub struct TransitionLog {
    db: Db,
    /// Counters, tree root and submission metadata
    meta: sled::Tree,
    /// Pending transition records keyed by sequence number
    transitions: sled::Tree,
    /// Committed state leaves keyed by (contract slot, storage slot)
    state_leaves: sled::Tree,
}

impl TransitionLog {
    /// Open or create the log at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(&path)?;
        let meta = db.open_tree("meta")?;
        let transitions = db.open_tree("transitions")?;
        let state_leaves = db.open_tree("state_leaves")?;

        tracing::info!("Opened transition log at {:?}", path.as_ref());

        Ok(Self {
            db,
            meta,
            transitions,
            state_leaves,
        })
    }

    /// Number of transitions in the pending block
    pub fn transaction_count(&self) -> Result<Option<u64>, StoreError> {
        self.get_u64(TRANSACTION_COUNT_KEY)
    }

    pub fn put_transaction_count(&self, count: u64) -> Result<(), StoreError> {
        self.meta
            .insert(TRANSACTION_COUNT_KEY, &count.to_le_bytes()[..])?;
        Ok(())
    }

    /// Block number of the pending block
    pub fn pending_block_number(&self) -> Result<Option<u64>, StoreError> {
        self.get_u64(PENDING_BLOCK_NUMBER_KEY)
    }

    pub fn put_pending_block_number(&self, block_number: u64) -> Result<(), StoreError> {
        self.meta
            .insert(PENDING_BLOCK_NUMBER_KEY, &block_number.to_le_bytes()[..])?;
        Ok(())
    }

    /// Root of the committed state trie
    pub fn tree_root(&self) -> Result<Option<Hash>, StoreError> {
        match self.meta.get(TREE_ROOT_KEY)? {
            Some(bytes) => {
                let hash = Hash::from_slice(&bytes).ok_or_else(|| StoreError::Decode {
                    what: "tree root",
                    reason: format!("expected 32 bytes, got {}", bytes.len()),
                })?;
                Ok(Some(hash))
            }
            None => Ok(None),
        }
    }

    pub fn put_tree_root(&self, root: &Hash) -> Result<(), StoreError> {
        self.meta.insert(TREE_ROOT_KEY, root.as_bytes().as_slice())?;
        Ok(())
    }

    /// Transition record by sequence number
    pub fn transition(&self, sequence_number: u64) -> Result<Option<TransitionRecord>, StoreError> {
        match self.transitions.get(sequence_number.to_be_bytes())? {
            Some(bytes) => {
                let record =
                    borsh::from_slice(&bytes).map_err(|e| StoreError::Decode {
                        what: "transition record",
                        reason: e.to_string(),
                    })?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    pub fn put_transition(&self, record: &TransitionRecord) -> Result<(), StoreError> {
        let bytes = borsh::to_vec(record).map_err(|e| StoreError::Encode {
            what: "transition record",
            reason: e.to_string(),
        })?;
        self.transitions
            .insert(record.sequence_number.to_be_bytes(), bytes)?;
        Ok(())
    }

    /// Persist a committed state leaf
    pub fn put_state_leaf(&self, write: &StorageWrite) -> Result<(), StoreError> {
        let mut key = [0u8; 16];
        key[..8].copy_from_slice(&write.contract_slot_index.to_be_bytes());
        key[8..].copy_from_slice(&write.storage_slot_index.to_be_bytes());
        self.state_leaves.insert(key, write.new_value.as_slice())?;
        Ok(())
    }

    /// All committed state leaves as `(contract, slot, value)` in key order
    pub fn state_leaves(&self) -> Result<Vec<(u64, u64, Vec<u8>)>, StoreError> {
        let mut leaves = Vec::new();
        for item in self.state_leaves.iter() {
            let (key, value) = item?;
            if key.len() != 16 {
                return Err(StoreError::Decode {
                    what: "state leaf key",
                    reason: format!("expected 16 bytes, got {}", key.len()),
                });
            }
            let mut contract = [0u8; 8];
            let mut slot = [0u8; 8];
            contract.copy_from_slice(&key[..8]);
            slot.copy_from_slice(&key[8..]);
            leaves.push((
                u64::from_be_bytes(contract),
                u64::from_be_bytes(slot),
                value.to_vec(),
            ));
        }
        Ok(leaves)
    }

    /// Metadata of the last block submission
    pub fn last_submission(&self) -> Result<Option<SubmissionMetadata>, StoreError> {
        match self.meta.get(LAST_SUBMISSION_KEY)? {
            Some(bytes) => {
                let metadata = bincode::deserialize(&bytes).map_err(|e| StoreError::Decode {
                    what: "submission metadata",
                    reason: e.to_string(),
                })?;
                Ok(Some(metadata))
            }
            None => Ok(None),
        }
    }

    pub fn put_last_submission(&self, metadata: &SubmissionMetadata) -> Result<(), StoreError> {
        let bytes = bincode::serialize(metadata).map_err(|e| StoreError::Encode {
            what: "submission metadata",
            reason: e.to_string(),
        })?;
        self.meta.insert(LAST_SUBMISSION_KEY, bytes)?;
        Ok(())
    }

    /// Store raw bytes under a sequence number, bypassing encoding
    #[cfg(test)]
    pub(crate) fn put_raw_transition(
        &self,
        sequence_number: u64,
        bytes: &[u8],
    ) -> Result<(), StoreError> {
        self.transitions
            .insert(sequence_number.to_be_bytes(), bytes)?;
        Ok(())
    }

    /// Flush all pending writes to disk; the durability barrier
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    /// Clear all data (for testing)
    pub fn clear(&self) -> Result<(), StoreError> {
        self.meta.clear()?;
        self.transitions.clear()?;
        self.state_leaves.clear()?;
        Ok(())
    }

    fn get_u64(&self, key: &[u8]) -> Result<Option<u64>, StoreError> {
        match self.meta.get(key)? {
            Some(bytes) => {
                let arr: [u8; 8] = bytes.as_ref().try_into().map_err(|_| StoreError::Decode {
                    what: "u64 counter",
                    reason: format!("expected 8 bytes, got {}", bytes.len()),
                })?;
                Ok(Some(u64::from_le_bytes(arr)))
            }
            None => Ok(None),
        }
    }
}
