//! Aggregator error taxonomy

use crate::types::Hash;
use thiserror::Error;

/// Failure of a structural trie update.
///
/// Fatal to the in-progress commit: the drained transitions are re-queued as
/// the new pending block, never discarded.
#[derive(Error, Debug)]
pub enum TrieUpdateError {
    #[error("key {key} exceeds the {depth}-level trie key space")]
    KeyOutOfRange { key: u64, depth: u8 },

    #[error("storage leaf ({contract_slot_index}, {storage_slot_index}) failed read-back after update")]
    StorageWriteRejected {
        contract_slot_index: u64,
        storage_slot_index: u64,
    },

    #[error("contract leaf {contract_slot_index} failed read-back after update")]
    ContractWriteRejected { contract_slot_index: u64 },

    #[error("cached subtree root for contract slot {contract_slot_index} diverged from the committed leaf")]
    SubtreeMismatch { contract_slot_index: u64 },
}

/// Durable log failures
#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Db(#[from] sled::Error),

    #[error("failed to decode {what}: {reason}")]
    Decode { what: &'static str, reason: String },

    #[error("failed to encode {what}: {reason}")]
    Encode { what: &'static str, reason: String },
}

/// Failures while appending to the pending block
#[derive(Error, Debug)]
pub enum AccumulatorError {
    #[error("transition sequence gap: expected {expected}, got {got}")]
    SequenceGap { expected: u64, got: u64 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures during a commit pass
#[derive(Error, Debug)]
pub enum CommitError {
    #[error(transparent)]
    Trie(#[from] TrieUpdateError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures surfaced by aggregator entry points
#[derive(Error, Debug)]
pub enum AggregatorError {
    #[error(transparent)]
    Accumulator(#[from] AccumulatorError),

    /// The append itself was durably accepted; a synchronously triggered
    /// commit pass failed afterwards and its transitions were re-queued.
    #[error(transparent)]
    Commit(#[from] CommitError),
}

/// Fatal startup failures.
///
/// Recovery never skips records: anything missing or undecodable aborts the
/// process rather than desynchronizing the count from the replayed list.
#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("durable log lists {count} transitions but record {seq} is missing")]
    MissingTransition { seq: u64, count: u64 },

    #[error("transition record {seq} could not be restored: {source}")]
    Transition {
        seq: u64,
        #[source]
        source: StoreError,
    },

    #[error("transition record stored under {seq} carries sequence number {found}")]
    SequenceMismatch { seq: u64, found: u64 },

    #[error("rebuilt state root {computed} does not match persisted root {persisted}")]
    RootMismatch { computed: Hash, persisted: Hash },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Trie(#[from] TrieUpdateError),
}
