//! Core data types shared across the aggregator
//!
//! Operations arrive signed and already verified; transitions are the
//! durable, ordered record of their effects inside the pending block.

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 32-byte hash, rendered base58 in logs
#[derive(
    Clone, Copy, Default, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize, Serialize,
    Deserialize,
)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub const ZERO: Hash = Hash([0u8; 32]);

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse a hash from a 32-byte slice
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Hash(arr))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", bs58::encode(&self.0).into_string())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self)
    }
}

/// 20-byte account address
#[derive(
    Clone, Copy, Default, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize, Serialize,
    Deserialize, Debug,
)]
pub struct Address(pub [u8; 20]);

impl Address {
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

/// Detached signature over an operation; verification happens upstream
#[derive(
    Clone, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize, Debug,
)]
pub struct Signature(pub Vec<u8>);

/// The state-mutating content of an operation
#[derive(Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize, Debug)]
pub enum OperationPayload {
    /// Value transfer between two accounts
    Transfer {
        recipient: Address,
        token_type: u32,
        amount: u64,
    },
    /// Generic call with an opaque body
    Call { body: Vec<u8> },
}

/// A signed, externally-originated request to mutate state.
///
/// Immutable once admitted; the signature has already been verified by the
/// operation source before it reaches the aggregator.
#[derive(Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize, Debug)]
pub struct Operation {
    pub sender: Address,
    pub payload: OperationPayload,
    pub signature: Signature,
}

/// A single storage mutation produced by executing an operation
#[derive(Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize, Debug)]
pub struct StorageWrite {
    pub contract_slot_index: u64,
    pub storage_slot_index: u64,
    pub new_value: Vec<u8>,
}

/// The durable, ordered unit of work inside a pending block.
///
/// Sequence numbers are scoped to the current pending block: they start at 1
/// and are strictly increasing and gapless. A record is never mutated after
/// being persisted, only appended.
#[derive(Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize, Debug)]
pub struct TransitionRecord {
    pub sequence_number: u64,
    pub operation: Operation,
    pub writes: Vec<StorageWrite>,
}

impl TransitionRecord {
    /// Whether another record carries byte-identical content.
    ///
    /// Content excludes the sequence number, so a duplicate submission is
    /// recognized even though it would have been assigned the next number.
    pub fn same_content(&self, other: &TransitionRecord) -> bool {
        self.operation == other.operation && self.writes == other.writes
    }

    /// Content hash of the record, for log lines
    pub fn content_hash(&self) -> Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.operation.sender.as_bytes());
        match &self.operation.payload {
            OperationPayload::Transfer {
                recipient,
                token_type,
                amount,
            } => {
                hasher.update(&[0u8]);
                hasher.update(recipient.as_bytes());
                hasher.update(&token_type.to_le_bytes());
                hasher.update(&amount.to_le_bytes());
            }
            OperationPayload::Call { body } => {
                hasher.update(&[1u8]);
                hasher.update(body);
            }
        }
        hasher.update(&self.operation.signature.0);
        for write in &self.writes {
            hasher.update(&write.contract_slot_index.to_le_bytes());
            hasher.update(&write.storage_slot_index.to_le_bytes());
            hasher.update(&write.new_value);
        }
        Hash(*hasher.finalize().as_bytes())
    }
}

/// The not-yet-committed block being built.
///
/// Owned exclusively by the aggregator process; block numbers start at 1 and
/// increase by exactly 1 each time a block is committed.
#[derive(Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize, Debug)]
pub struct PendingBlock {
    pub block_number: u64,
    pub transitions: Vec<TransitionRecord>,
}

impl PendingBlock {
    pub fn new(block_number: u64) -> Self {
        Self {
            block_number,
            transitions: Vec::new(),
        }
    }
}

/// A committed block as handed to the settlement-layer submitter
#[derive(Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize, Debug)]
pub struct SealedBlock {
    pub block_number: u64,
    pub state_root: Hash,
    pub operations: Vec<Operation>,
}
