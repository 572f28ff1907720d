//! State Trie Manager - two-level sparse Merkle state
//!
//! The root trie is keyed by contract slot index and its leaves are the root
//! hashes of per-contract storage subtries. Subtries are created lazily the
//! first time a write targets a contract slot with no existing leaf. The two
//! levels are kept consistent inside one commit pass: a contract's root-trie
//! leaf is rewritten only after all of that contract's storage writes have
//! been folded into its subtree.

use crate::error::TrieUpdateError;
use crate::trie::{InclusionProof, SparseMerkleTree};
use crate::types::{Hash, StorageWrite};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Depth of the root trie over contract slot indexes
pub const CONTRACT_TRIE_DEPTH: u8 = 16;

/// Depth of each per-contract storage subtree
pub const STORAGE_TRIE_DEPTH: u8 = 32;

/// Proof that a storage slot holds a value under the current state root.
///
/// Chains the subtree path (value up to the subtree root) with the root-trie
/// path (subtree root up to the state root). Consumed by the external
/// fraud-proof pipeline, not by the aggregator core itself.
#[derive(Clone, Debug)]
pub struct StorageProof {
    /// Path from the value to the subtree root
    pub storage: InclusionProof,
    /// Path from the subtree root (as root-trie leaf) to the state root
    pub contract: InclusionProof,
}

impl StorageProof {
    /// The proven value; empty proves absence
    pub fn value(&self) -> &[u8] {
        &self.storage.value
    }

    pub fn verify(&self, state_root: &Hash) -> bool {
        let subtree_root = if self.contract.value.is_empty() {
            SparseMerkleTree::empty_root(STORAGE_TRIE_DEPTH)
        } else {
            match Hash::from_slice(&self.contract.value) {
                Some(hash) => hash,
                None => return false,
            }
        };
        self.storage.verify(&subtree_root) && self.contract.verify(state_root)
    }
}

/// Result of folding a batch of writes into the trie
#[derive(Debug)]
pub struct FoldOutcome {
    /// Root-trie root after the fold
    pub state_root: Hash,
    /// The deduplicated writes that were actually applied, in key order
    pub applied: Vec<StorageWrite>,
}

/// Two-level sparse Merkle state with advisory lock-free root reads.
///
/// Mutation is expected to be serialized by the aggregator's block-mutation
/// lock; `current_root` and the proof operations may race against a commit
/// and return a value that is stale by the time the caller acts on it.
pub struct StateTrieManager {
    root: RwLock<SparseMerkleTree>,
    subtrees: DashMap<u64, SparseMerkleTree>,
}

impl StateTrieManager {
    pub fn new() -> Self {
        Self {
            root: RwLock::new(SparseMerkleTree::new(CONTRACT_TRIE_DEPTH)),
            subtrees: DashMap::new(),
        }
    }

    /// Rebuild both levels from committed `(contract, slot, value)` leaves,
    /// returning the resulting state root for integrity checking.
    pub fn from_committed_leaves<I>(leaves: I) -> Result<(Self, Hash), TrieUpdateError>
    where
        I: IntoIterator<Item = (u64, u64, Vec<u8>)>,
    {
        let manager = Self::new();
        let mut by_contract: BTreeMap<u64, Vec<(u64, Vec<u8>)>> = BTreeMap::new();
        for (contract, slot, value) in leaves {
            by_contract.entry(contract).or_default().push((slot, value));
        }
        for (contract, slots) in &by_contract {
            let slot_refs: Vec<(u64, &[u8])> =
                slots.iter().map(|(slot, value)| (*slot, value.as_slice())).collect();
            let subtree_root = manager.update_subtree(*contract, &slot_refs)?;
            manager.promote_subtree(*contract, subtree_root)?;
        }
        let state_root = manager.current_root();
        Ok((manager, state_root))
    }

    /// Current root-trie root; pure advisory read
    pub fn current_root(&self) -> Hash {
        self.root.read().root()
    }

    /// Apply a single storage write through both levels
    pub fn apply_write(
        &self,
        contract_slot_index: u64,
        storage_slot_index: u64,
        value: &[u8],
    ) -> Result<(), TrieUpdateError> {
        let subtree_root = self.update_subtree(contract_slot_index, &[(storage_slot_index, value)])?;
        self.promote_subtree(contract_slot_index, subtree_root)
    }

    /// Fold a commit pass worth of writes into the trie.
    ///
    /// Writes to the same `(contract, slot)` pair are deduplicated to the
    /// last one before the trie is touched; each contract's root-trie leaf is
    /// updated exactly once, after all of its storage writes. Iteration is in
    /// key order, so equal write sets always produce equal roots.
    pub fn fold_writes(&self, writes: &[StorageWrite]) -> Result<FoldOutcome, TrieUpdateError> {
        let mut deduped: BTreeMap<(u64, u64), &[u8]> = BTreeMap::new();
        for write in writes {
            deduped.insert(
                (write.contract_slot_index, write.storage_slot_index),
                write.new_value.as_slice(),
            );
        }

        let mut by_contract: BTreeMap<u64, Vec<(u64, &[u8])>> = BTreeMap::new();
        for ((contract, slot), value) in &deduped {
            by_contract.entry(*contract).or_default().push((*slot, *value));
        }

        for (contract, slots) in &by_contract {
            let subtree_root = self.update_subtree(*contract, slots)?;
            self.promote_subtree(*contract, subtree_root)?;
        }

        let applied = deduped
            .into_iter()
            .map(|((contract, slot), value)| StorageWrite {
                contract_slot_index: contract,
                storage_slot_index: slot,
                new_value: value.to_vec(),
            })
            .collect();

        Ok(FoldOutcome {
            state_root: self.current_root(),
            applied,
        })
    }

    /// Inclusion proof for a contract's subtree root in the root trie
    pub fn prove_contract(&self, contract_slot_index: u64) -> Result<InclusionProof, TrieUpdateError> {
        self.root.read().prove(contract_slot_index)
    }

    /// Chained inclusion proof for a storage slot under the state root
    pub fn prove_storage(
        &self,
        contract_slot_index: u64,
        storage_slot_index: u64,
    ) -> Result<StorageProof, TrieUpdateError> {
        let storage = match self.subtrees.get(&contract_slot_index) {
            Some(subtree) => subtree.prove(storage_slot_index)?,
            None => SparseMerkleTree::new(STORAGE_TRIE_DEPTH).prove(storage_slot_index)?,
        };
        let contract = self.root.read().prove(contract_slot_index)?;
        Ok(StorageProof { storage, contract })
    }

    /// Number of materialized subtrees
    pub fn subtree_count(&self) -> usize {
        self.subtrees.len()
    }

    /// Fold writes into one contract's subtree and return its new root
    fn update_subtree(
        &self,
        contract_slot_index: u64,
        writes: &[(u64, &[u8])],
    ) -> Result<Hash, TrieUpdateError> {
        if contract_slot_index >> CONTRACT_TRIE_DEPTH != 0 {
            return Err(TrieUpdateError::KeyOutOfRange {
                key: contract_slot_index,
                depth: CONTRACT_TRIE_DEPTH,
            });
        }

        let committed = self.root.read().get(contract_slot_index).map(|v| v.to_vec());

        // The cached subtree (or, for a lazily-created one, the canonical
        // empty root) must agree with the committed leaf before any of its
        // reads or writes are considered valid.
        if let Some(leaf) = &committed {
            let cached_root = match self.subtrees.get(&contract_slot_index) {
                Some(subtree) => subtree.root(),
                None => SparseMerkleTree::empty_root(STORAGE_TRIE_DEPTH),
            };
            if leaf.as_slice() != cached_root.as_bytes().as_slice() {
                return Err(TrieUpdateError::SubtreeMismatch { contract_slot_index });
            }
        }

        let mut subtree = self
            .subtrees
            .entry(contract_slot_index)
            .or_insert_with(|| SparseMerkleTree::new(STORAGE_TRIE_DEPTH));

        for (slot, value) in writes {
            subtree.update(*slot, value)?;
            if subtree.get(*slot) != Some(*value) {
                return Err(TrieUpdateError::StorageWriteRejected {
                    contract_slot_index,
                    storage_slot_index: *slot,
                });
            }
        }
        Ok(subtree.root())
    }

    /// Write a subtree root as the contract's root-trie leaf
    fn promote_subtree(
        &self,
        contract_slot_index: u64,
        subtree_root: Hash,
    ) -> Result<(), TrieUpdateError> {
        let mut root = self.root.write();
        root.update(contract_slot_index, subtree_root.as_bytes())?;
        if root.get(contract_slot_index) != Some(subtree_root.as_bytes().as_slice()) {
            return Err(TrieUpdateError::ContractWriteRejected { contract_slot_index });
        }
        Ok(())
    }
}

impl Default for StateTrieManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::collections::HashMap;

    fn write(contract: u64, slot: u64, value: &[u8]) -> StorageWrite {
        StorageWrite {
            contract_slot_index: contract,
            storage_slot_index: slot,
            new_value: value.to_vec(),
        }
    }

    #[test]
    fn test_apply_write_and_prove() {
        let trie = StateTrieManager::new();
        let empty = trie.current_root();

        trie.apply_write(5, 0, b"a").unwrap();
        assert_ne!(trie.current_root(), empty);

        let proof = trie.prove_storage(5, 0).unwrap();
        assert_eq!(proof.value(), b"a");
        assert!(proof.verify(&trie.current_root()));
    }

    #[test]
    fn test_absent_slot_proves_empty() {
        let trie = StateTrieManager::new();
        trie.apply_write(5, 0, b"a").unwrap();

        // Absent slot in an existing subtree
        let proof = trie.prove_storage(5, 9).unwrap();
        assert!(proof.value().is_empty());
        assert!(proof.verify(&trie.current_root()));

        // Absent contract entirely
        let proof = trie.prove_storage(7, 0).unwrap();
        assert!(proof.value().is_empty());
        assert!(proof.verify(&trie.current_root()));
    }

    #[test]
    fn test_fold_dedupes_last_write_wins() {
        let trie = StateTrieManager::new();
        let outcome = trie
            .fold_writes(&[
                write(5, 0, b"first"),
                write(5, 1, b"other"),
                write(5, 0, b"last"),
            ])
            .unwrap();

        assert_eq!(outcome.applied.len(), 2);
        let proof = trie.prove_storage(5, 0).unwrap();
        assert_eq!(proof.value(), b"last");
        assert!(proof.verify(&outcome.state_root));
    }

    #[test]
    fn test_fold_is_deterministic() {
        let a = StateTrieManager::new();
        let b = StateTrieManager::new();

        a.fold_writes(&[write(1, 1, b"x"), write(2, 2, b"y"), write(1, 3, b"z")])
            .unwrap();
        b.fold_writes(&[write(1, 3, b"z"), write(1, 1, b"x"), write(2, 2, b"y")])
            .unwrap();

        assert_eq!(a.current_root(), b.current_root());
    }

    #[test]
    fn test_random_writes_all_provable() {
        let mut rng = StdRng::seed_from_u64(17);
        let trie = StateTrieManager::new();
        let mut expected: HashMap<(u64, u64), Vec<u8>> = HashMap::new();

        for _ in 0..8 {
            let batch: Vec<StorageWrite> = (0..25)
                .map(|_| {
                    let contract = rng.gen_range(0..8u64);
                    let slot = rng.gen_range(0..16u64);
                    let value: Vec<u8> = (0..rng.gen_range(1..24usize)).map(|_| rng.gen()).collect();
                    write(contract, slot, &value)
                })
                .collect();
            for w in &batch {
                expected.insert((w.contract_slot_index, w.storage_slot_index), w.new_value.clone());
            }
            trie.fold_writes(&batch).unwrap();
        }

        let root = trie.current_root();
        for ((contract, slot), value) in &expected {
            let proof = trie.prove_storage(*contract, *slot).unwrap();
            assert_eq!(proof.value(), value.as_slice(), "slot ({contract}, {slot})");
            assert!(proof.verify(&root));
        }
    }

    #[test]
    fn test_rebuild_from_committed_leaves() {
        let trie = StateTrieManager::new();
        trie.fold_writes(&[write(5, 0, b"a"), write(5, 1, b"b"), write(7, 0, b"c")])
            .unwrap();
        let root = trie.current_root();

        let leaves: Vec<(u64, u64, Vec<u8>)> = vec![
            (5, 0, b"a".to_vec()),
            (5, 1, b"b".to_vec()),
            (7, 0, b"c".to_vec()),
        ];
        let (rebuilt, rebuilt_root) = StateTrieManager::from_committed_leaves(leaves).unwrap();
        assert_eq!(rebuilt_root, root);
        assert_eq!(rebuilt.subtree_count(), 2);

        let proof = rebuilt.prove_storage(5, 1).unwrap();
        assert_eq!(proof.value(), b"b");
        assert!(proof.verify(&root));
    }

    #[test]
    fn test_contract_key_out_of_range() {
        let trie = StateTrieManager::new();
        let err = trie.apply_write(1 << CONTRACT_TRIE_DEPTH, 0, b"x").unwrap_err();
        assert!(matches!(err, TrieUpdateError::KeyOutOfRange { .. }));
    }
}
