//! Pending block accumulation
//!
//! Holds the ordered list of not-yet-committed transitions and mirrors every
//! accepted transition to the durable log before the in-memory append becomes
//! visible. Callers are expected to serialize access through the aggregator's
//! block-mutation lock.

use crate::error::AccumulatorError;
use crate::log_store::TransitionLog;
use crate::types::{Operation, PendingBlock, StorageWrite, TransitionRecord};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Result of an append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The transition was durably persisted and appended
    Appended { sequence_number: u64 },
    /// The transition matched the current tail byte-for-byte and was ignored
    Duplicate,
}

/// The pending block plus its durable mirror
pub struct PendingBlockAccumulator {
    log: Arc<TransitionLog>,
    block: PendingBlock,
    size_hint: Arc<AtomicUsize>,
    block_number_hint: Arc<AtomicU64>,
}

impl PendingBlockAccumulator {
    /// Start from a fresh, empty pending block
    pub fn new(log: Arc<TransitionLog>, block_number: u64) -> Self {
        Self::from_recovered(log, PendingBlock::new(block_number))
    }

    /// Resume from a block reconstructed out of the durable log
    pub fn from_recovered(log: Arc<TransitionLog>, block: PendingBlock) -> Self {
        let size_hint = Arc::new(AtomicUsize::new(block.transitions.len()));
        let block_number_hint = Arc::new(AtomicU64::new(block.block_number));
        Self {
            log,
            block,
            size_hint,
            block_number_hint,
        }
    }

    /// Append a transition, persisting it before it becomes visible.
    ///
    /// A transition whose content matches the current tail byte-for-byte is
    /// the duplicate-submission safeguard: it is ignored with a warning and
    /// nothing is written. Sequence numbers must arrive gapless.
    pub fn append(&mut self, record: TransitionRecord) -> Result<AppendOutcome, AccumulatorError> {
        if let Some(tail) = self.block.transitions.last() {
            if tail.same_content(&record) {
                tracing::warn!(
                    block_number = self.block.block_number,
                    content_hash = %record.content_hash(),
                    "Ignoring duplicate transition matching the pending block tail"
                );
                return Ok(AppendOutcome::Duplicate);
            }
        }

        let expected = self.next_sequence_number();
        if record.sequence_number != expected {
            return Err(AccumulatorError::SequenceGap {
                expected,
                got: record.sequence_number,
            });
        }

        // Durability ordering: the record and the updated count must be on
        // disk before the in-memory append is visible to anyone.
        self.log.put_transition(&record)?;
        self.log.put_transaction_count(expected)?;
        self.log.flush()?;

        self.block.transitions.push(record);
        self.size_hint
            .store(self.block.transitions.len(), Ordering::SeqCst);

        tracing::debug!(
            block_number = self.block.block_number,
            sequence_number = expected,
            "Transition appended to pending block"
        );

        Ok(AppendOutcome::Appended {
            sequence_number: expected,
        })
    }

    /// Build a record with the next sequence number and append it
    pub fn append_operation(
        &mut self,
        operation: Operation,
        writes: Vec<StorageWrite>,
    ) -> Result<AppendOutcome, AccumulatorError> {
        let record = TransitionRecord {
            sequence_number: self.next_sequence_number(),
            operation,
            writes,
        };
        self.append(record)
    }

    /// Swap in a fresh pending block with the next number and hand the
    /// current one to the caller for committing.
    pub fn drain_for_commit(&mut self) -> PendingBlock {
        let next = PendingBlock::new(self.block.block_number + 1);
        let drained = std::mem::replace(&mut self.block, next);
        self.publish_hints();
        drained
    }

    /// Put a drained block back wholesale; the trie-fold failure path
    pub fn restore(&mut self, block: PendingBlock) {
        self.block = block;
        self.publish_hints();
    }

    pub fn size(&self) -> usize {
        self.block.transitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.block.transitions.is_empty()
    }

    pub fn block_number(&self) -> u64 {
        self.block.block_number
    }

    pub fn next_sequence_number(&self) -> u64 {
        self.block.transitions.len() as u64 + 1
    }

    /// Snapshot of the pending block
    pub fn block(&self) -> &PendingBlock {
        &self.block
    }

    /// Advisory size readable without the block-mutation lock
    pub fn size_hint(&self) -> Arc<AtomicUsize> {
        self.size_hint.clone()
    }

    /// Advisory block number readable without the block-mutation lock
    pub fn block_number_hint(&self) -> Arc<AtomicU64> {
        self.block_number_hint.clone()
    }

    fn publish_hints(&self) {
        self.size_hint
            .store(self.block.transitions.len(), Ordering::SeqCst);
        self.block_number_hint
            .store(self.block.block_number, Ordering::SeqCst);
    }
}
