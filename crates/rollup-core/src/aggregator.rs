//! Block aggregation and commit scheduling
//!
//! The `BlockAggregator` owns the pending block and the state trie, serializes
//! every read-modify-write through a single block-mutation lock, and commits a
//! block when it reaches the size cap or when the idle interval since the last
//! commit elapses with transitions waiting. Sealed blocks are handed to the
//! submitter through an outbound channel so a slow settlement layer never
//! stalls acceptance of new operations.

use crate::error::{AggregatorError, BootstrapError, CommitError, TrieUpdateError};
use crate::log_store::{SubmissionMetadata, TransitionLog};
use crate::pending::{AppendOutcome, PendingBlockAccumulator};
use crate::state_trie::{StateTrieManager, StorageProof};
use crate::trie::InclusionProof;
use crate::types::{Hash, Operation, PendingBlock, SealedBlock, StorageWrite, TransitionRecord};
use crate::{DEFAULT_MAX_IDLE_MILLIS, DEFAULT_MAX_TRANSITIONS_PER_BLOCK};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

/// Aggregator configuration
#[derive(Clone, Debug)]
pub struct AggregatorConfig {
    /// Commit once the pending block holds this many transitions
    pub max_transitions_per_block: usize,
    /// Commit a non-empty pending block after this much idle time
    pub max_idle: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            max_transitions_per_block: DEFAULT_MAX_TRANSITIONS_PER_BLOCK,
            max_idle: Duration::from_millis(DEFAULT_MAX_IDLE_MILLIS),
        }
    }
}

/// Result of a commit attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// A block was sealed and handed to the submission channel
    Committed {
        block_number: u64,
        state_root: Hash,
        transition_count: usize,
    },
    /// The guard declined: block below the cap and idle time not elapsed,
    /// or nothing to commit. The idle timer was re-armed.
    Deferred,
}

/// Mutable aggregator state guarded by the block-mutation lock
struct AggregatorState {
    accumulator: PendingBlockAccumulator,
    last_commit: Instant,
}

/// Single outstanding idle-timer handle; the generation counter lets a
/// superseded firing recognize itself even if the abort raced its wakeup.
struct IdleTimer {
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

/// The rollup block aggregator.
///
/// All mutation runs under one lock; `size`, `block_number` and
/// `current_root` are advisory lock-free reads that may be stale by the time
/// the caller acts on them.
pub struct BlockAggregator {
    state: tokio::sync::Mutex<AggregatorState>,
    trie: StateTrieManager,
    log: Arc<TransitionLog>,
    sealed_tx: mpsc::UnboundedSender<SealedBlock>,
    config: AggregatorConfig,
    size_hint: Arc<AtomicUsize>,
    block_number_hint: Arc<AtomicU64>,
    idle_timer: parking_lot::Mutex<IdleTimer>,
}

impl BlockAggregator {
    /// Reconstruct the aggregator purely from the durable log.
    ///
    /// Replays pending transitions `1..=transaction_count` in order and
    /// rebuilds the state trie from the committed leaves, verifying the
    /// result against the persisted tree root. Replay never touches the
    /// trie: the persisted root reflects only committed state, and pending
    /// transitions by definition have not been folded yet.
    ///
    /// Returns the aggregator and the receiver side of the sealed-block
    /// channel, which the submission worker should drain.
    pub fn open(
        log: Arc<TransitionLog>,
        config: AggregatorConfig,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<SealedBlock>), BootstrapError> {
        let transaction_count = log.transaction_count()?.unwrap_or(0);
        let block_number = log.pending_block_number()?.unwrap_or(1);
        let persisted_root = log.tree_root()?;

        let (trie, computed_root) = StateTrieManager::from_committed_leaves(log.state_leaves()?)?;
        if let Some(persisted) = persisted_root {
            if persisted != computed_root {
                return Err(BootstrapError::RootMismatch {
                    computed: computed_root,
                    persisted,
                });
            }
        }

        let mut transitions = Vec::with_capacity(transaction_count as usize);
        for seq in 1..=transaction_count {
            let record = log
                .transition(seq)
                .map_err(|source| BootstrapError::Transition { seq, source })?
                .ok_or(BootstrapError::MissingTransition {
                    seq,
                    count: transaction_count,
                })?;
            if record.sequence_number != seq {
                return Err(BootstrapError::SequenceMismatch {
                    seq,
                    found: record.sequence_number,
                });
            }
            transitions.push(record);
        }

        let pending = PendingBlock {
            block_number,
            transitions,
        };
        tracing::info!(
            block_number,
            transitions = pending.transitions.len(),
            state_root = %computed_root,
            "Aggregator state recovered from durable log"
        );

        let accumulator = PendingBlockAccumulator::from_recovered(log.clone(), pending);
        let size_hint = accumulator.size_hint();
        let block_number_hint = accumulator.block_number_hint();

        // Resume the idle window from the persisted submission timestamp
        let last_commit = match log.last_submission()? {
            Some(meta) => {
                let elapsed_secs = (chrono::Utc::now().timestamp() - meta.submitted_ts).max(0);
                let elapsed = Duration::from_secs(elapsed_secs as u64).min(config.max_idle);
                Instant::now()
                    .checked_sub(elapsed)
                    .unwrap_or_else(Instant::now)
            }
            None => Instant::now(),
        };

        let (sealed_tx, sealed_rx) = mpsc::unbounded_channel();

        let aggregator = Arc::new(Self {
            state: tokio::sync::Mutex::new(AggregatorState {
                accumulator,
                last_commit,
            }),
            trie,
            log,
            sealed_tx,
            config,
            size_hint,
            block_number_hint,
            idle_timer: parking_lot::Mutex::new(IdleTimer {
                generation: 0,
                handle: None,
            }),
        });

        Ok((aggregator, sealed_rx))
    }

    /// Arm the idle timer and evaluate the recovered pending block.
    ///
    /// Handles the crash that persisted a full block but died before the
    /// commit: if the recovered block already meets the size cap it is
    /// committed immediately.
    pub async fn start(self: &Arc<Self>) -> Result<CommitOutcome, CommitError> {
        self.try_commit().await
    }

    /// Append an operation with its storage writes as the next transition.
    ///
    /// Returns only after the transition is durably logged. A duplicate of
    /// the pending tail is a soft success. If the append fills the block,
    /// the commit pass runs within this call and a `TrieUpdateError` from it
    /// propagates here; the transitions stay queued either way.
    pub async fn append_operation(
        self: &Arc<Self>,
        operation: Operation,
        writes: Vec<StorageWrite>,
    ) -> Result<AppendOutcome, AggregatorError> {
        let (outcome, should_commit) = {
            let mut state = self.state.lock().await;
            let outcome = state.accumulator.append_operation(operation, writes)?;
            let should_commit =
                state.accumulator.size() >= self.config.max_transitions_per_block;
            (outcome, should_commit)
        };
        if should_commit {
            self.try_commit().await?;
        }
        Ok(outcome)
    }

    /// Append a pre-built transition record; sequence numbers must be gapless
    pub async fn append_transition(
        self: &Arc<Self>,
        record: TransitionRecord,
    ) -> Result<AppendOutcome, AggregatorError> {
        let (outcome, should_commit) = {
            let mut state = self.state.lock().await;
            let outcome = state.accumulator.append(record)?;
            let should_commit =
                state.accumulator.size() >= self.config.max_transitions_per_block;
            (outcome, should_commit)
        };
        if should_commit {
            self.try_commit().await?;
        }
        Ok(outcome)
    }

    /// Attempt a commit. Single entry point for the size trigger, the idle
    /// timer and the bootstrap evaluation; the guard defers (and re-arms the
    /// timer) when the block is below the cap and the idle window is open,
    /// and never commits an empty block.
    pub async fn try_commit(self: &Arc<Self>) -> Result<CommitOutcome, CommitError> {
        let mut state = self.state.lock().await;

        let size = state.accumulator.size();
        if size < self.config.max_transitions_per_block {
            let elapsed = state.last_commit.elapsed();
            if elapsed < self.config.max_idle {
                tracing::debug!(
                    size,
                    cap = self.config.max_transitions_per_block,
                    "Not committing: block below cap and idle window open"
                );
                drop(state);
                self.arm_idle_timer(self.config.max_idle - elapsed);
                return Ok(CommitOutcome::Deferred);
            }
            if size == 0 {
                drop(state);
                self.arm_idle_timer(self.config.max_idle);
                return Ok(CommitOutcome::Deferred);
            }
        }

        let drained = state.accumulator.drain_for_commit();
        let block_number = drained.block_number;
        let next_block_number = state.accumulator.block_number();
        tracing::debug!(
            block_number,
            transitions = drained.transitions.len(),
            "Building block"
        );

        let state_root = match self.fold_and_persist(&drained, next_block_number) {
            Ok(root) => root,
            Err(err) => {
                tracing::error!(
                    block_number,
                    error = %err,
                    "Commit failed; re-queueing drained transitions as the pending block"
                );
                state.accumulator.restore(drained);
                drop(state);
                self.arm_idle_timer(self.config.max_idle);
                return Err(err);
            }
        };

        let transition_count = drained.transitions.len();
        let sealed = SealedBlock {
            block_number,
            state_root,
            operations: drained
                .transitions
                .into_iter()
                .map(|t| t.operation)
                .collect(),
        };

        // Hand off to the submitter's concurrency domain; acceptance of new
        // operations resumes as soon as the lock is released, well before the
        // external submission completes.
        if self.sealed_tx.send(sealed).is_err() {
            tracing::warn!(block_number, "Sealed-block receiver dropped; block not submitted");
        }

        state.last_commit = Instant::now();
        drop(state);
        self.arm_idle_timer(self.config.max_idle);

        tracing::info!(
            block_number,
            transitions = transition_count,
            state_root = %state_root,
            "Block committed"
        );

        Ok(CommitOutcome::Committed {
            block_number,
            state_root,
            transition_count,
        })
    }

    /// Advisory pending-block size
    pub fn size(&self) -> usize {
        self.size_hint.load(Ordering::SeqCst)
    }

    /// Advisory pending block number
    pub fn block_number(&self) -> u64 {
        self.block_number_hint.load(Ordering::SeqCst)
    }

    /// Advisory committed state root
    pub fn current_root(&self) -> Hash {
        self.trie.current_root()
    }

    pub fn prove_contract(&self, contract_slot_index: u64) -> Result<InclusionProof, TrieUpdateError> {
        self.trie.prove_contract(contract_slot_index)
    }

    pub fn prove_storage(
        &self,
        contract_slot_index: u64,
        storage_slot_index: u64,
    ) -> Result<StorageProof, TrieUpdateError> {
        self.trie.prove_storage(contract_slot_index, storage_slot_index)
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Snapshot of the pending block, taken under the lock
    pub async fn pending_block(&self) -> PendingBlock {
        self.state.lock().await.accumulator.block().clone()
    }

    /// Fold the drained block's writes into the trie and persist the commit:
    /// committed leaves, tree root, reset counters, submission metadata, one
    /// flush. Called under the block-mutation lock.
    fn fold_and_persist(
        &self,
        block: &PendingBlock,
        next_block_number: u64,
    ) -> Result<Hash, CommitError> {
        let writes: Vec<StorageWrite> = block
            .transitions
            .iter()
            .flat_map(|t| t.writes.iter().cloned())
            .collect();
        let outcome = self.trie.fold_writes(&writes)?;

        for write in &outcome.applied {
            self.log.put_state_leaf(write)?;
        }
        self.log.put_tree_root(&outcome.state_root)?;
        self.log.put_transaction_count(0)?;
        self.log.put_pending_block_number(next_block_number)?;
        self.log.put_last_submission(&SubmissionMetadata {
            block_number: block.block_number,
            state_root: *outcome.state_root.as_bytes(),
            transition_count: block.transitions.len() as u64,
            submitted_ts: chrono::Utc::now().timestamp(),
        })?;
        self.log.flush()?;

        Ok(outcome.state_root)
    }

    /// Schedule the idle-commit firing `delay` from now. Re-arming cancels
    /// any previously scheduled firing, so there is never more than one
    /// outstanding idle timer per aggregator.
    fn arm_idle_timer(self: &Arc<Self>, delay: Duration) {
        let mut timer = self.idle_timer.lock();
        timer.generation += 1;
        let generation = timer.generation;
        let weak: Weak<Self> = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(aggregator) = weak.upgrade() else {
                return;
            };
            if aggregator.idle_timer.lock().generation != generation {
                // A newer arming superseded this firing
                return;
            }
            if let Err(err) = aggregator.try_commit().await {
                tracing::error!(error = %err, "Idle-triggered commit failed");
            }
        });

        if let Some(previous) = timer.handle.replace(handle) {
            previous.abort();
        }
    }
}
