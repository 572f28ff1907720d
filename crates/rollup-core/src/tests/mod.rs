//! Aggregator scenario tests
//!
//! End-to-end tests of the commit flow and crash recovery, driving the
//! aggregator the way the node binary does.

mod commit_flow;

use crate::aggregator::{AggregatorConfig, BlockAggregator};
use crate::log_store::TransitionLog;
use crate::types::{Address, Operation, OperationPayload, SealedBlock, Signature, StorageWrite};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Duration;

/// Long enough that no idle commit fires during a test
const IDLE_NEVER_MS: u64 = 3_600_000;

fn transfer(amount: u64) -> Operation {
    Operation {
        sender: Address([3u8; 20]),
        payload: OperationPayload::Transfer {
            recipient: Address([4u8; 20]),
            token_type: 0,
            amount,
        },
        signature: Signature(vec![5u8; 65]),
    }
}

fn write(contract: u64, slot: u64, value: &[u8]) -> StorageWrite {
    StorageWrite {
        contract_slot_index: contract,
        storage_slot_index: slot,
        new_value: value.to_vec(),
    }
}

fn open(
    path: &Path,
    cap: usize,
    idle_ms: u64,
) -> (
    Arc<BlockAggregator>,
    UnboundedReceiver<SealedBlock>,
    Arc<TransitionLog>,
) {
    let log = Arc::new(TransitionLog::open(path).unwrap());
    let config = AggregatorConfig {
        max_transitions_per_block: cap,
        max_idle: Duration::from_millis(idle_ms),
    };
    let (aggregator, sealed_rx) = BlockAggregator::open(log.clone(), config).unwrap();
    (aggregator, sealed_rx, log)
}
