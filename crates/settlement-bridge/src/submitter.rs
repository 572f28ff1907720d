//! Block submitter boundary

use async_trait::async_trait;
use rollup_core::types::{Hash, SealedBlock};
use thiserror::Error;

/// Submission failures reported by the settlement layer
#[derive(Error, Debug, Clone)]
pub enum SubmissionError {
    #[error("settlement layer rejected block {block_number}: {reason}")]
    Rejected { block_number: u64, reason: String },

    #[error("settlement layer unreachable: {0}")]
    Unreachable(String),
}

/// Durable acceptance of a block by the settlement layer
#[derive(Debug, Clone)]
pub struct SubmissionReceipt {
    pub block_number: u64,
    pub state_root: Hash,
    /// Confirmation timestamp, unix seconds
    pub confirmed_ts: i64,
}

/// Delivers a sealed block to the settlement layer.
///
/// Implementations report success only once the block is durably accepted
/// there. The aggregator core calls this at most once per committed block;
/// any retrying wraps the submitter (see `RetryingSubmitter`) and always
/// resubmits the identical block.
#[async_trait]
pub trait BlockSubmitter: Send + Sync {
    async fn submit_block(&self, block: &SealedBlock)
        -> Result<SubmissionReceipt, SubmissionError>;
}

/// Stub submitter that logs and acknowledges every block.
///
/// Stands in until a real settlement client is wired up; useful for local
/// runs and tests.
pub struct LoggingSubmitter;

impl LoggingSubmitter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LoggingSubmitter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlockSubmitter for LoggingSubmitter {
    async fn submit_block(
        &self,
        block: &SealedBlock,
    ) -> Result<SubmissionReceipt, SubmissionError> {
        tracing::info!(
            block_number = block.block_number,
            operations = block.operations.len(),
            state_root = %block.state_root,
            "Would submit block to settlement layer"
        );
        Ok(SubmissionReceipt {
            block_number: block.block_number,
            state_root: block.state_root,
            confirmed_ts: chrono::Utc::now().timestamp(),
        })
    }
}
