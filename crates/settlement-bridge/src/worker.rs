//! Submission worker - the submitter's own concurrency domain
//!
//! Drains sealed blocks from the aggregator's outbound channel and submits
//! them strictly in order, one in flight at a time. A block that the
//! settlement layer never confirms is reported to the operator and the
//! worker moves on; block numbering is untouched.

use crate::submitter::BlockSubmitter;
use rollup_core::types::SealedBlock;
use tokio::sync::mpsc::UnboundedReceiver;

pub struct SubmissionWorker<S> {
    submitter: S,
    sealed_rx: UnboundedReceiver<SealedBlock>,
}

impl<S: BlockSubmitter> SubmissionWorker<S> {
    pub fn new(submitter: S, sealed_rx: UnboundedReceiver<SealedBlock>) -> Self {
        Self {
            submitter,
            sealed_rx,
        }
    }

    /// Run until the aggregator side of the channel closes
    pub async fn run(mut self) {
        while let Some(block) = self.sealed_rx.recv().await {
            let block_number = block.block_number;
            match self.submitter.submit_block(&block).await {
                Ok(receipt) => {
                    tracing::info!(
                        block_number,
                        state_root = %receipt.state_root,
                        "Block confirmed by settlement layer"
                    );
                }
                Err(err) => {
                    // Built but not externally confirmed; operator-facing
                    tracing::error!(
                        block_number,
                        error = %err,
                        "Block submission failed permanently"
                    );
                }
            }
        }
        tracing::info!("Sealed-block channel closed; submission worker stopping");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::submitter::{SubmissionError, SubmissionReceipt};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rollup_core::types::Hash;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    struct RecordingSubmitter {
        submitted: Arc<Mutex<Vec<u64>>>,
        fail_block: Option<u64>,
    }

    #[async_trait]
    impl BlockSubmitter for RecordingSubmitter {
        async fn submit_block(
            &self,
            block: &SealedBlock,
        ) -> Result<SubmissionReceipt, SubmissionError> {
            self.submitted.lock().push(block.block_number);
            if self.fail_block == Some(block.block_number) {
                return Err(SubmissionError::Rejected {
                    block_number: block.block_number,
                    reason: "stale root".into(),
                });
            }
            Ok(SubmissionReceipt {
                block_number: block.block_number,
                state_root: block.state_root,
                confirmed_ts: 0,
            })
        }
    }

    fn block(block_number: u64) -> SealedBlock {
        SealedBlock {
            block_number,
            state_root: Hash([1u8; 32]),
            operations: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_submits_in_order_and_survives_failures() {
        let submitted = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = SubmissionWorker::new(
            RecordingSubmitter {
                submitted: submitted.clone(),
                fail_block: Some(2),
            },
            rx,
        );

        for n in 1..=3 {
            tx.send(block(n)).unwrap();
        }
        drop(tx);
        worker.run().await;

        // The failed block is reported but does not stop later submissions
        assert_eq!(*submitted.lock(), vec![1, 2, 3]);
    }
}
