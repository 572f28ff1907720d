//! Bounded-backoff retry around a block submitter

use crate::submitter::{BlockSubmitter, SubmissionError, SubmissionReceipt};
use async_trait::async_trait;
use rollup_core::types::SealedBlock;
use tokio::time::Duration;

/// Retry schedule: exponential backoff from `base_delay`, doubling up to
/// `max_delay`, at most `max_attempts` tries in total.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Wraps a submitter with bounded exponential backoff.
///
/// Every attempt resubmits the identical sealed block; the block is never
/// re-folded or re-numbered between attempts.
pub struct RetryingSubmitter<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S> RetryingSubmitter<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<S: BlockSubmitter> BlockSubmitter for RetryingSubmitter<S> {
    async fn submit_block(
        &self,
        block: &SealedBlock,
    ) -> Result<SubmissionReceipt, SubmissionError> {
        let mut attempt = 1u32;
        let mut delay = self.policy.base_delay;
        loop {
            match self.inner.submit_block(block).await {
                Ok(receipt) => {
                    if attempt > 1 {
                        tracing::info!(
                            block_number = block.block_number,
                            attempt,
                            "Block submission succeeded after retry"
                        );
                    }
                    return Ok(receipt);
                }
                Err(err) if attempt >= self.policy.max_attempts => {
                    return Err(err);
                }
                Err(err) => {
                    tracing::warn!(
                        block_number = block.block_number,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %err,
                        "Block submission failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.policy.max_delay);
                    attempt += 1;
                }
            }
        }
    }
}
