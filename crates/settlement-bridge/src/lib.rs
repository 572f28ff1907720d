//! Settlement Bridge - Hands sealed blocks to the settlement layer
//!
//! The aggregator core seals blocks and pushes them into a channel; this
//! crate owns everything on the other side:
//! - The `BlockSubmitter` boundary trait
//! - A logging stub submitter for development
//! - Bounded-backoff retry around any submitter
//! - The submission worker that drains the channel in order

pub mod retry;
pub mod submitter;
pub mod worker;

pub use retry::{RetryPolicy, RetryingSubmitter};
pub use submitter::{BlockSubmitter, LoggingSubmitter, SubmissionError, SubmissionReceipt};
pub use worker::SubmissionWorker;
