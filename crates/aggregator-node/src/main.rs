//! Rollup Aggregator Node
//!
//! Operator entry point for the block aggregator. Bootstraps the aggregator
//! from its durable log, spawns the submission worker, and feeds it
//! transition requests read as JSON lines from stdin (one per line, already
//! signature-verified upstream):
//!
//! `{"operation": {...}, "writes": [{"contract_slot_index": 5, ...}]}`

use anyhow::Result;
use clap::Parser;
use rollup_core::{
    AggregatorConfig, AppendOutcome, BlockAggregator, Operation, StorageWrite, TransitionLog,
};
use serde::Deserialize;
use settlement_bridge::{LoggingSubmitter, RetryPolicy, RetryingSubmitter, SubmissionWorker};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// One pending transition as delivered by the operation source
#[derive(Debug, Deserialize)]
struct TransitionRequest {
    operation: Operation,
    #[serde(default)]
    writes: Vec<StorageWrite>,
}

/// Rollup block aggregator
#[derive(Parser, Debug)]
#[command(name = "rollup-aggregator")]
#[command(about = "Aggregates state transitions into blocks and commits them to the settlement layer", long_about = None)]
struct Args {
    /// Data directory for the durable log
    #[arg(long, default_value = "./data")]
    db_path: PathBuf,

    /// Commit a block once it holds this many transitions
    #[arg(long, default_value = "100")]
    max_transitions_per_block: usize,

    /// Commit a non-empty block after this much idle time (ms)
    #[arg(long, default_value = "30000")]
    max_idle_ms: u64,

    /// Submission attempts before giving up on a block
    #[arg(long, default_value = "5")]
    submit_attempts: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting rollup aggregator");
    tracing::info!("  Data directory: {:?}", args.db_path);
    tracing::info!(
        "  Block cap: {} transitions, idle limit: {}ms",
        args.max_transitions_per_block,
        args.max_idle_ms
    );

    std::fs::create_dir_all(&args.db_path)?;
    let log = Arc::new(TransitionLog::open(&args.db_path)?);

    let config = AggregatorConfig {
        max_transitions_per_block: args.max_transitions_per_block,
        max_idle: Duration::from_millis(args.max_idle_ms),
    };
    let (aggregator, sealed_rx) = BlockAggregator::open(log.clone(), config)?;

    tracing::info!(
        "Recovered pending block {} with {} transitions, state root {}",
        aggregator.block_number(),
        aggregator.size(),
        aggregator.current_root()
    );

    // Submission runs in its own task so a slow settlement layer never
    // blocks acceptance of new operations
    let submitter = RetryingSubmitter::new(
        LoggingSubmitter::new(),
        RetryPolicy {
            max_attempts: args.submit_attempts,
            ..Default::default()
        },
    );
    let worker = tokio::spawn(SubmissionWorker::new(submitter, sealed_rx).run());

    aggregator.start().await?;

    tracing::info!("Aggregator running; reading transition requests from stdin");
    tracing::info!("Press Ctrl+C to stop.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) if line.trim().is_empty() => {}
                    Some(line) => {
                        let request: TransitionRequest = match serde_json::from_str(&line) {
                            Ok(request) => request,
                            Err(err) => {
                                tracing::warn!(error = %err, "Discarding malformed transition request");
                                continue;
                            }
                        };
                        match aggregator
                            .append_operation(request.operation, request.writes)
                            .await
                        {
                            Ok(AppendOutcome::Appended { sequence_number }) => {
                                tracing::debug!(
                                    sequence_number,
                                    block_number = aggregator.block_number(),
                                    "Transition accepted"
                                );
                            }
                            Ok(AppendOutcome::Duplicate) => {}
                            Err(err) => {
                                tracing::error!(error = %err, "Transition handling failed");
                            }
                        }
                    }
                    None => {
                        tracing::info!("Operation source closed");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down...");
                break;
            }
        }
    }

    // Final durability barrier before shutdown
    log.flush()?;
    worker.abort();

    tracing::info!(
        "Aggregator stopped at pending block {} with {} transitions",
        aggregator.block_number(),
        aggregator.size()
    );

    Ok(())
}
