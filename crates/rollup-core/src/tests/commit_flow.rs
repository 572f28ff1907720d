//! Commit trigger and scheduling tests

use super::{open, transfer, write, IDLE_NEVER_MS};
use crate::aggregator::CommitOutcome;
use crate::error::{AggregatorError, CommitError, TrieUpdateError};
use crate::pending::AppendOutcome;
use tempfile::tempdir;
use tokio::time::Duration;

#[tokio::test]
async fn test_size_trigger_commits_exactly_once() {
    let dir = tempdir().unwrap();
    let (aggregator, mut sealed_rx, _log) = open(dir.path(), 3, IDLE_NEVER_MS);
    aggregator.start().await.unwrap();

    for i in 0..2u64 {
        aggregator
            .append_operation(transfer(10 + i), vec![write(5, i, b"x")])
            .await
            .unwrap();
    }
    assert!(sealed_rx.try_recv().is_err());
    assert_eq!(aggregator.block_number(), 1);

    aggregator
        .append_operation(transfer(99), vec![write(7, 0, b"y")])
        .await
        .unwrap();

    let sealed = sealed_rx.try_recv().unwrap();
    assert_eq!(sealed.block_number, 1);
    assert_eq!(sealed.operations.len(), 3);
    assert!(sealed_rx.try_recv().is_err(), "exactly one commit expected");

    assert_eq!(aggregator.block_number(), 2);
    assert_eq!(aggregator.size(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_idle_trigger_commits_waiting_transition() {
    let dir = tempdir().unwrap();
    let (aggregator, mut sealed_rx, _log) = open(dir.path(), 1000, 1_000);
    aggregator.start().await.unwrap();

    aggregator
        .append_operation(transfer(1), vec![write(5, 0, b"a")])
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1_100)).await;

    let sealed = sealed_rx.try_recv().unwrap();
    assert_eq!(sealed.block_number, 1);
    assert_eq!(sealed.operations.len(), 1);
    assert!(sealed_rx.try_recv().is_err());
    assert_eq!(aggregator.block_number(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_idle_timer_never_commits_empty_block() {
    let dir = tempdir().unwrap();
    let (aggregator, mut sealed_rx, _log) = open(dir.path(), 1000, 1_000);
    aggregator.start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(sealed_rx.try_recv().is_err());

    // Several idle periods elapse with nothing pending; the timer keeps
    // re-arming without ever committing.
    tokio::time::sleep(Duration::from_millis(5_000)).await;
    assert!(sealed_rx.try_recv().is_err());
    assert_eq!(aggregator.block_number(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_idle_window_resets_after_size_commit() {
    let dir = tempdir().unwrap();
    let (aggregator, mut sealed_rx, _log) = open(dir.path(), 2, 1_000);
    aggregator.start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(900)).await;
    aggregator
        .append_operation(transfer(1), vec![write(1, 0, b"a")])
        .await
        .unwrap();
    aggregator
        .append_operation(transfer(2), vec![write(1, 1, b"b")])
        .await
        .unwrap();
    assert_eq!(sealed_rx.try_recv().unwrap().block_number, 1);

    // A transition appended right after the size commit waits for a full
    // idle interval, not the remainder of the old one.
    aggregator
        .append_operation(transfer(3), vec![write(1, 2, b"c")])
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(sealed_rx.try_recv().is_err());
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(sealed_rx.try_recv().unwrap().block_number, 2);
}

#[tokio::test]
async fn test_duplicate_append_is_soft_noop() {
    let dir = tempdir().unwrap();
    let (aggregator, mut sealed_rx, log) = open(dir.path(), 10, IDLE_NEVER_MS);
    aggregator.start().await.unwrap();

    aggregator
        .append_operation(transfer(1), vec![write(5, 0, b"a")])
        .await
        .unwrap();
    let outcome = aggregator
        .append_operation(transfer(1), vec![write(5, 0, b"a")])
        .await
        .unwrap();

    assert_eq!(outcome, AppendOutcome::Duplicate);
    assert_eq!(aggregator.size(), 1);
    assert_eq!(log.transaction_count().unwrap(), Some(1));
    assert_eq!(log.transition(2).unwrap(), None);
    assert!(sealed_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_block_numbers_monotonic_and_gapless() {
    let dir = tempdir().unwrap();
    let (aggregator, mut sealed_rx, _log) = open(dir.path(), 2, IDLE_NEVER_MS);
    aggregator.start().await.unwrap();

    for i in 0..6u64 {
        aggregator
            .append_operation(transfer(100 + i), vec![write(i % 4, i, b"v")])
            .await
            .unwrap();
    }

    let mut numbers = Vec::new();
    while let Ok(sealed) = sealed_rx.try_recv() {
        assert_eq!(sealed.operations.len(), 2);
        numbers.push(sealed.block_number);
    }
    assert_eq!(numbers, vec![1, 2, 3]);
    assert_eq!(aggregator.block_number(), 4);
}

#[tokio::test]
async fn test_scenario_three_transitions() {
    let dir = tempdir().unwrap();
    let (aggregator, mut sealed_rx, _log) = open(dir.path(), 3, IDLE_NEVER_MS);
    aggregator.start().await.unwrap();

    let ops = [
        (transfer(1), write(5, 0, b"a".as_ref())),
        (transfer(2), write(5, 1, b"b".as_ref())),
        (transfer(3), write(7, 0, b"c".as_ref())),
    ];
    for (op, w) in &ops {
        aggregator
            .append_operation(op.clone(), vec![w.clone()])
            .await
            .unwrap();
    }

    let sealed = sealed_rx.try_recv().unwrap();
    assert_eq!(sealed.block_number, 1);
    assert_eq!(
        sealed.operations,
        ops.iter().map(|(op, _)| op.clone()).collect::<Vec<_>>()
    );

    let root = aggregator.current_root();
    assert_eq!(sealed.state_root, root);

    let proof = aggregator.prove_storage(5, 0).unwrap();
    assert_eq!(proof.value(), b"a");
    assert!(proof.verify(&root));

    assert_eq!(aggregator.block_number(), 2);
    let pending = aggregator.pending_block().await;
    assert_eq!(pending.block_number, 2);
    assert!(pending.transitions.is_empty());
}

#[tokio::test]
async fn test_failed_fold_requeues_transitions() {
    let dir = tempdir().unwrap();
    let (aggregator, mut sealed_rx, log) = open(dir.path(), 2, IDLE_NEVER_MS);
    aggregator.start().await.unwrap();

    aggregator
        .append_operation(transfer(1), vec![write(5, 0, b"a")])
        .await
        .unwrap();

    // The second append fills the block; its out-of-range contract slot
    // makes the fold fail after the append was durably accepted.
    let err = aggregator
        .append_operation(transfer(2), vec![write(1 << 40, 0, b"boom")])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AggregatorError::Commit(CommitError::Trie(TrieUpdateError::KeyOutOfRange { .. }))
    ));

    // Nothing was sealed and the accepted transitions are preserved
    assert!(sealed_rx.try_recv().is_err());
    assert_eq!(aggregator.block_number(), 1);
    assert_eq!(aggregator.size(), 2);
    assert_eq!(log.transaction_count().unwrap(), Some(2));

    // A later manual attempt fails the same way but keeps the block
    let err = aggregator.try_commit().await.unwrap_err();
    assert!(matches!(err, CommitError::Trie(_)));
    assert_eq!(aggregator.size(), 2);
}

#[tokio::test]
async fn test_try_commit_defers_below_cap() {
    let dir = tempdir().unwrap();
    let (aggregator, mut sealed_rx, _log) = open(dir.path(), 10, IDLE_NEVER_MS);
    aggregator.start().await.unwrap();

    aggregator
        .append_operation(transfer(1), vec![write(5, 0, b"a")])
        .await
        .unwrap();

    let outcome = aggregator.try_commit().await.unwrap();
    assert_eq!(outcome, CommitOutcome::Deferred);
    assert!(sealed_rx.try_recv().is_err());
    assert_eq!(aggregator.size(), 1);
}
