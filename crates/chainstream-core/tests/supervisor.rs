//! Supervisor behaviour across sessions: lock exclusivity, checkpoint
//! advancement and resume, and failure handling.

use std::sync::Arc;
use std::time::Duration;

use futures::future::{self, Either};
use tokio::time::Instant;

use chainstream_core::testing::{CollectingHandler, FixtureNode, FlakyCheckpointStore};
use chainstream_core::{
    CancellationToken, CheckpointStore, MemoryCheckpointStore, MemoryLockRegistry, StreamConfig,
    StreamConfigBuilder, StreamError, Supervisor, TickOutcome,
};

fn config(epoch: u64) -> StreamConfig {
    StreamConfigBuilder::new()
        .stream_id("hub")
        .lock_name("hub-lock")
        .epoch_height(epoch)
        .backfill_chunk_size(5)
        .backfill_concurrency(3)
        .build()
        .unwrap()
}

fn supervisor(
    node: &Arc<FixtureNode>,
    handler: &Arc<CollectingHandler>,
    store: Arc<dyn CheckpointStore>,
    locks: &Arc<MemoryLockRegistry>,
    config: StreamConfig,
) -> Arc<Supervisor> {
    Arc::new(
        Supervisor::new(node.clone(), handler.clone(), store, locks.clone(), config).unwrap(),
    )
}

/// Run one tick in the background until `n` batches were handled, then stop it.
async fn tick_until(sup: Arc<Supervisor>, handler: &CollectingHandler, n: usize) -> TickOutcome {
    let shutdown = CancellationToken::new();
    let task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { sup.tick(&shutdown).await })
    };
    handler.wait_for(n).await;
    shutdown.cancel();
    task.await.unwrap().unwrap()
}

#[tokio::test]
async fn only_one_of_two_replicas_runs_a_session() {
    let node = Arc::new(FixtureNode::new(10));
    node.add_event(3, "transfer", &[]);
    let locks = Arc::new(MemoryLockRegistry::new());
    let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
    let handler_a = Arc::new(CollectingHandler::new());
    let handler_b = Arc::new(CollectingHandler::new());
    let replica = |handler: &Arc<CollectingHandler>, owner: &str| {
        let sup = Supervisor::new(
            node.clone(),
            handler.clone(),
            store.clone(),
            locks.clone(),
            config(1),
        )
        .unwrap();
        Arc::new(sup.with_owner(owner))
    };
    let (a, b) = (replica(&handler_a, "replica-a"), replica(&handler_b, "replica-b"));

    let shutdown = CancellationToken::new();
    let spawn = |sup: Arc<Supervisor>| {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { sup.tick(&shutdown).await })
    };
    let (ta, tb) = (spawn(a), spawn(b));

    let (first, running) = match future::select(ta, tb).await {
        Either::Left((done, other)) => (done, other),
        Either::Right((done, other)) => (done, other),
    };
    assert_eq!(first.unwrap().unwrap(), TickOutcome::Skipped);

    shutdown.cancel();
    let outcome = running.await.unwrap().unwrap();
    assert!(matches!(outcome, TickOutcome::Completed(_)));

    let sessions = [handler_a.heights(), handler_b.heights()];
    assert_eq!(sessions.iter().filter(|h| !h.is_empty()).count(), 1);
    assert!(!locks.is_held("hub-lock"));
}

#[tokio::test]
async fn checkpoint_tracks_last_dispatched_height() {
    let node = Arc::new(FixtureNode::new(30));
    for h in [4, 9, 17, 23, 30] {
        node.add_event(h, "transfer", &[]);
    }
    let locks = Arc::new(MemoryLockRegistry::new());
    let store = Arc::new(MemoryCheckpointStore::new());
    let handler = Arc::new(CollectingHandler::new());
    let sup = supervisor(&node, &handler, store.clone(), &locks, config(1));

    let outcome = tick_until(sup, &handler, 5).await;

    let summary = match outcome {
        TickOutcome::Completed(summary) => summary,
        other => panic!("expected a completed session, got {other:?}"),
    };
    assert_eq!(summary.last_dispatched, Some(30));
    assert_eq!(store.get("hub").await.unwrap(), Some(30));
    assert!(!locks.is_held("hub-lock"));
}

#[tokio::test]
async fn next_session_resumes_at_checkpoint() {
    let node = Arc::new(FixtureNode::new(10));
    node.add_event(4, "transfer", &[]);
    node.add_event(8, "transfer", &[]);
    let locks = Arc::new(MemoryLockRegistry::new());
    let store = Arc::new(MemoryCheckpointStore::new());

    let first = Arc::new(CollectingHandler::new());
    let sup = supervisor(&node, &first, store.clone(), &locks, config(1));
    tick_until(sup, &first, 2).await;
    assert_eq!(first.heights(), vec![4, 8]);

    node.add_event(12, "transfer", &[]);
    node.produce_block().await;
    node.produce_block().await;

    let second = Arc::new(CollectingHandler::new());
    let sup = supervisor(&node, &second, store.clone(), &locks, config(1));
    tick_until(sup, &second, 2).await;

    // The checkpoint height itself is delivered again.
    assert_eq!(second.heights(), vec![8, 12]);
    assert_eq!(store.get("hub").await.unwrap(), Some(12));
}

#[tokio::test]
async fn checkpoint_write_failure_aborts_session() {
    let node = Arc::new(FixtureNode::new(10));
    node.add_event(3, "transfer", &[]);
    node.add_event(7, "transfer", &[]);
    let locks = Arc::new(MemoryLockRegistry::new());
    let store = Arc::new(FlakyCheckpointStore::new());
    store.fail_writes(true);
    let handler = Arc::new(CollectingHandler::new());
    let sup = supervisor(&node, &handler, store.clone(), &locks, config(1));

    let err = sup.tick(&CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, StreamError::CheckpointWrite { height: 3, .. }));
    assert_eq!(handler.heights(), vec![3]);
    assert_eq!(store.get("hub").await.unwrap(), None);
    assert!(!locks.is_held("hub-lock"));
}

#[tokio::test]
async fn handler_failure_leaves_checkpoint_behind() {
    let node = Arc::new(FixtureNode::new(10));
    node.add_event(3, "transfer", &[]);
    node.add_event(7, "transfer", &[]);
    let locks = Arc::new(MemoryLockRegistry::new());
    let store = Arc::new(MemoryCheckpointStore::new());
    let handler = Arc::new(CollectingHandler::failing_at(7));
    let sup = supervisor(&node, &handler, store.clone(), &locks, config(1));

    let err = sup.tick(&CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, StreamError::Handler { height: 7, .. }));
    assert_eq!(store.get("hub").await.unwrap(), Some(3));
    assert!(!locks.is_held("hub-lock"));
}

#[tokio::test(start_paused = true)]
async fn stalled_node_ends_session_with_stale_error() {
    let node = Arc::new(FixtureNode::new(100));
    node.add_event(96, "transfer", &[]);
    let locks = Arc::new(MemoryLockRegistry::new());
    let handler = Arc::new(CollectingHandler::new());
    let cfg = StreamConfigBuilder::new()
        .lock_name("hub-lock")
        .epoch_height(90)
        .watchdog_interval(Duration::from_secs(30))
        .build()
        .unwrap();
    let interval = cfg.watchdog_interval();
    let sup = supervisor(&node, &handler, Arc::new(MemoryCheckpointStore::new()), &locks, cfg);

    let started = Instant::now();
    let err = sup.tick(&CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, StreamError::Stale { height: 100, .. }));
    assert!(started.elapsed() <= interval * 2);
    assert_eq!(handler.heights(), vec![96]);
    assert_eq!(node.active_subscriptions(), 0);
    assert!(!locks.is_held("hub-lock"));
}

#[tokio::test(start_paused = true)]
async fn scheduler_retries_after_failure() {
    let node = Arc::new(FixtureNode::new(10));
    node.add_event(5, "transfer", &[]);
    node.fail_latest_height(true);
    let locks = Arc::new(MemoryLockRegistry::new());
    let handler = Arc::new(CollectingHandler::new());
    let cfg = StreamConfigBuilder::new()
        .lock_name("hub-lock")
        .epoch_height(1)
        .schedule_interval(Duration::from_secs(10))
        .build()
        .unwrap();
    let sup = supervisor(&node, &handler, Arc::new(MemoryCheckpointStore::new()), &locks, cfg);

    let shutdown = CancellationToken::new();
    let scheduler = {
        let sup = sup.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { sup.run_scheduled(shutdown).await })
    };

    // First tick fails on the status query; the node recovers before the next.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(handler.heights().is_empty());
    node.fail_latest_height(false);

    handler.wait_for(1).await;
    assert_eq!(handler.heights(), vec![5]);
    shutdown.cancel();
    scheduler.await.unwrap();
    assert!(!locks.is_held("hub-lock"));
}

#[tokio::test(start_paused = true)]
async fn hung_subscribe_ends_session_and_releases_lock() {
    let node = Arc::new(FixtureNode::new(10));
    node.add_event(5, "transfer", &[]);
    node.hang_subscribe(true);
    let locks = Arc::new(MemoryLockRegistry::new());
    let handler = Arc::new(CollectingHandler::new());
    let cfg = StreamConfigBuilder::new()
        .lock_name("hub-lock")
        .epoch_height(1)
        .watchdog_interval(Duration::from_secs(30))
        .build()
        .unwrap();
    let interval = cfg.watchdog_interval();
    let sup = supervisor(&node, &handler, Arc::new(MemoryCheckpointStore::new()), &locks, cfg);

    let started = Instant::now();
    let err = sup.tick(&CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, StreamError::Stale { height: 10, .. }));
    assert!(started.elapsed() <= interval * 2);
    assert_eq!(handler.heights(), vec![5]);
    assert!(!locks.is_held("hub-lock"));
}

#[tokio::test]
async fn panicking_handler_during_backfill_releases_lock() {
    let node = Arc::new(FixtureNode::new(10));
    node.add_event(3, "transfer", &[]);
    let locks = Arc::new(MemoryLockRegistry::new());
    let store = Arc::new(MemoryCheckpointStore::new());
    let handler = Arc::new(CollectingHandler::panicking_at(3));
    let sup = supervisor(&node, &handler, store.clone(), &locks, config(1));

    let err = sup.tick(&CancellationToken::new()).await.unwrap_err();

    match err {
        StreamError::Aborted { reason } => assert!(reason.contains("panic"), "{reason}"),
        other => panic!("expected an aborted session, got {other:?}"),
    }
    assert_eq!(store.get("hub").await.unwrap(), None);
    assert_eq!(node.active_subscriptions(), 0);
    assert!(!locks.is_held("hub-lock"));
}

#[tokio::test]
async fn panicking_handler_during_live_releases_lock() {
    let node = Arc::new(FixtureNode::new(10));
    node.add_event(4, "transfer", &[]);
    node.add_event(11, "transfer", &[]);
    let locks = Arc::new(MemoryLockRegistry::new());
    let handler = Arc::new(CollectingHandler::panicking_at(11));
    let sup = supervisor(&node, &handler, Arc::new(MemoryCheckpointStore::new()), &locks, config(1));

    let task = tokio::spawn(async move { sup.tick(&CancellationToken::new()).await });
    handler.wait_for(1).await;
    while node.active_subscriptions() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    node.produce_block().await;

    let err = task.await.unwrap().unwrap_err();
    match err {
        StreamError::Aborted { reason } => assert_eq!(reason, "live tailer panicked"),
        other => panic!("expected an aborted session, got {other:?}"),
    }
    assert_eq!(handler.heights(), vec![4]);
    assert_eq!(node.active_subscriptions(), 0);
    assert!(!locks.is_held("hub-lock"));
}
