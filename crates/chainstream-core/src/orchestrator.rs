//! Stream orchestrator — one ingestion session: backfill, then live tailing
//! under a liveness watchdog.
//!
//! ```text
//! Idle ──▶ Backfilling ──▶ Live ──▶ Stopping ──▶ Stopped
//!               │            │
//!               └────────────┴──▶ Errored
//! ```
//!
//! The live tailer and the watchdog run as separate tasks that report into a
//! single channel. Whichever reports first decides the outcome; teardown
//! (unsubscribe, stop the watchdog, abort stragglers after the grace period)
//! runs on every exit path. Before the watchdog starts, the head snapshot and
//! the subscribe call are each bounded by the watchdog interval instead.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::backfill::Backfiller;
use crate::config::StreamConfig;
use crate::error::StreamError;
use crate::extract::EventExtractor;
use crate::handler::{BatchHandler, Dispatcher};
use crate::live::LiveTailer;
use crate::progress::{HeightTracker, Mark};
use crate::source::NodeSource;
use crate::types::Height;
use crate::watchdog::Watchdog;

/// Lifecycle of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Backfilling,
    Live,
    Stopping,
    Stopped,
    Errored,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Backfilling => "backfilling",
            Self::Live => "live",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Errored => "errored",
        };
        f.write_str(s)
    }
}

/// What a session did before it stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub start_height: Height,
    /// Chain head snapshot the backfill ran to; `None` when backfill was skipped.
    pub backfill_target: Option<Height>,
    pub last_dispatched: Option<Height>,
    pub batches_dispatched: u64,
    pub state: SessionState,
}

/// Exit report of a background session task.
type TaskExit = (&'static str, Result<(), StreamError>);

/// Runs one session against a node source.
///
/// The orchestrator never retries: a failed session returns its error and a
/// new orchestrator must be built for the next attempt.
pub struct Orchestrator {
    extractor: EventExtractor,
    backfiller: Backfiller,
    dispatcher: Dispatcher,
    watchdog_interval: Duration,
    shutdown_grace: Duration,
    state: watch::Sender<SessionState>,
}

impl Orchestrator {
    pub fn new(
        source: Arc<dyn NodeSource>,
        config: &StreamConfig,
        handler: Arc<dyn BatchHandler>,
    ) -> Result<Self, StreamError> {
        config.validate()?;
        let extractor = EventExtractor::new(source, config.event_filter()?);
        let backfiller = Backfiller::new(
            extractor.clone(),
            config.backfill_chunk_size,
            config.backfill_concurrency,
        );
        let (state, _) = watch::channel(SessionState::Idle);
        Ok(Self {
            extractor,
            backfiller,
            dispatcher: Dispatcher::new(handler, HeightTracker::new()),
            watchdog_interval: config.watchdog_interval(),
            shutdown_grace: config.shutdown_grace(),
            state,
        })
    }

    /// Observe state transitions.
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Shared view of observed and dispatched heights.
    pub fn progress(&self) -> HeightTracker {
        self.dispatcher.tracker().clone()
    }

    /// Run the session starting at `start` until `shutdown` fires or it fails.
    ///
    /// A start of `0` skips backfill and tails from the chain head. Shutdown
    /// ends in `Ok` with state [`SessionState::Stopped`]; any failure ends in
    /// `Err` with state [`SessionState::Errored`].
    pub async fn run(
        self,
        start: Height,
        shutdown: CancellationToken,
    ) -> Result<SessionSummary, StreamError> {
        let session = shutdown.child_token();
        let mut tasks = JoinSet::new();
        let mut backfill_target = None;

        tracing::info!(start, source = self.extractor.source().name(), "session starting");
        let outcome = self
            .drive(start, &session, &mut tasks, &mut backfill_target)
            .await;

        let final_state = match &outcome {
            Ok(()) => {
                self.transition(SessionState::Stopping);
                SessionState::Stopped
            }
            Err(e) => {
                tracing::error!(error = %e, "session failed");
                self.transition(SessionState::Errored);
                SessionState::Errored
            }
        };

        self.teardown(&session, tasks).await;
        if final_state == SessionState::Stopped {
            self.transition(SessionState::Stopped);
        }

        let progress = self.dispatcher.tracker().snapshot();
        let summary = SessionSummary {
            start_height: start,
            backfill_target,
            last_dispatched: progress.last_dispatched,
            batches_dispatched: progress.batches_dispatched,
            state: final_state,
        };
        tracing::info!(
            state = %summary.state,
            last_dispatched = ?summary.last_dispatched,
            batches = summary.batches_dispatched,
            "session ended"
        );
        outcome.map(|()| summary)
    }

    /// Backfill to the head snapshot, then start the live tasks and wait for
    /// the first report. `Ok` means shutdown was requested.
    async fn drive(
        &self,
        start: Height,
        session: &CancellationToken,
        tasks: &mut JoinSet<()>,
        backfill_target: &mut Option<Height>,
    ) -> Result<(), StreamError> {
        let source = self.extractor.source();
        self.transition(SessionState::Backfilling);

        let head = tokio::select! {
            biased;
            _ = session.cancelled() => return Ok(()),
            head = self.within_interval(source.latest_height()) => head?,
        };
        self.dispatcher.tracker().record(head, Mark::Observed);

        // No start height: nothing to catch up on, tail from the head.
        let live_from = if start == 0 {
            0
        } else {
            if start <= head {
                *backfill_target = Some(head);
            }
            let report = self
                .backfiller
                .run(start, head, &self.dispatcher, session)
                .await?;
            if report.cancelled {
                return Ok(());
            }
            report.next_height
        };

        let subscription = tokio::select! {
            biased;
            _ = session.cancelled() => return Ok(()),
            sub = self.within_interval(source.subscribe_new_blocks()) => sub?,
        };
        self.transition(SessionState::Live);

        let (events_tx, mut events) = mpsc::channel::<TaskExit>(2);
        let tailer = LiveTailer::new(self.extractor.clone(), self.backfiller.clone(), live_from);
        spawn_reporting(
            tasks,
            events_tx.clone(),
            "live tailer",
            tailer.run(subscription, self.dispatcher.clone(), session.clone()),
        );
        let watchdog = Watchdog::new(self.dispatcher.tracker().clone(), self.watchdog_interval);
        spawn_reporting(tasks, events_tx, "watchdog", watchdog.run(session.clone()));

        tokio::select! {
            biased;
            _ = session.cancelled() => Ok(()),
            exit = events.recv() => match exit {
                Some((_, Err(e))) => Err(e),
                Some((task, Ok(()))) => Err(StreamError::Aborted {
                    reason: format!("{task} exited without a shutdown request"),
                }),
                None => Err(StreamError::Aborted {
                    reason: "session tasks ended without reporting".into(),
                }),
            },
        }
    }

    /// Bound a node call made before the watchdog is running.
    async fn within_interval<T>(
        &self,
        call: impl Future<Output = Result<T, StreamError>>,
    ) -> Result<T, StreamError> {
        match time::timeout(self.watchdog_interval, call).await {
            Ok(result) => result,
            Err(_) => Err(StreamError::Stale {
                height: self.dispatcher.tracker().highest_observed().unwrap_or(0),
                idle_ms: self.watchdog_interval.as_millis() as u64,
            }),
        }
    }

    async fn teardown(&self, session: &CancellationToken, mut tasks: JoinSet<()>) {
        session.cancel();
        let drained = time::timeout(self.shutdown_grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                grace_ms = self.shutdown_grace.as_millis() as u64,
                "session tasks did not stop in time, aborting"
            );
            tasks.abort_all();
        }
    }

    fn transition(&self, next: SessionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            tracing::info!(from = %prev, to = %next, "session state");
        }
    }
}

/// Spawn `fut` into `tasks`, reporting its result (or panic) on `events`.
fn spawn_reporting<F>(
    tasks: &mut JoinSet<()>,
    events: mpsc::Sender<TaskExit>,
    task: &'static str,
    fut: F,
) where
    F: Future<Output = Result<(), StreamError>> + Send + 'static,
{
    tasks.spawn(async move {
        let result = match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(StreamError::Aborted {
                reason: format!("{task} panicked"),
            }),
        };
        if let Err(e) = &result {
            tracing::warn!(task, error = %e, "session task failed");
        }
        let _ = events.send((task, result)).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfigBuilder;
    use crate::testing::{CollectingHandler, FixtureNode};
    use tokio::time::Instant;

    fn config() -> StreamConfig {
        StreamConfigBuilder::new()
            .backfill_chunk_size(4)
            .backfill_concurrency(2)
            .build()
            .unwrap()
    }

    async fn reach(rx: &mut watch::Receiver<SessionState>, want: SessionState) {
        while *rx.borrow_and_update() != want {
            rx.changed().await.unwrap();
        }
    }

    #[tokio::test]
    async fn backfills_then_tails_until_shutdown() {
        let node = Arc::new(FixtureNode::new(10));
        node.add_event(3, "transfer", &[]);
        node.add_event(7, "transfer", &[]);
        node.add_event(11, "transfer", &[]);
        let handler = Arc::new(CollectingHandler::new());

        let orch = Orchestrator::new(node.clone(), &config(), handler.clone()).unwrap();
        let mut state = orch.state();
        let shutdown = CancellationToken::new();
        let session = tokio::spawn(orch.run(1, shutdown.clone()));

        reach(&mut state, SessionState::Live).await;
        assert_eq!(handler.heights(), vec![3, 7]);

        node.produce_block().await;
        handler.wait_for(3).await;

        shutdown.cancel();
        let summary = session.await.unwrap().unwrap();
        assert_eq!(summary.state, SessionState::Stopped);
        assert_eq!(summary.backfill_target, Some(10));
        assert_eq!(summary.last_dispatched, Some(11));
        assert_eq!(summary.batches_dispatched, 3);
        assert_eq!(*state.borrow(), SessionState::Stopped);
        assert_eq!(node.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn zero_start_tails_from_head() {
        let node = Arc::new(FixtureNode::new(10));
        node.add_event(4, "transfer", &[]);
        node.add_event(11, "transfer", &[]);
        let handler = Arc::new(CollectingHandler::new());

        let orch = Orchestrator::new(node.clone(), &config(), handler.clone()).unwrap();
        let mut state = orch.state();
        let shutdown = CancellationToken::new();
        let session = tokio::spawn(orch.run(0, shutdown.clone()));

        reach(&mut state, SessionState::Live).await;
        node.produce_block().await;
        handler.wait_for(1).await;
        shutdown.cancel();

        let summary = session.await.unwrap().unwrap();
        assert_eq!(summary.backfill_target, None);
        assert_eq!(handler.heights(), vec![11]);
        assert!(node.meta_queries().is_empty());
    }

    #[tokio::test]
    async fn start_beyond_head_waits_for_start_height() {
        let node = Arc::new(FixtureNode::new(10));
        node.add_event(12, "transfer", &[]);
        node.add_event(14, "transfer", &[]);
        let handler = Arc::new(CollectingHandler::new());

        let orch = Orchestrator::new(node.clone(), &config(), handler.clone()).unwrap();
        let mut state = orch.state();
        let shutdown = CancellationToken::new();
        let session = tokio::spawn(orch.run(13, shutdown.clone()));

        reach(&mut state, SessionState::Live).await;
        for _ in 0..4 {
            node.produce_block().await;
        }
        handler.wait_for(1).await;
        shutdown.cancel();
        session.await.unwrap().unwrap();
        assert_eq!(handler.heights(), vec![14]);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_feed_errors_within_two_intervals() {
        let node = Arc::new(FixtureNode::new(100));
        node.add_event(98, "transfer", &[]);
        let handler = Arc::new(CollectingHandler::new());
        let cfg = config();

        let orch = Orchestrator::new(node.clone(), &cfg, handler.clone()).unwrap();
        let mut state = orch.state();
        let shutdown = CancellationToken::new();
        let session = tokio::spawn(orch.run(95, shutdown));

        reach(&mut state, SessionState::Live).await;
        let live_at = Instant::now();
        let err = session.await.unwrap().unwrap_err();

        assert!(matches!(err, StreamError::Stale { height: 100, .. }));
        assert!(live_at.elapsed() <= cfg.watchdog_interval() * 2);
        assert_eq!(*state.borrow(), SessionState::Errored);
        assert_eq!(node.active_subscriptions(), 0);
        assert_eq!(handler.heights(), vec![98]);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_subscribe_errors_as_stale() {
        let node = Arc::new(FixtureNode::new(10));
        node.add_event(4, "transfer", &[]);
        node.hang_subscribe(true);
        let handler = Arc::new(CollectingHandler::new());
        let cfg = config();

        let orch = Orchestrator::new(node.clone(), &cfg, handler.clone()).unwrap();
        let state = orch.state();
        let started = Instant::now();
        let err = orch.run(1, CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, StreamError::Stale { height: 10, .. }));
        assert!(started.elapsed() <= cfg.watchdog_interval());
        assert_eq!(*state.borrow(), SessionState::Errored);
        assert_eq!(handler.heights(), vec![4]);
    }

    #[tokio::test]
    async fn node_failure_during_backfill_errors() {
        let node = Arc::new(FixtureNode::new(20));
        node.add_event(6, "transfer", &[]);
        node.fail_results_at(6);
        let handler = Arc::new(CollectingHandler::new());

        let orch = Orchestrator::new(node.clone(), &config(), handler.clone()).unwrap();
        let state = orch.state();
        let err = orch.run(1, CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, StreamError::Transport(_)));
        assert_eq!(*state.borrow(), SessionState::Errored);
        assert_eq!(node.active_subscriptions(), 0);
        assert!(handler.heights().is_empty());
    }

    #[tokio::test]
    async fn subscribe_failure_errors() {
        let node = Arc::new(FixtureNode::new(5));
        node.fail_subscribe(true);
        let orch = Orchestrator::new(node, &config(), Arc::new(CollectingHandler::new())).unwrap();
        let state = orch.state();

        let err = orch.run(1, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, StreamError::Transport(_)));
        assert_eq!(*state.borrow(), SessionState::Errored);
    }

    #[tokio::test]
    async fn handler_failure_in_live_errors() {
        let node = Arc::new(FixtureNode::new(5));
        node.add_event(6, "transfer", &[]);
        let handler = Arc::new(CollectingHandler::failing_at(6));

        let orch = Orchestrator::new(node.clone(), &config(), handler).unwrap();
        let mut state = orch.state();
        let session = tokio::spawn(orch.run(1, CancellationToken::new()));

        reach(&mut state, SessionState::Live).await;
        node.produce_block().await;
        let err = session.await.unwrap().unwrap_err();
        assert!(matches!(err, StreamError::Handler { height: 6, .. }));
        assert_eq!(node.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn shutdown_interrupts_backfill() {
        let node = Arc::new(FixtureNode::new(1_000));
        node.add_event(500, "transfer", &[]);
        node.set_meta_delay_fn(|_| Duration::from_secs(3_600));
        let handler = Arc::new(CollectingHandler::new());

        let orch = Orchestrator::new(node.clone(), &config(), handler.clone()).unwrap();
        let mut state = orch.state();
        let shutdown = CancellationToken::new();
        let session = tokio::spawn(orch.run(1, shutdown.clone()));

        reach(&mut state, SessionState::Backfilling).await;
        shutdown.cancel();
        let summary = session.await.unwrap().unwrap();

        assert_eq!(summary.state, SessionState::Stopped);
        assert_eq!(summary.batches_dispatched, 0);
        assert!(handler.heights().is_empty());
        assert_eq!(node.active_subscriptions(), 0);
    }
}
