//! Consumer supervisor — the scheduled entry point.
//!
//! Each tick tries the stream lock without waiting. The replica that gets it
//! resumes from the stored checkpoint and runs one orchestrator session to
//! completion; the others skip. Failures are logged and left to the next
//! scheduled tick, which resumes from the checkpoint.

use std::sync::Arc;

use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::checkpoint::{CheckpointManager, CheckpointStore};
use crate::config::StreamConfig;
use crate::error::StreamError;
use crate::handler::{BatchHandler, CheckpointingHandler};
use crate::lock::{LockGuard, LockRegistry};
use crate::orchestrator::{Orchestrator, SessionSummary};
use crate::source::NodeSource;

/// Result of one supervisor tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Ingestion is switched off in the configuration.
    Disabled,
    /// Another replica holds the lock.
    Skipped,
    /// This replica ran a session to its end.
    Completed(SessionSummary),
}

pub struct Supervisor {
    source: Arc<dyn NodeSource>,
    handler: Arc<dyn BatchHandler>,
    checkpoints: Arc<dyn CheckpointStore>,
    locks: Arc<dyn LockRegistry>,
    config: StreamConfig,
    owner: String,
}

impl Supervisor {
    pub fn new(
        source: Arc<dyn NodeSource>,
        handler: Arc<dyn BatchHandler>,
        checkpoints: Arc<dyn CheckpointStore>,
        locks: Arc<dyn LockRegistry>,
        config: StreamConfig,
    ) -> Result<Self, StreamError> {
        config.validate()?;
        Ok(Self {
            source,
            handler,
            checkpoints,
            locks,
            config,
            owner: format!("chainstream-{}", uuid::Uuid::new_v4()),
        })
    }

    /// Override the lock owner id (defaults to a random per-process id).
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// One scheduled invocation.
    ///
    /// Returns once the session ends. The lock is released on every path out
    /// of here, including a failing or panicking handler.
    pub async fn tick(&self, shutdown: &CancellationToken) -> Result<TickOutcome, StreamError> {
        if !self.config.enabled {
            tracing::debug!(stream = %self.config.stream_id, "ingestion disabled");
            return Ok(TickOutcome::Disabled);
        }

        let lock = &self.config.lock_name;
        let guard = match LockGuard::try_acquire(
            Arc::clone(&self.locks),
            lock,
            &self.owner,
            self.config.lock_lease(),
        )
        .await?
        {
            Some(guard) => guard,
            None => {
                tracing::debug!(%lock, "lock held by another consumer, skipping");
                return Ok(TickOutcome::Skipped);
            }
        };
        tracing::info!(%lock, owner = %self.owner, "lock acquired");

        let result = self.run_session(&guard, shutdown).await;

        if let Err(e) = guard.release().await {
            tracing::warn!(%lock, error = %e, "lock release failed; lease will expire");
        } else {
            tracing::info!(%lock, "lock released");
        }

        match result {
            Ok(summary) => Ok(TickOutcome::Completed(summary)),
            Err(e) => {
                tracing::error!(stream = %self.config.stream_id, error = %e, "session terminated");
                Err(e)
            }
        }
    }

    /// Tick every `schedule_interval` until `shutdown` fires.
    pub async fn run_scheduled(&self, shutdown: CancellationToken) {
        if !self.config.enabled {
            tracing::info!(stream = %self.config.stream_id, "ingestion disabled, scheduler not started");
            return;
        }

        let mut ticker = time::interval(self.config.schedule_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.tick(&shutdown).await {
                Ok(TickOutcome::Completed(summary)) => {
                    tracing::info!(state = %summary.state, last = ?summary.last_dispatched, "session completed");
                }
                Ok(TickOutcome::Skipped) | Ok(TickOutcome::Disabled) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "retrying on next schedule");
                }
            }
        }
        tracing::info!(stream = %self.config.stream_id, "scheduler stopped");
    }

    async fn run_session(
        &self,
        guard: &LockGuard,
        shutdown: &CancellationToken,
    ) -> Result<SessionSummary, StreamError> {
        let checkpoint =
            CheckpointManager::new(Arc::clone(&self.checkpoints), self.config.stream_id.clone());
        let start = checkpoint.resume_height(self.config.epoch_height).await?;
        let handler = Arc::new(CheckpointingHandler::new(Arc::clone(&self.handler), checkpoint));

        let orchestrator = Orchestrator::new(Arc::clone(&self.source), &self.config, handler)?;
        let state = orchestrator.state();
        let progress = orchestrator.progress();

        let session = shutdown.child_token();
        let _stop_on_exit = session.clone().drop_guard();
        let mut task = tokio::spawn(orchestrator.run(start, session.clone()));

        let mut wait = self.config.session_wait();
        let mut lock_lost = false;
        loop {
            match time::timeout(wait, &mut task).await {
                Ok(joined) => {
                    let result = joined.map_err(|e| StreamError::Aborted {
                        reason: format!("session task failed: {e}"),
                    })?;
                    if lock_lost {
                        return Err(StreamError::LockLost {
                            name: guard.handle().name.clone(),
                        });
                    }
                    return result;
                }
                Err(_) => {
                    let p = progress.snapshot();
                    tracing::info!(
                        state = %*state.borrow(),
                        highest = ?p.highest_observed,
                        last_dispatched = ?p.last_dispatched,
                        batches = p.batches_dispatched,
                        "session running"
                    );
                    wait = self.config.session_poll();
                    if lock_lost {
                        continue;
                    }
                    let renewed = match guard.renew().await {
                        Ok(renewed) => renewed,
                        Err(e) => {
                            tracing::warn!(error = %e, "lease renewal failed");
                            false
                        }
                    };
                    if !renewed {
                        tracing::error!(lock = %guard.handle().name, "lock lost, stopping session");
                        lock_lost = true;
                        session.cancel();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::config::StreamConfigBuilder;
    use crate::lock::MemoryLockRegistry;
    use crate::testing::{CollectingHandler, FixtureNode};
    use std::time::Duration;

    fn config() -> StreamConfig {
        StreamConfigBuilder::new()
            .stream_id("test")
            .epoch_height(1)
            .backfill_chunk_size(5)
            .backfill_concurrency(2)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn disabled_does_nothing() {
        let cfg = StreamConfigBuilder::new().enabled(false).build().unwrap();
        let locks = Arc::new(MemoryLockRegistry::new());
        let sup = Supervisor::new(
            Arc::new(FixtureNode::new(5)),
            Arc::new(CollectingHandler::new()),
            Arc::new(MemoryCheckpointStore::new()),
            locks.clone(),
            cfg,
        )
        .unwrap();

        let outcome = sup.tick(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, TickOutcome::Disabled);
        assert!(!locks.is_held("chainstream"));
    }

    #[tokio::test]
    async fn held_lock_skips_tick() {
        let locks = Arc::new(MemoryLockRegistry::new());
        let _other = locks
            .try_acquire("chainstream", "replica-b", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        let node = Arc::new(FixtureNode::new(5));
        let sup = Supervisor::new(
            node.clone(),
            Arc::new(CollectingHandler::new()),
            Arc::new(MemoryCheckpointStore::new()),
            locks,
            config(),
        )
        .unwrap();

        let outcome = sup.tick(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, TickOutcome::Skipped);
        assert!(node.meta_queries().is_empty());
    }

    #[tokio::test]
    async fn resumes_from_checkpoint_and_releases_on_error() {
        let node = Arc::new(FixtureNode::new(10));
        node.add_event(3, "transfer", &[]);
        node.add_event(8, "transfer", &[]);
        node.fail_subscribe(true);
        let store = Arc::new(MemoryCheckpointStore::new());
        store.set("test", 5).await.unwrap();
        let locks = Arc::new(MemoryLockRegistry::new());
        let handler = Arc::new(CollectingHandler::new());

        let sup = Supervisor::new(node.clone(), handler.clone(), store.clone(), locks.clone(), config())
            .unwrap();
        let err = sup.tick(&CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, StreamError::Transport(_)));
        assert_eq!(handler.heights(), vec![8]);
        assert_eq!(store.get("test").await.unwrap(), Some(8));
        assert!(!locks.is_held("chainstream"));
    }

    /// Grants locks normally but refuses every renewal.
    #[derive(Default)]
    struct RevokedOnRenew(MemoryLockRegistry);

    #[async_trait::async_trait]
    impl LockRegistry for RevokedOnRenew {
        async fn try_acquire(
            &self,
            name: &str,
            owner: &str,
            lease: Duration,
        ) -> Result<Option<crate::lock::LockHandle>, StreamError> {
            self.0.try_acquire(name, owner, lease).await
        }

        async fn renew(&self, _handle: &crate::lock::LockHandle) -> Result<bool, StreamError> {
            Ok(false)
        }

        async fn release(&self, handle: &crate::lock::LockHandle) -> Result<(), StreamError> {
            self.0.release(handle).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn lost_lease_stops_session() {
        let node = Arc::new(FixtureNode::new(10));
        let locks = Arc::new(RevokedOnRenew::default());
        let cfg = StreamConfigBuilder::new()
            .epoch_height(1)
            .lock_lease(Duration::from_secs(10))
            .session_wait(Duration::from_secs(5), Duration::from_secs(1))
            .watchdog_interval(Duration::from_secs(3_600))
            .build()
            .unwrap();

        let sup = Supervisor::new(
            node.clone(),
            Arc::new(CollectingHandler::new()),
            Arc::new(MemoryCheckpointStore::new()),
            locks.clone(),
            cfg,
        )
        .unwrap();

        let err = sup.tick(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, StreamError::LockLost { .. }));
        assert_eq!(node.active_subscriptions(), 0);
        assert!(!locks.0.is_held("chainstream"));
    }
}
