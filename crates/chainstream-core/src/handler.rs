//! Batch handler trait and the dispatch path shared by backfill and live.

use std::sync::Arc;

use async_trait::async_trait;

use crate::checkpoint::CheckpointManager;
use crate::error::StreamError;
use crate::progress::{HeightTracker, Mark};
use crate::types::{EventBatch, StreamPhase};

/// Trait for the downstream consumer of event batches.
///
/// Invoked once per height in ascending order. At the backfill/live boundary
/// and after a restart the same height may be delivered twice, so
/// implementations must be idempotent per
/// `(height, result_index, event_type, tx_hash)`.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn on_batch(&self, batch: &EventBatch) -> Result<(), StreamError>;
}

/// Forwards batches to an inner handler, then commits the checkpoint.
///
/// The checkpoint is written only after the inner handler returned `Ok`.
pub struct CheckpointingHandler {
    inner: Arc<dyn BatchHandler>,
    checkpoint: CheckpointManager,
}

impl CheckpointingHandler {
    pub fn new(inner: Arc<dyn BatchHandler>, checkpoint: CheckpointManager) -> Self {
        Self { inner, checkpoint }
    }
}

#[async_trait]
impl BatchHandler for CheckpointingHandler {
    async fn on_batch(&self, batch: &EventBatch) -> Result<(), StreamError> {
        self.inner.on_batch(batch).await?;
        self.checkpoint.commit(batch.height).await
    }
}

/// Single entry point through which every batch leaves a session.
///
/// Drops empty batches and records progress after a successful hand-off.
#[derive(Clone)]
pub struct Dispatcher {
    handler: Arc<dyn BatchHandler>,
    tracker: HeightTracker,
}

impl Dispatcher {
    pub fn new(handler: Arc<dyn BatchHandler>, tracker: HeightTracker) -> Self {
        Self { handler, tracker }
    }

    pub fn tracker(&self) -> &HeightTracker {
        &self.tracker
    }

    /// Hand `batch` to the handler. Returns `true` if it was dispatched.
    pub async fn dispatch(&self, batch: EventBatch, phase: StreamPhase) -> Result<bool, StreamError> {
        if batch.is_empty() {
            self.tracker.record(batch.height, Mark::Observed);
            return Ok(false);
        }
        tracing::debug!(height = batch.height, events = batch.len(), %phase, "dispatching batch");
        self.handler.on_batch(&batch).await?;
        self.tracker.record(batch.height, Mark::Dispatched);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointStore, MemoryCheckpointStore};
    use crate::types::StreamEvent;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        heights: Mutex<Vec<u64>>,
        fail_at: Option<u64>,
    }

    #[async_trait]
    impl BatchHandler for Recorder {
        async fn on_batch(&self, batch: &EventBatch) -> Result<(), StreamError> {
            if self.fail_at == Some(batch.height) {
                return Err(StreamError::Handler {
                    height: batch.height,
                    reason: "rejected".into(),
                });
            }
            self.heights.lock().unwrap().push(batch.height);
            Ok(())
        }
    }

    fn batch(height: u64, n: usize) -> EventBatch {
        let events = (0..n)
            .map(|i| StreamEvent {
                height,
                event_type: "transfer".into(),
                result_index: i as u32,
                tx_hash: "AA".into(),
                attributes: vec![],
            })
            .collect();
        EventBatch::new(height, events)
    }

    #[tokio::test]
    async fn empty_batches_are_not_dispatched() {
        let rec = Arc::new(Recorder::default());
        let tracker = HeightTracker::new();
        let d = Dispatcher::new(rec.clone(), tracker.clone());

        assert!(!d.dispatch(batch(3, 0), StreamPhase::Live).await.unwrap());
        assert!(d.dispatch(batch(4, 2), StreamPhase::Live).await.unwrap());

        assert_eq!(*rec.heights.lock().unwrap(), vec![4]);
        let p = tracker.snapshot();
        assert_eq!(p.last_dispatched, Some(4));
        assert_eq!(p.batches_dispatched, 1);
    }

    #[tokio::test]
    async fn checkpoint_follows_successful_handling_only() {
        let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
        let rec = Arc::new(Recorder {
            fail_at: Some(9),
            ..Default::default()
        });
        let h = CheckpointingHandler::new(rec, CheckpointManager::new(store.clone(), "s"));

        h.on_batch(&batch(5, 1)).await.unwrap();
        assert_eq!(store.get("s").await.unwrap(), Some(5));

        assert!(h.on_batch(&batch(9, 1)).await.is_err());
        assert_eq!(store.get("s").await.unwrap(), Some(5));
    }
}
