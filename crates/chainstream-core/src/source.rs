//! The `NodeSource` trait — everything the pipeline needs from a node.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::StreamError;
use crate::types::{Block, BlockMeta, BlockResults, Height};

/// Read queries and the new-block feed of a blockchain node.
///
/// All queries are idempotent. The subscription delivers new blocks at least
/// once; a reconnecting node may replay a block it already sent.
///
/// # Object Safety
/// The trait is object-safe and is shared as `Arc<dyn NodeSource>` between
/// the backfill workers and the live tailer.
#[async_trait]
pub trait NodeSource: Send + Sync + 'static {
    /// Current chain head.
    async fn latest_height(&self) -> Result<Height, StreamError>;

    /// Block (with raw transactions) at `height`.
    async fn block(&self, height: Height) -> Result<Block, StreamError>;

    /// Per-transaction results (events) of the block at `height`.
    async fn block_results(&self, height: Height) -> Result<BlockResults, StreamError>;

    /// Metadata for every block in `[min, max]`, in any order.
    async fn blockchain_meta(&self, min: Height, max: Height)
        -> Result<Vec<BlockMeta>, StreamError>;

    /// Open a feed of newly produced blocks.
    async fn subscribe_new_blocks(&self) -> Result<BlockSubscription, StreamError>;

    /// Identifier used in logs.
    fn name(&self) -> &str {
        "node"
    }
}

/// Receiving half of a new-block feed.
///
/// Dropping the subscription (or calling [`unsubscribe`](Self::unsubscribe))
/// cancels the producer side.
#[derive(Debug)]
pub struct BlockSubscription {
    rx: mpsc::Receiver<Result<Block, StreamError>>,
    cancel: CancellationToken,
}

/// Producing half of a new-block feed, held by the node adapter's task.
#[derive(Clone)]
pub struct SubscriptionSender {
    tx: mpsc::Sender<Result<Block, StreamError>>,
    cancel: CancellationToken,
}

impl BlockSubscription {
    /// Create a connected sender/subscription pair.
    pub fn channel(capacity: usize) -> (SubscriptionSender, BlockSubscription) {
        let (tx, rx) = mpsc::channel(capacity);
        let cancel = CancellationToken::new();
        (
            SubscriptionSender {
                tx,
                cancel: cancel.clone(),
            },
            BlockSubscription { rx, cancel },
        )
    }

    /// Wait for the next block. `None` means the feed ended.
    pub async fn next(&mut self) -> Option<Result<Block, StreamError>> {
        self.rx.recv().await
    }

    /// Stop the feed. Further calls to `next` drain what was buffered.
    pub fn unsubscribe(&mut self) {
        self.cancel.cancel();
        self.rx.close();
    }

    pub fn is_unsubscribed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for BlockSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl SubscriptionSender {
    /// Forward an item. Returns `false` once the subscriber is gone.
    pub async fn send(&self, item: Result<Block, StreamError>) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.tx.send(item).await.is_ok()
    }

    /// Resolves when the subscriber unsubscribes or is dropped.
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(height: Height) -> Block {
        Block {
            height,
            hash: format!("H{height}"),
            txs: vec![],
        }
    }

    #[tokio::test]
    async fn sender_forwards_blocks() {
        let (tx, mut sub) = BlockSubscription::channel(4);
        assert!(tx.send(Ok(block(1))).await);
        let got = sub.next().await.unwrap().unwrap();
        assert_eq!(got.height, 1);
    }

    #[tokio::test]
    async fn drop_closes_sender() {
        let (tx, sub) = BlockSubscription::channel(4);
        drop(sub);
        assert!(tx.is_closed());
        assert!(!tx.send(Ok(block(2))).await);
        // Resolves immediately once cancelled.
        tx.closed().await;
    }

    #[tokio::test]
    async fn unsubscribe_ends_feed() {
        let (tx, mut sub) = BlockSubscription::channel(4);
        sub.unsubscribe();
        assert!(sub.is_unsubscribed());
        assert!(!tx.send(Ok(block(3))).await);
        assert!(sub.next().await.is_none());
    }
}
