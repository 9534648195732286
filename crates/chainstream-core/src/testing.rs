//! In-process fixtures for exercising the pipeline without a node.
//!
//! Enabled for this crate's own tests and, for downstream crates, through the
//! `testing` feature.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::sync::Notify;

use crate::checkpoint::{CheckpointStore, MemoryCheckpointStore};
use crate::error::StreamError;
use crate::handler::BatchHandler;
use crate::source::{BlockSubscription, NodeSource, SubscriptionSender};
use crate::types::{
    Block, BlockMeta, BlockResults, EventAttribute, EventBatch, Height, RawEvent, TxResult,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

type DelayFn = Box<dyn Fn(Height) -> Duration + Send + Sync>;

#[derive(Default)]
struct FixtureState {
    head: Height,
    /// height → transactions (each a list of raw events)
    txs: BTreeMap<Height, Vec<Vec<RawEvent>>>,
    subscribers: Vec<SubscriptionSender>,
    meta_queries: Vec<Height>,
    results_queries: Vec<Height>,
    fail_results: Vec<Height>,
}

/// A scripted node: blocks `1..=head` exist, events are added per height,
/// and new blocks are pushed to subscribers on demand.
#[derive(Default)]
pub struct FixtureNode {
    state: Mutex<FixtureState>,
    meta_delay: Mutex<Option<DelayFn>>,
    fail_latest: AtomicBool,
    fail_subscribe: AtomicBool,
    hang_subscribe: AtomicBool,
}

impl FixtureNode {
    pub fn new(head: Height) -> Self {
        let node = Self::default();
        lock(&node.state).head = head;
        node
    }

    pub fn head(&self) -> Height {
        lock(&self.state).head
    }

    /// Add a transaction at `height` carrying a single event.
    pub fn add_event(&self, height: Height, kind: &str, attrs: &[(&str, &str)]) {
        self.add_tx(
            height,
            vec![RawEvent {
                kind: kind.to_string(),
                attributes: attrs.iter().map(|(k, v)| EventAttribute::new(*k, *v)).collect(),
            }],
        );
    }

    /// Add a transaction at `height` with the given events (may be empty).
    pub fn add_tx(&self, height: Height, events: Vec<RawEvent>) {
        lock(&self.state).txs.entry(height).or_default().push(events);
    }

    /// Delay `blockchain_meta` by `f(min_height)`.
    pub fn set_meta_delay_fn(&self, f: impl Fn(Height) -> Duration + Send + Sync + 'static) {
        *lock(&self.meta_delay) = Some(Box::new(f));
    }

    pub fn fail_results_at(&self, height: Height) {
        lock(&self.state).fail_results.push(height);
    }

    pub fn fail_latest_height(&self, fail: bool) {
        self.fail_latest.store(fail, Ordering::SeqCst);
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    /// Make `subscribe_new_blocks` wait forever, like a node that accepts the
    /// connection but never completes the websocket handshake.
    pub fn hang_subscribe(&self, hang: bool) {
        self.hang_subscribe.store(hang, Ordering::SeqCst);
    }

    /// Lower bounds of every `blockchain_meta` call, in call order.
    pub fn meta_queries(&self) -> Vec<Height> {
        lock(&self.state).meta_queries.clone()
    }

    /// Heights of every `block_results` call, sorted.
    pub fn results_queries(&self) -> Vec<Height> {
        let mut q = lock(&self.state).results_queries.clone();
        q.sort_unstable();
        q
    }

    /// Number of subscriptions still open on the subscriber side.
    pub fn active_subscriptions(&self) -> usize {
        let mut state = lock(&self.state);
        state.subscribers.retain(|s| !s.is_closed());
        state.subscribers.len()
    }

    /// Advance the head by one block and push it to subscribers.
    pub async fn produce_block(&self) -> Height {
        let height = {
            let mut state = lock(&self.state);
            state.head += 1;
            state.head
        };
        self.push_block(height).await;
        height
    }

    /// Push the block at `height` to subscribers without moving the head
    /// (used to simulate replays after a reconnect).
    pub async fn push_block(&self, height: Height) {
        let (block, subscribers) = {
            let state = lock(&self.state);
            (Self::block_from(&state, height), state.subscribers.clone())
        };
        for s in subscribers {
            s.send(Ok(block.clone())).await;
        }
    }

    /// Push a transport failure into every open subscription.
    pub async fn break_subscriptions(&self, reason: &str) {
        let subscribers = lock(&self.state).subscribers.clone();
        for s in subscribers {
            s.send(Err(StreamError::Transport(reason.to_string()))).await;
        }
    }

    /// End every open subscription.
    pub fn close_subscriptions(&self) {
        lock(&self.state).subscribers.clear();
    }

    fn block_from(state: &FixtureState, height: Height) -> Block {
        let n = state.txs.get(&height).map_or(0, |t| t.len());
        Block {
            height,
            hash: format!("{height:064X}"),
            txs: (0..n)
                .map(|i| BASE64.encode(format!("tx-{height}-{i}")))
                .collect(),
        }
    }
}

#[async_trait]
impl NodeSource for FixtureNode {
    async fn latest_height(&self) -> Result<Height, StreamError> {
        if self.fail_latest.load(Ordering::SeqCst) {
            return Err(StreamError::Transport("status unavailable".into()));
        }
        Ok(self.head())
    }

    async fn block(&self, height: Height) -> Result<Block, StreamError> {
        let state = lock(&self.state);
        if height == 0 || height > state.head {
            return Err(StreamError::Transport(format!("height {height} not available")));
        }
        Ok(Self::block_from(&state, height))
    }

    async fn block_results(&self, height: Height) -> Result<BlockResults, StreamError> {
        let mut state = lock(&self.state);
        state.results_queries.push(height);
        if state.fail_results.contains(&height) {
            return Err(StreamError::Transport(format!("block_results {height} failed")));
        }
        let txs_results = state
            .txs
            .get(&height)
            .map(|txs| {
                txs.iter()
                    .map(|events| TxResult {
                        code: 0,
                        events: events.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(BlockResults { height, txs_results })
    }

    async fn blockchain_meta(
        &self,
        min: Height,
        max: Height,
    ) -> Result<Vec<BlockMeta>, StreamError> {
        let delay = lock(&self.meta_delay).as_ref().map(|f| f(min));
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        let mut state = lock(&self.state);
        state.meta_queries.push(min);
        let max = max.min(state.head);
        // Newest first, like the node does.
        Ok((min.max(1)..=max)
            .rev()
            .map(|height| BlockMeta {
                height,
                num_txs: state.txs.get(&height).map_or(0, |t| t.len() as u32),
            })
            .collect())
    }

    async fn subscribe_new_blocks(&self) -> Result<BlockSubscription, StreamError> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(StreamError::Transport("websocket connect refused".into()));
        }
        if self.hang_subscribe.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let (tx, sub) = BlockSubscription::channel(64);
        lock(&self.state).subscribers.push(tx);
        Ok(sub)
    }

    fn name(&self) -> &str {
        "fixture"
    }
}

// ─── Handlers ────────────────────────────────────────────────────────────────

/// Records every batch it receives; optionally fails or panics at one height.
#[derive(Default)]
pub struct CollectingHandler {
    batches: Mutex<Vec<EventBatch>>,
    fail_at: Mutex<Option<Height>>,
    panic_at: Mutex<Option<Height>>,
    notify: Notify,
}

impl CollectingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_at(height: Height) -> Self {
        let h = Self::default();
        *lock(&h.fail_at) = Some(height);
        h
    }

    pub fn panicking_at(height: Height) -> Self {
        let h = Self::default();
        *lock(&h.panic_at) = Some(height);
        h
    }

    pub fn batches(&self) -> Vec<EventBatch> {
        lock(&self.batches).clone()
    }

    pub fn heights(&self) -> Vec<Height> {
        lock(&self.batches).iter().map(|b| b.height).collect()
    }

    pub fn batch(&self, height: Height) -> Option<EventBatch> {
        lock(&self.batches).iter().find(|b| b.height == height).cloned()
    }

    /// Wait until at least `n` batches were received.
    pub async fn wait_for(&self, n: usize) {
        loop {
            let notified = self.notify.notified();
            if lock(&self.batches).len() >= n {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl BatchHandler for CollectingHandler {
    async fn on_batch(&self, batch: &EventBatch) -> Result<(), StreamError> {
        if *lock(&self.panic_at) == Some(batch.height) {
            panic!("fixture handler panicked at height {}", batch.height);
        }
        if *lock(&self.fail_at) == Some(batch.height) {
            return Err(StreamError::Handler {
                height: batch.height,
                reason: "fixture handler rejected batch".into(),
            });
        }
        lock(&self.batches).push(batch.clone());
        self.notify.notify_waiters();
        Ok(())
    }
}

// ─── Checkpoints ─────────────────────────────────────────────────────────────

/// Memory checkpoint store whose writes can be switched to fail.
#[derive(Default)]
pub struct FlakyCheckpointStore {
    inner: MemoryCheckpointStore,
    fail_writes: AtomicBool,
}

impl FlakyCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl CheckpointStore for FlakyCheckpointStore {
    async fn get(&self, key: &str) -> Result<Option<Height>, StreamError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, height: Height) -> Result<(), StreamError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StreamError::Storage("write rejected".into()));
        }
        self.inner.set(key, height).await
    }

    async fn delete(&self, key: &str) -> Result<(), StreamError> {
        self.inner.delete(key).await
    }
}
