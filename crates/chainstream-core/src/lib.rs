//! chainstream-core — ordered event ingestion from a block-producing node.
//!
//! # Architecture
//!
//! ```text
//! Supervisor (lock + checkpoint, scheduled)
//!     └── Orchestrator (one session)
//!             ├── Backfiller   (chunked, concurrent, sorted per round)
//!             ├── LiveTailer   (new-block subscription, gap fill)
//!             ├── Watchdog     (stall detection)
//!             └── Dispatcher → CheckpointingHandler → your BatchHandler
//!                     ▲
//!               EventExtractor (block results → filtered StreamEvents)
//! ```
//!
//! Batches reach the handler once per height in ascending order. The
//! checkpoint advances only after the handler accepted a batch, so a restart
//! may deliver the checkpoint height a second time.

pub mod backfill;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod extract;
pub mod filter;
pub mod handler;
pub mod live;
pub mod lock;
pub mod orchestrator;
pub mod progress;
pub mod source;
pub mod supervisor;
pub mod types;
pub mod watchdog;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use backfill::{BackfillReport, Backfiller};
pub use checkpoint::{CheckpointManager, CheckpointStore, MemoryCheckpointStore};
pub use config::{StreamConfig, StreamConfigBuilder};
pub use error::StreamError;
pub use extract::{extract, tx_hash, EventExtractor};
pub use filter::{EventFilter, FilterRule};
pub use handler::{BatchHandler, CheckpointingHandler, Dispatcher};
pub use live::LiveTailer;
pub use lock::{LockGuard, LockHandle, LockRegistry, MemoryLockRegistry};
pub use orchestrator::{Orchestrator, SessionState, SessionSummary};
pub use progress::{HeightTracker, Mark, Progress};
pub use source::{BlockSubscription, NodeSource, SubscriptionSender};
pub use supervisor::{Supervisor, TickOutcome};
pub use types::{
    Block, BlockMeta, BlockResults, EventAttribute, EventBatch, Height, RawEvent, StreamEvent,
    StreamPhase, TxResult,
};
pub use watchdog::Watchdog;

/// Re-exported so callers can build shutdown tokens without a direct dependency.
pub use tokio_util::sync::CancellationToken;
