//! Shared types for the ingestion pipeline.

use serde::{Deserialize, Serialize};

/// Block height, the sole ordering key for dispatch.
pub type Height = u64;

// ─── Node-side shapes ────────────────────────────────────────────────────────

/// A block as delivered by the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Block height.
    pub height: Height,
    /// Block hash as reported by the node (upper-case hex).
    pub hash: String,
    /// Raw transactions, base64 encoded exactly as the node returns them.
    pub txs: Vec<String>,
}

impl Block {
    /// Returns `true` if the block carries no transactions.
    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }
}

/// Minimal per-height metadata returned by a range query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    pub height: Height,
    /// Number of transactions in the block.
    pub num_txs: u32,
}

/// An event attribute as emitted by the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventAttribute {
    pub key: String,
    pub value: String,
}

impl EventAttribute {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// An event as found in a transaction result, before filtering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub attributes: Vec<EventAttribute>,
}

impl RawEvent {
    /// Returns `true` if any attribute has the given key.
    pub fn has_attribute(&self, key: &str) -> bool {
        self.attributes.iter().any(|a| a.key == key)
    }
}

/// The result of executing one transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxResult {
    /// ABCI result code (`0` = success).
    #[serde(default)]
    pub code: u32,
    #[serde(default)]
    pub events: Vec<RawEvent>,
}

/// Per-transaction results of one block, in transaction order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockResults {
    pub height: Height,
    pub txs_results: Vec<TxResult>,
}

// ─── Pipeline output ─────────────────────────────────────────────────────────

/// A structured event extracted from a block. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub height: Height,
    pub event_type: String,
    /// Position of the emitting transaction within the block.
    pub result_index: u32,
    /// Upper-case hex SHA-256 of the raw transaction bytes.
    pub tx_hash: String,
    pub attributes: Vec<EventAttribute>,
}

/// All matching events found in one block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventBatch {
    pub height: Height,
    pub events: Vec<StreamEvent>,
}

impl EventBatch {
    pub fn new(height: Height, events: Vec<StreamEvent>) -> Self {
        Self { height, events }
    }

    /// Empty batches mark a block as observed but are never dispatched.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }
}

/// Which path produced a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamPhase {
    /// Historical catch-up over a closed height range.
    Backfill,
    /// Blocks delivered by the new-block subscription.
    Live,
}

impl std::fmt::Display for StreamPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Backfill => write!(f, "backfill"),
            Self::Live => write!(f, "live"),
        }
    }
}
