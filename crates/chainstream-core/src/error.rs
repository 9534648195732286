//! Error types for the ingestion pipeline.

use thiserror::Error;

use crate::types::Height;

/// Errors that can occur while ingesting a block stream.
///
/// Every variant that reaches the orchestrator ends the current session; the
/// supervisor logs it and the next scheduled tick resumes from the checkpoint.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The node could not be reached or answered with an RPC error.
    #[error("transport error: {0}")]
    Transport(String),

    /// The watchdog saw no height progress over a full interval.
    #[error("stream stalled at height {height}: no new block for {idle_ms}ms")]
    Stale { height: Height, idle_ms: u64 },

    /// The live block feed ended.
    #[error("block subscription closed")]
    SubscriptionClosed,

    /// The checkpoint for a dispatched batch could not be persisted.
    #[error("checkpoint write failed at height {height}: {reason}")]
    CheckpointWrite { height: Height, reason: String },

    /// The downstream batch handler rejected a batch.
    #[error("handler failed at height {height}: {reason}")]
    Handler { height: Height, reason: String },

    /// A block or its results could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("lock registry error: {0}")]
    Lock(String),

    /// The session's lease was taken over by another owner.
    #[error("lock '{name}' lost during session")]
    LockLost { name: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    /// The session was torn down before it could finish.
    #[error("session aborted: {reason}")]
    Aborted { reason: String },
}

impl StreamError {
    /// Returns `true` for the errors that terminate an ingestion session.
    ///
    /// `Config` is rejected before a session starts, so it is the only
    /// variant that is not session-fatal.
    pub fn is_session_fatal(&self) -> bool {
        !matches!(self, Self::Config(_))
    }

    /// Returns `true` if the failure came from the node rather than from
    /// local state (handler, storage, locks).
    pub fn is_node_failure(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Stale { .. } | Self::SubscriptionClosed | Self::Decode(_)
        )
    }
}
