//! Checkpoint store — persists the last fully handled height per stream.
//!
//! A session resumes at the stored height (inclusive), so downstream handlers
//! must tolerate seeing that one height twice.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::StreamError;
use crate::types::Height;

/// Trait for storing and loading checkpoints.
///
/// Implementations include [`MemoryCheckpointStore`] and the SQLite / Postgres
/// stores in `chainstream-storage`.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the checkpoint for a stream, if one was ever written.
    async fn get(&self, key: &str) -> Result<Option<Height>, StreamError>;

    /// Save (upsert) the checkpoint for a stream.
    async fn set(&self, key: &str, height: Height) -> Result<(), StreamError>;

    /// Delete a checkpoint (e.g. when resetting a stream).
    async fn delete(&self, key: &str) -> Result<(), StreamError>;
}

/// Binds a [`CheckpointStore`] to one stream key.
#[derive(Clone)]
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    key: String,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    /// Load the saved checkpoint (returns `None` if none exists).
    pub async fn load(&self) -> Result<Option<Height>, StreamError> {
        self.store.get(&self.key).await
    }

    /// Height a new session starts at: the checkpoint, or `epoch` if unset.
    pub async fn resume_height(&self, epoch: Height) -> Result<Height, StreamError> {
        Ok(self.load().await?.unwrap_or(epoch))
    }

    /// Persist `height` after its batch was handled.
    ///
    /// Any store failure is reported as [`StreamError::CheckpointWrite`].
    pub async fn commit(&self, height: Height) -> Result<(), StreamError> {
        self.store
            .set(&self.key, height)
            .await
            .map_err(|e| StreamError::CheckpointWrite {
                height,
                reason: e.to_string(),
            })?;
        tracing::debug!(stream = %self.key, height, "checkpoint committed");
        Ok(())
    }
}

// ─── In-memory store (for testing) ────────────────────────────────────────────

/// In-memory checkpoint store for tests and ephemeral streams.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    data: Mutex<HashMap<String, Height>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn data(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Height>>, StreamError> {
        self.data
            .lock()
            .map_err(|_| StreamError::Storage("checkpoint map poisoned".into()))
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get(&self, key: &str) -> Result<Option<Height>, StreamError> {
        Ok(self.data()?.get(key).copied())
    }

    async fn set(&self, key: &str, height: Height) -> Result<(), StreamError> {
        self.data()?.insert(key.to_string(), height);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StreamError> {
        self.data()?.remove(key);
        Ok(())
    }
}
