//! SQLite checkpoint store and lock registry.
//!
//! Suitable for a single host running several replicas against one database
//! file, and for tests (`sqlite::memory:`).
//!
//! # Usage
//! ```rust,no_run
//! use chainstream_storage::sqlite::SqliteStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = SqliteStore::open("./chainstream.db").await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use chainstream_core::{CheckpointStore, Height, LockHandle, LockRegistry, StreamError};

use crate::{now_millis, CheckpointRecord, PoolOptions};

fn storage_err(e: sqlx::Error) -> StreamError {
    StreamError::Storage(e.to_string())
}

fn lock_err(e: sqlx::Error) -> StreamError {
    StreamError::Lock(e.to_string())
}

/// SQLite-backed checkpoints and leases.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    ///
    /// Accepts a plain file path or a `sqlite:` URL; `sqlite::memory:` maps
    /// to [`SqliteStore::in_memory`].
    pub async fn open(path: &str) -> Result<Self, StreamError> {
        Self::open_with_options(path, &PoolOptions::default()).await
    }

    /// [`SqliteStore::open`] with explicit pool settings. An in-memory
    /// database always gets a single connection.
    pub async fn open_with_options(path: &str, opts: &PoolOptions) -> Result<Self, StreamError> {
        let path = path.strip_prefix("sqlite:").unwrap_or(path);
        if path == ":memory:" {
            return Self::in_memory().await;
        }
        let url = if path.contains('?') {
            format!("sqlite:{path}")
        } else {
            format!("sqlite:{path}?mode=rwc")
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(opts.max_connections)
            .min_connections(opts.min_connections)
            .acquire_timeout(opts.acquire_timeout())
            .connect(&url)
            .await
            .map_err(storage_err)?;
        let store = Self { pool };
        store.init_schema(true).await?;
        debug!(%url, max = opts.max_connections, "sqlite store opened");
        Ok(store)
    }

    /// Private in-memory database; everything is lost when the store is dropped.
    pub async fn in_memory() -> Result<Self, StreamError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(storage_err)?;
        let store = Self { pool };
        store.init_schema(false).await?;
        Ok(store)
    }

    async fn init_schema(&self, wal: bool) -> Result<(), StreamError> {
        if wal {
            sqlx::query("PRAGMA journal_mode=WAL;")
                .execute(&self.pool)
                .await
                .map_err(storage_err)?;
        }

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS chainstream_checkpoints (
                stream_id  TEXT    NOT NULL PRIMARY KEY,
                height     INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS chainstream_locks (
                name       TEXT    NOT NULL PRIMARY KEY,
                owner      TEXT    NOT NULL,
                token      TEXT    NOT NULL,
                expires_at INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    /// Stored checkpoint with its last update time.
    pub async fn checkpoint_record(&self, key: &str) -> Result<Option<CheckpointRecord>, StreamError> {
        let row = sqlx::query(
            "SELECT height, updated_at FROM chainstream_checkpoints WHERE stream_id = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(row.map(|r| {
            CheckpointRecord::new(
                r.get::<i64, _>("height") as Height,
                r.get::<i64, _>("updated_at"),
            )
        }))
    }

    /// Current holder of `name`, if its lease has not expired.
    pub async fn lock_owner(&self, name: &str) -> Result<Option<String>, StreamError> {
        let row = sqlx::query(
            "SELECT owner FROM chainstream_locks WHERE name = ? AND expires_at > ?",
        )
        .bind(name)
        .bind(now_millis())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(row.map(|r| r.get("owner")))
    }
}

// ─── CheckpointStore impl ────────────────────────────────────────────────────

#[async_trait]
impl CheckpointStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<Height>, StreamError> {
        Ok(self.checkpoint_record(key).await?.map(|r| r.height))
    }

    async fn set(&self, key: &str, height: Height) -> Result<(), StreamError> {
        sqlx::query(
            "INSERT INTO chainstream_checkpoints (stream_id, height, updated_at)
             VALUES (?, ?, ?)
             ON CONFLICT(stream_id) DO UPDATE SET
                height = excluded.height,
                updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(height as i64)
        .bind(now_millis())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        debug!(stream = key, height, "checkpoint saved");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StreamError> {
        sqlx::query("DELETE FROM chainstream_checkpoints WHERE stream_id = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }
}

// ─── LockRegistry impl ───────────────────────────────────────────────────────

#[async_trait]
impl LockRegistry for SqliteStore {
    async fn try_acquire(
        &self,
        name: &str,
        owner: &str,
        lease: Duration,
    ) -> Result<Option<LockHandle>, StreamError> {
        let handle = LockHandle::new(name, owner, lease);
        let now = now_millis();
        // Takes the row only when it is absent or its lease has run out.
        let taken = sqlx::query(
            "INSERT INTO chainstream_locks (name, owner, token, expires_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(name) DO UPDATE SET
                owner = excluded.owner,
                token = excluded.token,
                expires_at = excluded.expires_at
             WHERE chainstream_locks.expires_at <= ?",
        )
        .bind(name)
        .bind(owner)
        .bind(&handle.token)
        .bind(now + lease.as_millis() as i64)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(lock_err)?
        .rows_affected();

        Ok((taken == 1).then_some(handle))
    }

    async fn renew(&self, handle: &LockHandle) -> Result<bool, StreamError> {
        let now = now_millis();
        let renewed = sqlx::query(
            "UPDATE chainstream_locks SET expires_at = ?
             WHERE name = ? AND token = ? AND expires_at > ?",
        )
        .bind(now + handle.lease.as_millis() as i64)
        .bind(&handle.name)
        .bind(&handle.token)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(lock_err)?
        .rows_affected();
        Ok(renewed == 1)
    }

    async fn release(&self, handle: &LockHandle) -> Result<(), StreamError> {
        sqlx::query("DELETE FROM chainstream_locks WHERE name = ? AND token = ?")
            .bind(&handle.name)
            .bind(&handle.token)
            .execute(&self.pool)
            .await
            .map_err(lock_err)?;
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
