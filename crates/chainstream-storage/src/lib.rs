//! chainstream-storage — checkpoint and lock backends for ChainStream.
//!
//! Backends:
//! - memory — the in-process stores from `chainstream-core` (one replica, no persistence)
//! - [`sqlite`] — SQLite via `sqlx` (single host, single file)
//! - [`postgres`] — PostgreSQL via `sqlx` (replicas across hosts)
//!
//! [`Backends::connect`] picks one from a URL:
//!
//! | URL | Backend | Feature |
//! |---|---|---|
//! | `memory` | in-process | always available |
//! | `sqlite:path.db`, `sqlite::memory:` | SQLite | `sqlite` |
//! | `postgres://…`, `postgresql://…` | PostgreSQL | `postgres` |

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
#[cfg(any(feature = "sqlite", feature = "postgres"))]
use chrono::TimeZone;

use chainstream_core::{CheckpointStore, Height, LockRegistry, StreamError};

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use chainstream_core::{MemoryCheckpointStore, MemoryLockRegistry};

/// A checkpoint row as persisted by the SQL backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRecord {
    pub height: Height,
    /// `None` if the stored timestamp is out of range.
    pub updated_at: Option<DateTime<Utc>>,
}

#[cfg(any(feature = "sqlite", feature = "postgres"))]
impl CheckpointRecord {
    pub(crate) fn new(height: Height, updated_at_ms: i64) -> Self {
        Self {
            height,
            updated_at: Utc.timestamp_millis_opt(updated_at_ms).single(),
        }
    }
}

#[cfg(any(feature = "sqlite", feature = "postgres"))]
pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Connection pool settings for the SQL backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolOptions {
    pub max_connections: u32,
    pub min_connections: u32,
    /// Seconds to wait for a pooled connection.
    pub acquire_timeout_secs: u64,
}

impl PoolOptions {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_connections: 5,
            min_connections: 1,
            acquire_timeout_secs: 30,
        }
    }
}

/// The checkpoint store and lock registry a supervisor runs against.
///
/// Both come from the same backend so that replicas sharing a database also
/// share the lock.
#[derive(Clone)]
pub struct Backends {
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub locks: Arc<dyn LockRegistry>,
}

impl Backends {
    /// In-process backends.
    pub fn memory() -> Self {
        Self {
            checkpoints: Arc::new(MemoryCheckpointStore::new()),
            locks: Arc::new(MemoryLockRegistry::new()),
        }
    }

    /// Open the backend named by `url` with default pool settings.
    pub async fn connect(url: &str) -> Result<Self, StreamError> {
        Self::connect_with(url, &PoolOptions::default()).await
    }

    /// Open the backend named by `url`. `opts` is ignored for `memory`.
    #[cfg_attr(not(any(feature = "sqlite", feature = "postgres")), allow(unused_variables))]
    pub async fn connect_with(url: &str, opts: &PoolOptions) -> Result<Self, StreamError> {
        let url = url.trim();
        if url == "memory" {
            return Ok(Self::memory());
        }

        if url.starts_with("sqlite:") {
            #[cfg(feature = "sqlite")]
            {
                let store = Arc::new(sqlite::SqliteStore::open_with_options(url, opts).await?);
                tracing::info!(%url, "using sqlite storage");
                return Ok(Self {
                    checkpoints: store.clone(),
                    locks: store,
                });
            }
            #[cfg(not(feature = "sqlite"))]
            return Err(StreamError::Config(
                "sqlite storage requires the `sqlite` feature".into(),
            ));
        }

        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            #[cfg(feature = "postgres")]
            {
                let store = Arc::new(postgres::PostgresStore::connect_with_options(url, opts).await?);
                tracing::info!("using postgres storage");
                return Ok(Self {
                    checkpoints: store.clone(),
                    locks: store,
                });
            }
            #[cfg(not(feature = "postgres"))]
            return Err(StreamError::Config(
                "postgres storage requires the `postgres` feature".into(),
            ));
        }

        Err(StreamError::Config(format!("unsupported storage url: {url}")))
    }
}
