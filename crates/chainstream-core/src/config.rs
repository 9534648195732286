//! Stream configuration and its fluent builder.
//!
//! # Example
//!
//! ```rust
//! use chainstream_core::config::StreamConfigBuilder;
//!
//! let config = StreamConfigBuilder::new()
//!     .stream_id("osmosis-swaps")
//!     .epoch_height(12_000_000)
//!     .event_filter("token_swapped")
//!     .event_filter("wasm:_contract_address")
//!     .backfill_concurrency(4)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.backfill_chunk_size, 20);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backfill::{DEFAULT_CHUNK_SIZE, DEFAULT_CONCURRENCY};
use crate::error::StreamError;
use crate::filter::EventFilter;
use crate::types::Height;

/// Configuration for one ingestion stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Checkpoint key for this stream.
    #[serde(default = "default_stream_id")]
    pub stream_id: String,
    /// Name of the lock that elects the active replica.
    #[serde(default = "default_lock_name")]
    pub lock_name: String,
    /// When `false` the scheduled supervisor does nothing.
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Start height when no checkpoint exists. `0` starts at the chain head.
    #[serde(default)]
    pub epoch_height: Height,
    /// Bare event types or `"type:attributeKey"` entries; empty keeps all.
    #[serde(default)]
    pub event_type_filters: Vec<String>,
    /// Heights per backfill range query.
    #[serde(default = "default_chunk_size")]
    pub backfill_chunk_size: u64,
    /// Chunks queried concurrently per backfill round.
    #[serde(default = "default_concurrency")]
    pub backfill_concurrency: usize,
    #[serde(default = "default_watchdog_interval_ms")]
    pub watchdog_interval_ms: u64,
    #[serde(default = "default_lock_lease_ms")]
    pub lock_lease_ms: u64,
    /// Delay between supervisor ticks.
    #[serde(default = "default_schedule_interval_ms")]
    pub schedule_interval_ms: u64,
    /// First bounded wait on a running session.
    #[serde(default = "default_session_wait_ms")]
    pub session_wait_ms: u64,
    /// Poll period once the first wait elapsed; the lease is renewed on each poll.
    #[serde(default = "default_session_poll_ms")]
    pub session_poll_ms: u64,
    /// Time background tasks get to stop before they are aborted.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

fn default_stream_id() -> String { "default".into() }
fn default_lock_name() -> String { "chainstream".into() }
fn bool_true() -> bool { true }
fn default_chunk_size() -> u64 { DEFAULT_CHUNK_SIZE }
fn default_concurrency() -> usize { DEFAULT_CONCURRENCY }
fn default_watchdog_interval_ms() -> u64 { 30_000 }
fn default_lock_lease_ms() -> u64 { 120_000 }
fn default_schedule_interval_ms() -> u64 { 10_000 }
fn default_session_wait_ms() -> u64 { 60_000 }
fn default_session_poll_ms() -> u64 { 5_000 }
fn default_shutdown_grace_ms() -> u64 { 5_000 }

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            stream_id: default_stream_id(),
            lock_name: default_lock_name(),
            enabled: true,
            epoch_height: 0,
            event_type_filters: vec![],
            backfill_chunk_size: DEFAULT_CHUNK_SIZE,
            backfill_concurrency: DEFAULT_CONCURRENCY,
            watchdog_interval_ms: default_watchdog_interval_ms(),
            lock_lease_ms: default_lock_lease_ms(),
            schedule_interval_ms: default_schedule_interval_ms(),
            session_wait_ms: default_session_wait_ms(),
            session_poll_ms: default_session_poll_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl StreamConfig {
    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_millis(self.lock_lease_ms)
    }

    pub fn schedule_interval(&self) -> Duration {
        Duration::from_millis(self.schedule_interval_ms)
    }

    pub fn session_wait(&self) -> Duration {
        Duration::from_millis(self.session_wait_ms)
    }

    pub fn session_poll(&self) -> Duration {
        Duration::from_millis(self.session_poll_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Parse the configured filter entries.
    pub fn event_filter(&self) -> Result<EventFilter, StreamError> {
        EventFilter::parse(&self.event_type_filters)
    }

    /// Reject configurations that cannot run.
    pub fn validate(&self) -> Result<(), StreamError> {
        let positive = [
            ("backfill_chunk_size", self.backfill_chunk_size),
            ("backfill_concurrency", self.backfill_concurrency as u64),
            ("watchdog_interval_ms", self.watchdog_interval_ms),
            ("lock_lease_ms", self.lock_lease_ms),
            ("schedule_interval_ms", self.schedule_interval_ms),
            ("session_wait_ms", self.session_wait_ms),
            ("session_poll_ms", self.session_poll_ms),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(StreamError::Config(format!("{name} must be greater than zero")));
        }
        if self.stream_id.trim().is_empty() {
            return Err(StreamError::Config("stream_id must not be empty".into()));
        }
        if self.lock_name.trim().is_empty() {
            return Err(StreamError::Config("lock_name must not be empty".into()));
        }
        // The lease is renewed once per poll (and once after the first wait).
        if self.lock_lease_ms <= self.session_poll_ms.max(self.session_wait_ms) {
            return Err(StreamError::Config(format!(
                "lock_lease_ms ({}) must exceed session_wait_ms and session_poll_ms",
                self.lock_lease_ms
            )));
        }
        self.event_filter()?;
        Ok(())
    }
}

/// Fluent builder for [`StreamConfig`].
#[derive(Default)]
pub struct StreamConfigBuilder {
    config: StreamConfig,
}

impl StreamConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stream_id(mut self, id: impl Into<String>) -> Self {
        self.config.stream_id = id.into();
        self
    }

    pub fn lock_name(mut self, name: impl Into<String>) -> Self {
        self.config.lock_name = name.into();
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.config.enabled = enabled;
        self
    }

    pub fn epoch_height(mut self, height: Height) -> Self {
        self.config.epoch_height = height;
        self
    }

    /// Add one filter entry (`"type"` or `"type:attributeKey"`).
    pub fn event_filter(mut self, entry: impl Into<String>) -> Self {
        self.config.event_type_filters.push(entry.into());
        self
    }

    pub fn backfill_chunk_size(mut self, size: u64) -> Self {
        self.config.backfill_chunk_size = size;
        self
    }

    pub fn backfill_concurrency(mut self, workers: usize) -> Self {
        self.config.backfill_concurrency = workers;
        self
    }

    pub fn watchdog_interval(mut self, interval: Duration) -> Self {
        self.config.watchdog_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn lock_lease(mut self, lease: Duration) -> Self {
        self.config.lock_lease_ms = lease.as_millis() as u64;
        self
    }

    pub fn schedule_interval(mut self, interval: Duration) -> Self {
        self.config.schedule_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn session_wait(mut self, wait: Duration, poll: Duration) -> Self {
        self.config.session_wait_ms = wait.as_millis() as u64;
        self.config.session_poll_ms = poll.as_millis() as u64;
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.shutdown_grace_ms = grace.as_millis() as u64;
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<StreamConfig, StreamError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
