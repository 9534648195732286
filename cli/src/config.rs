//! Config file and logging setup for the `chainstream` binary.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use chainstream_core::StreamConfig;
use chainstream_cosmos::CometConfig;
use chainstream_storage::PoolOptions;

/// Top-level JSON config file.
///
/// ```json
/// {
///   "node":    { "rpc_url": "http://localhost:26657" },
///   "stream":  { "stream_id": "hub-transfers", "event_type_filters": ["transfer"] },
///   "storage": { "url": "sqlite:chainstream.db", "max_connections": 4 },
///   "log":     { "level": "info", "json": true }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub node: CometConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.stream.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// `memory`, `sqlite:<path>` or `postgres://…`.
    #[serde(default = "default_storage_url")]
    pub url: String,
    /// Pool bounds for the SQL backends.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

fn default_storage_url() -> String {
    "memory".into()
}

fn default_max_connections() -> u32 {
    PoolOptions::default().max_connections
}

fn default_min_connections() -> u32 {
    PoolOptions::default().min_connections
}

fn default_acquire_timeout_secs() -> u64 {
    PoolOptions::default().acquire_timeout_secs
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            url: default_storage_url(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
        }
    }
}

impl StorageConfig {
    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            max_connections: self.max_connections,
            min_connections: self.min_connections,
            acquire_timeout_secs: self.acquire_timeout_secs,
        }
    }
}

/// Log level per component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Global default level: "trace" | "debug" | "info" | "warn" | "error"
    #[serde(default = "default_level")]
    pub level: String,
    /// Per-crate overrides, e.g. `"chainstream-core": "debug"`.
    #[serde(default)]
    pub components: HashMap<String, String>,
    /// JSON lines instead of human-readable text.
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            components: HashMap::new(),
            json: false,
        }
    }
}

impl LogConfig {
    /// Filter directives, e.g. `info,chainstream_core=debug`.
    pub fn directives(&self) -> String {
        let mut directives = self.level.clone();
        let mut components: Vec<_> = self.components.iter().collect();
        components.sort();
        for (component, level) in components {
            directives.push_str(&format!(",{}={}", component.replace('-', "_"), level));
        }
        directives
    }
}

/// Install the global subscriber. `RUST_LOG` wins over the config file.
///
/// Logs go to stderr; stdout carries the event batches.
pub fn init_tracing(config: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.directives()))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let cfg: AppConfig =
            serde_json::from_str(r#"{"node":{"rpc_url":"http://node:26657"}}"#).unwrap();
        assert_eq!(cfg.storage.url, "memory");
        assert_eq!(cfg.stream.backfill_chunk_size, 20);
        assert_eq!(cfg.stream.backfill_concurrency, 10);
        assert_eq!(cfg.log.level, "info");
        assert!(!cfg.log.json);
    }

    #[test]
    fn storage_pool_settings_reach_backends() {
        let cfg: AppConfig = serde_json::from_str(
            r#"{"node":{"rpc_url":"http://node:26657"},
                "storage":{"url":"postgres://db/chainstream","max_connections":12,"acquire_timeout_secs":3}}"#,
        )
        .unwrap();
        let opts = cfg.storage.pool_options();
        assert_eq!(opts.max_connections, 12);
        assert_eq!(opts.min_connections, 1);
        assert_eq!(opts.acquire_timeout_secs, 3);
        assert_eq!(StorageConfig::default().pool_options(), PoolOptions::default());
    }

    #[test]
    fn component_levels_become_directives() {
        let mut log = LogConfig::default();
        log.components.insert("chainstream-cosmos".into(), "debug".into());
        log.components.insert("chainstream-core".into(), "trace".into());
        assert_eq!(
            log.directives(),
            "info,chainstream_core=trace,chainstream_cosmos=debug"
        );
    }

    #[test]
    fn invalid_stream_section_is_rejected() {
        let dir = std::env::temp_dir().join(format!("chainstream-cli-{}.json", std::process::id()));
        std::fs::write(
            &dir,
            r#"{"node":{"rpc_url":"http://n"},"stream":{"backfill_concurrency":0}}"#,
        )
        .unwrap();
        let err = AppConfig::load(&dir).unwrap_err();
        let _ = std::fs::remove_file(&dir);
        assert!(err.to_string().contains("concurrency"), "{err}");
    }
}
