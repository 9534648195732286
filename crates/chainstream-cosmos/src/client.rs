//! `CometNode` — a [`NodeSource`] backed by a CometBFT RPC endpoint.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use chainstream_core::{
    Block, BlockMeta, BlockResults, BlockSubscription, Height, NodeSource, StreamError,
};

use crate::rpc::{self, BlockResult, BlockResultsResult, BlockchainResult, StatusResult};
use crate::ws;

/// `/blockchain` returns at most this many metas per call.
pub const MAX_BLOCKCHAIN_RANGE: u64 = 20;

/// Connection settings for a CometBFT node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CometConfig {
    /// HTTP RPC base URL, e.g. `http://localhost:26657`.
    pub rpc_url: String,
    /// Websocket URL; derived from `rpc_url` (`/websocket`) when unset.
    #[serde(default)]
    pub ws_url: Option<String>,
    /// Attribute keys/values are base64 encoded (CometBFT < 0.37).
    #[serde(default)]
    pub base64_attributes: bool,
    /// Applies to each HTTP request and to the websocket handshake.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Buffered blocks between the websocket task and the live tailer.
    #[serde(default = "default_subscription_buffer")]
    pub subscription_buffer: usize,
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_subscription_buffer() -> usize {
    256
}

impl CometConfig {
    pub fn new(rpc_url: impl Into<String>) -> Self {
        Self {
            rpc_url: rpc_url.into(),
            ws_url: None,
            base64_attributes: false,
            request_timeout_ms: default_request_timeout_ms(),
            subscription_buffer: default_subscription_buffer(),
        }
    }

    /// The websocket endpoint to subscribe on.
    pub fn websocket_url(&self) -> String {
        if let Some(url) = &self.ws_url {
            return url.clone();
        }
        let base = self.rpc_url.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{base}/websocket")
    }
}

/// CometBFT node client.
///
/// The four height queries go over HTTP; the new-block feed is a websocket
/// subscription. Failures are reported, never retried: the session that
/// observes them ends and the supervisor schedules the next attempt.
pub struct CometNode {
    config: CometConfig,
    http: reqwest::Client,
}

impl CometNode {
    pub fn new(config: CometConfig) -> Result<Self, StreamError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| StreamError::Config(format!("http client: {e}")))?;
        Ok(Self { config, http })
    }

    pub fn config(&self) -> &CometConfig {
        &self.config
    }

    async fn get<T: DeserializeOwned>(
        &self,
        method: &str,
        query: &[(&str, String)],
    ) -> Result<T, StreamError> {
        let url = format!("{}/{method}", self.config.rpc_url.trim_end_matches('/'));
        let resp = self
            .http
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| StreamError::Transport(format!("{method}: {e}")))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| StreamError::Transport(format!("{method}: {e}")))?;
        // CometBFT reports RPC errors with a 500 status and a JSON-RPC body.
        if !status.is_success() && !body.trim_start().starts_with('{') {
            return Err(StreamError::Transport(format!("{method}: HTTP {status}: {body}")));
        }
        rpc::decode_result(&body, method)
    }
}

#[async_trait]
impl NodeSource for CometNode {
    async fn latest_height(&self) -> Result<Height, StreamError> {
        let status: StatusResult = self.get("status", &[]).await?;
        if status.sync_info.catching_up {
            tracing::warn!(url = %self.config.rpc_url, "node is still catching up");
        }
        Ok(rpc::latest_height(status))
    }

    async fn block(&self, height: Height) -> Result<Block, StreamError> {
        let result: BlockResult = self.get("block", &[("height", height.to_string())]).await?;
        Ok(result.into_block())
    }

    async fn block_results(&self, height: Height) -> Result<BlockResults, StreamError> {
        let result: BlockResultsResult = self
            .get("block_results", &[("height", height.to_string())])
            .await?;
        result.into_block_results(self.config.base64_attributes)
    }

    async fn blockchain_meta(&self, min: Height, max: Height) -> Result<Vec<BlockMeta>, StreamError> {
        let mut metas = Vec::new();
        if min > max {
            return Ok(metas);
        }
        // Newest first; the node returns at most MAX_BLOCKCHAIN_RANGE metas per call.
        let mut hi = max;
        loop {
            let lo = hi.saturating_sub(MAX_BLOCKCHAIN_RANGE - 1).max(min);
            let page: BlockchainResult = self
                .get(
                    "blockchain",
                    &[("minHeight", lo.to_string()), ("maxHeight", hi.to_string())],
                )
                .await?;
            let page = page.into_metas();
            let lowest = page.iter().map(|m| m.height).min();
            metas.extend(page);
            match lowest {
                Some(h) if h > min.max(1) && h <= hi => hi = h - 1,
                _ => break,
            }
        }
        Ok(metas)
    }

    async fn subscribe_new_blocks(&self) -> Result<BlockSubscription, StreamError> {
        ws::subscribe_new_blocks(
            &self.config.websocket_url(),
            self.config.subscription_buffer,
            Duration::from_millis(self.config.request_timeout_ms),
        )
        .await
    }

    fn name(&self) -> &str {
        &self.config.rpc_url
    }
}
