//! CometBFT JSON-RPC wire types and their conversion into core types.
//!
//! CometBFT encodes 64-bit integers as JSON strings and, before v0.37, base64
//! encodes event attribute keys and values.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::de::{self, DeserializeOwned, Deserializer};
use serde::Deserialize;
use serde_json::Value;

use chainstream_core::{
    Block, BlockMeta, BlockResults, EventAttribute, Height, RawEvent, StreamError, TxResult,
};

// ─── Envelope ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
pub struct RpcErrorBody {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<String>,
}

/// Unwrap a JSON-RPC envelope into its typed result.
pub fn decode_result<T: DeserializeOwned>(body: &str, method: &str) -> Result<T, StreamError> {
    let resp: RpcResponse = serde_json::from_str(body)
        .map_err(|e| StreamError::Decode(format!("{method}: malformed response: {e}")))?;
    if let Some(err) = resp.error {
        return Err(StreamError::Transport(format!(
            "{method}: rpc error {}: {}{}",
            err.code,
            err.message,
            err.data.map(|d| format!(" ({d})")).unwrap_or_default()
        )));
    }
    let result = resp
        .result
        .ok_or_else(|| StreamError::Decode(format!("{method}: response has no result")))?;
    serde_json::from_value(result).map_err(|e| StreamError::Decode(format!("{method}: {e}")))
}

/// Accept `"123"` or `123`.
fn str_u64<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Num {
        Str(String),
        Int(u64),
    }
    match Num::deserialize(d)? {
        Num::Int(n) => Ok(n),
        Num::Str(s) => s.parse().map_err(de::Error::custom),
    }
}

fn null_as_empty<'de, D, T>(d: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(d)?.unwrap_or_default())
}

// ─── /status ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct StatusResult {
    pub sync_info: SyncInfo,
}

#[derive(Debug, Deserialize)]
pub struct SyncInfo {
    #[serde(deserialize_with = "str_u64")]
    pub latest_block_height: u64,
    #[serde(default)]
    pub catching_up: bool,
}

// ─── /block and NewBlock ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct BlockResult {
    #[serde(default)]
    pub block_id: Option<BlockId>,
    pub block: RpcBlock,
}

#[derive(Debug, Default, Deserialize)]
pub struct BlockId {
    #[serde(default)]
    pub hash: String,
}

#[derive(Debug, Deserialize)]
pub struct RpcBlock {
    pub header: Header,
    pub data: BlockData,
}

#[derive(Debug, Deserialize)]
pub struct Header {
    #[serde(deserialize_with = "str_u64")]
    pub height: u64,
}

#[derive(Debug, Deserialize)]
pub struct BlockData {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub txs: Vec<String>,
}

impl BlockResult {
    pub fn into_block(self) -> Block {
        Block {
            height: self.block.header.height,
            hash: self.block_id.unwrap_or_default().hash,
            txs: self.block.data.txs,
        }
    }
}

// ─── /block_results ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct BlockResultsResult {
    #[serde(deserialize_with = "str_u64")]
    pub height: u64,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub txs_results: Vec<RpcTxResult>,
}

#[derive(Debug, Deserialize)]
pub struct RpcTxResult {
    #[serde(default)]
    pub code: u32,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub events: Vec<RpcEvent>,
}

#[derive(Debug, Deserialize)]
pub struct RpcEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub attributes: Vec<RpcAttribute>,
}

#[derive(Debug, Deserialize)]
pub struct RpcAttribute {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
}

impl RpcEvent {
    fn into_raw(self, base64_attributes: bool) -> Result<RawEvent, StreamError> {
        let attributes = self
            .attributes
            .into_iter()
            .map(|a| {
                let key = decode_attr(a.key.unwrap_or_default(), base64_attributes)?;
                let value = decode_attr(a.value.unwrap_or_default(), base64_attributes)?;
                Ok(EventAttribute::new(key, value))
            })
            .collect::<Result<_, StreamError>>()?;
        Ok(RawEvent {
            kind: self.kind,
            attributes,
        })
    }
}

fn decode_attr(raw: String, base64_attributes: bool) -> Result<String, StreamError> {
    if !base64_attributes || raw.is_empty() {
        return Ok(raw);
    }
    let bytes = BASE64
        .decode(raw.as_bytes())
        .map_err(|e| StreamError::Decode(format!("attribute is not base64: {e}")))?;
    String::from_utf8(bytes).map_err(|e| StreamError::Decode(format!("attribute is not utf-8: {e}")))
}

impl BlockResultsResult {
    /// Convert transaction results; block-level events do not feed extraction.
    pub fn into_block_results(self, base64_attributes: bool) -> Result<BlockResults, StreamError> {
        let txs_results = self
            .txs_results
            .into_iter()
            .map(|tx| {
                let events = tx
                    .events
                    .into_iter()
                    .map(|e| e.into_raw(base64_attributes))
                    .collect::<Result<_, _>>()?;
                Ok(TxResult {
                    code: tx.code,
                    events,
                })
            })
            .collect::<Result<_, StreamError>>()?;
        Ok(BlockResults {
            height: self.height,
            txs_results,
        })
    }
}

// ─── /blockchain ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct BlockchainResult {
    #[serde(deserialize_with = "str_u64")]
    pub last_height: u64,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub block_metas: Vec<RpcBlockMeta>,
}

#[derive(Debug, Deserialize)]
pub struct RpcBlockMeta {
    pub header: Header,
    #[serde(deserialize_with = "str_u64")]
    pub num_txs: u64,
}

impl BlockchainResult {
    pub fn into_metas(self) -> Vec<BlockMeta> {
        self.block_metas
            .into_iter()
            .map(|m| BlockMeta {
                height: m.header.height,
                num_txs: m.num_txs.min(u32::MAX as u64) as u32,
            })
            .collect()
    }
}

// ─── Websocket events ────────────────────────────────────────────────────────

/// What a websocket text frame carried.
#[derive(Debug)]
pub enum WsFrame {
    /// A NewBlock notification.
    NewBlock(Block),
    /// Subscription acknowledgement or another non-block message.
    Other,
}

/// Parse one websocket text frame of a `tm.event='NewBlock'` subscription.
pub fn parse_ws_frame(text: &str) -> Result<WsFrame, StreamError> {
    let resp: RpcResponse = serde_json::from_str(text)
        .map_err(|e| StreamError::Decode(format!("websocket frame: {e}")))?;
    if let Some(err) = resp.error {
        return Err(StreamError::Transport(format!(
            "subscription error {}: {}",
            err.code, err.message
        )));
    }
    let Some(result) = resp.result else {
        return Ok(WsFrame::Other);
    };
    let Some(value) = result.get("data").and_then(|d| d.get("value")) else {
        return Ok(WsFrame::Other);
    };
    if value.get("block").is_none() {
        return Ok(WsFrame::Other);
    }
    let block: BlockResult = serde_json::from_value(value.clone())
        .map_err(|e| StreamError::Decode(format!("NewBlock event: {e}")))?;
    Ok(WsFrame::NewBlock(block.into_block()))
}

/// Latest height from a `/status` result.
pub fn latest_height(status: StatusResult) -> Height {
    status.sync_info.latest_block_height
}
