//! Event extractor — turns one block's transaction results into ordered
//! [`StreamEvent`]s.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha2::{Digest, Sha256};

use crate::error::StreamError;
use crate::filter::EventFilter;
use crate::source::NodeSource;
use crate::types::{Block, BlockResults, EventBatch, StreamEvent};

/// Hash of a raw transaction: upper-case hex SHA-256 of its decoded bytes.
pub fn tx_hash(raw_tx: &str) -> Result<String, StreamError> {
    let bytes = BASE64
        .decode(raw_tx.trim())
        .map_err(|e| StreamError::Decode(format!("invalid base64 transaction: {e}")))?;
    Ok(hex::encode_upper(Sha256::digest(&bytes)))
}

/// Extract the events of `block` that pass `filter`, in transaction order and
/// then event order within each transaction.
pub fn extract(
    block: &Block,
    results: &BlockResults,
    filter: &EventFilter,
) -> Result<Vec<StreamEvent>, StreamError> {
    if block.txs.is_empty() {
        return Ok(vec![]);
    }
    if results.txs_results.len() != block.txs.len() {
        return Err(StreamError::Decode(format!(
            "block {} has {} txs but {} tx results",
            block.height,
            block.txs.len(),
            results.txs_results.len()
        )));
    }

    let mut out = Vec::new();
    for (index, (raw_tx, result)) in block.txs.iter().zip(&results.txs_results).enumerate() {
        let mut hash: Option<String> = None;
        for raw in result.events.iter().filter(|e| filter.matches(e)) {
            let tx_hash = match &hash {
                Some(h) => h.clone(),
                None => {
                    let h = tx_hash(raw_tx)?;
                    hash = Some(h.clone());
                    h
                }
            };
            out.push(StreamEvent {
                height: block.height,
                event_type: raw.kind.clone(),
                result_index: index as u32,
                tx_hash,
                attributes: raw.attributes.clone(),
            });
        }
    }
    Ok(out)
}

/// Runs [`extract`] against a node, skipping the results query for blocks
/// without transactions.
#[derive(Clone)]
pub struct EventExtractor {
    source: Arc<dyn NodeSource>,
    filter: Arc<EventFilter>,
}

impl EventExtractor {
    pub fn new(source: Arc<dyn NodeSource>, filter: EventFilter) -> Self {
        Self {
            source,
            filter: Arc::new(filter),
        }
    }

    pub fn filter(&self) -> &EventFilter {
        &self.filter
    }

    pub fn source(&self) -> &Arc<dyn NodeSource> {
        &self.source
    }

    /// Fetch the block at `height` and extract its batch.
    pub async fn batch_at(&self, height: u64) -> Result<EventBatch, StreamError> {
        let block = self.source.block(height).await?;
        self.batch_for(&block).await
    }

    /// Extract the batch for an already fetched block.
    pub async fn batch_for(&self, block: &Block) -> Result<EventBatch, StreamError> {
        if block.is_empty() {
            return Ok(EventBatch::new(block.height, vec![]));
        }
        let results = self.source.block_results(block.height).await?;
        let events = extract(block, &results, &self.filter)?;
        Ok(EventBatch::new(block.height, events))
    }
}
