//! Backfill engine — concurrent historical catch-up over a closed height range.
//!
//! The range is walked in rounds of `concurrency` chunks of `chunk_size`
//! heights. Each chunk asks the node which heights carry transactions and
//! only fetches results for those. A round's batches are sorted by height
//! before dispatch because chunks complete in any order.

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::StreamError;
use crate::extract::EventExtractor;
use crate::handler::Dispatcher;
use crate::progress::Mark;
use crate::types::{EventBatch, Height, StreamPhase};

pub const DEFAULT_CHUNK_SIZE: u64 = 20;
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Result of one backfill run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillReport {
    /// First height not covered by this run.
    pub next_height: Height,
    /// Batches handed to the dispatcher.
    pub batches: u64,
    /// `true` if the run stopped early because of cancellation.
    pub cancelled: bool,
}

/// Concurrent range walker.
#[derive(Clone)]
pub struct Backfiller {
    extractor: EventExtractor,
    chunk_size: u64,
    concurrency: usize,
}

impl Backfiller {
    pub fn new(extractor: EventExtractor, chunk_size: u64, concurrency: usize) -> Self {
        Self {
            extractor,
            chunk_size: chunk_size.max(1),
            concurrency: concurrency.max(1),
        }
    }

    /// Heights covered by one round.
    pub fn window(&self) -> u64 {
        self.chunk_size.saturating_mul(self.concurrency as u64)
    }

    /// Dispatch every non-empty batch in `[from, to]` in ascending height order.
    ///
    /// Height `0` has no block, so a range starting there begins at `1`. A
    /// `from` beyond `to` is a no-op.
    pub async fn run(
        &self,
        from: Height,
        to: Height,
        dispatcher: &Dispatcher,
        cancel: &CancellationToken,
    ) -> Result<BackfillReport, StreamError> {
        let from = from.max(1);
        let mut report = BackfillReport {
            next_height: from,
            batches: 0,
            cancelled: false,
        };
        if from > to {
            tracing::debug!(from, to, "nothing to backfill");
            return Ok(report);
        }

        tracing::info!(from, to, chunk = self.chunk_size, workers = self.concurrency, "starting backfill");

        let mut start = from;
        while start <= to {
            let round_end = start.saturating_add(self.window() - 1).min(to);

            let batches = match self.fetch_round(start, round_end, cancel).await? {
                Some(b) => b,
                None => {
                    report.cancelled = true;
                    return Ok(report);
                }
            };

            for batch in batches {
                if cancel.is_cancelled() {
                    report.next_height = batch.height;
                    report.cancelled = true;
                    return Ok(report);
                }
                if dispatcher.dispatch(batch, StreamPhase::Backfill).await? {
                    report.batches += 1;
                }
            }

            dispatcher.tracker().record(round_end, Mark::Observed);
            report.next_height = round_end + 1;
            tracing::info!(from = start, to = round_end, target = to, batches = report.batches, "backfill round complete");

            if round_end == Height::MAX {
                break;
            }
            start = round_end + 1;
        }

        tracing::info!(at = to, batches = report.batches, "backfill complete");
        Ok(report)
    }

    /// Query one round of chunks concurrently. `None` means cancelled.
    async fn fetch_round(
        &self,
        start: Height,
        end: Height,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<EventBatch>>, StreamError> {
        let mut workers = JoinSet::new();
        let mut lo = start;
        for _ in 0..self.concurrency {
            if lo > end {
                break;
            }
            let hi = lo.saturating_add(self.chunk_size - 1).min(end);
            let extractor = self.extractor.clone();
            workers.spawn(fetch_chunk(extractor, lo, hi));
            if hi == end {
                break;
            }
            lo = hi + 1;
        }

        let mut batches = Vec::new();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    workers.abort_all();
                    return Ok(None);
                }
                joined = workers.join_next() => match joined {
                    None => break,
                    Some(Ok(Ok(chunk))) => batches.extend(chunk),
                    Some(Ok(Err(e))) => {
                        tracing::warn!(error = %e, from = start, to = end, "backfill chunk failed");
                        workers.abort_all();
                        return Err(e);
                    }
                    Some(Err(e)) => {
                        workers.abort_all();
                        return Err(StreamError::Aborted {
                            reason: format!("backfill worker failed: {e}"),
                        });
                    }
                }
            }
        }

        batches.sort_by_key(|b| b.height);
        Ok(Some(batches))
    }
}

/// Fetch the non-empty batches of `[lo, hi]`.
async fn fetch_chunk(
    extractor: EventExtractor,
    lo: Height,
    hi: Height,
) -> Result<Vec<EventBatch>, StreamError> {
    let metas = extractor.source().blockchain_meta(lo, hi).await?;
    let mut heights: Vec<Height> = metas
        .iter()
        .filter(|m| m.num_txs > 0 && (lo..=hi).contains(&m.height))
        .map(|m| m.height)
        .collect();
    heights.sort_unstable();
    heights.dedup();

    let mut out = Vec::with_capacity(heights.len());
    for height in heights {
        let batch = extractor.batch_at(height).await?;
        if !batch.is_empty() {
            out.push(batch);
        }
    }
    Ok(out)
}
