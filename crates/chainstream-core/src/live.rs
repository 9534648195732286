//! Live tailer — processes blocks from the new-block subscription.

use tokio_util::sync::CancellationToken;

use crate::backfill::Backfiller;
use crate::error::StreamError;
use crate::extract::EventExtractor;
use crate::handler::Dispatcher;
use crate::progress::Mark;
use crate::source::BlockSubscription;
use crate::types::{Block, Height, StreamPhase};

/// Follows the chain tip.
///
/// Blocks below `next_height` are replays and are skipped. A block above
/// `next_height` means heights were missed (produced while backfill ran, or
/// dropped across a node reconnect); those are fetched through the backfill
/// engine before the live block is handled. A `next_height` of `0` accepts
/// whatever block arrives first.
pub struct LiveTailer {
    extractor: EventExtractor,
    backfiller: Backfiller,
    next_height: Height,
}

impl LiveTailer {
    pub fn new(extractor: EventExtractor, backfiller: Backfiller, next_height: Height) -> Self {
        Self {
            extractor,
            backfiller,
            next_height,
        }
    }

    /// Consume the subscription until `cancel` fires (`Ok`) or the feed fails.
    ///
    /// Connection failures are surfaced, never retried here.
    pub async fn run(
        mut self,
        mut subscription: BlockSubscription,
        dispatcher: Dispatcher,
        cancel: CancellationToken,
    ) -> Result<(), StreamError> {
        tracing::info!(from = self.next_height, "live tailing started");
        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    subscription.unsubscribe();
                    tracing::info!(next = self.next_height, "live tailing stopped");
                    return Ok(());
                }
                item = subscription.next() => item,
            };

            let block = match item {
                None => return Err(StreamError::SubscriptionClosed),
                Some(Err(e)) => return Err(e),
                Some(Ok(block)) => block,
            };
            self.handle_block(block, &dispatcher, &cancel).await?;
        }
    }

    async fn handle_block(
        &mut self,
        block: Block,
        dispatcher: &Dispatcher,
        cancel: &CancellationToken,
    ) -> Result<(), StreamError> {
        dispatcher.tracker().record(block.height, Mark::Observed);

        if block.height < self.next_height {
            tracing::debug!(height = block.height, next = self.next_height, "skipping already processed block");
            return Ok(());
        }

        if self.next_height > 0 && block.height > self.next_height {
            let (from, to) = (self.next_height, block.height - 1);
            tracing::info!(from, to, "filling gap before live block");
            let report = self.backfiller.run(from, to, dispatcher, cancel).await?;
            if report.cancelled {
                return Ok(());
            }
        }

        let batch = self.extractor.batch_for(&block).await?;
        dispatcher.dispatch(batch, StreamPhase::Live).await?;
        self.next_height = block.height + 1;
        Ok(())
    }
}
