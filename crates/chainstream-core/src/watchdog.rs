//! Liveness watchdog — detects a feed that stopped delivering blocks without
//! reporting a transport error.

use std::time::Duration;

use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::StreamError;
use crate::progress::HeightTracker;

pub const DEFAULT_WATCHDOG_INTERVAL: Duration = Duration::from_secs(30);

/// Compares the highest observed height against the value seen on the
/// previous tick; no change over one interval is a stall.
pub struct Watchdog {
    tracker: HeightTracker,
    interval: Duration,
}

impl Watchdog {
    pub fn new(tracker: HeightTracker, interval: Duration) -> Self {
        Self { tracker, interval }
    }

    /// Run until `cancel` fires (`Ok`) or a stall is detected
    /// (`Err(StreamError::Stale)`).
    pub async fn run(self, cancel: CancellationToken) -> Result<(), StreamError> {
        let mut last = self.tracker.highest_observed();
        let mut ticker = time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    let current = self.tracker.highest_observed();
                    if current == last {
                        let height = current.unwrap_or(0);
                        tracing::warn!(height, interval_ms = self.interval.as_millis() as u64, "no block progress, stream is stale");
                        return Err(StreamError::Stale {
                            height,
                            idle_ms: self.interval.as_millis() as u64,
                        });
                    }
                    tracing::trace!(from = ?last, to = ?current, "watchdog tick");
                    last = current;
                }
            }
        }
    }
}
