//! Session progress — the single owner of the "last height" signal.
//!
//! Every writer goes through [`HeightTracker::record`]; the watchdog and the
//! supervisor read through [`HeightTracker::snapshot`]. Nothing else holds a
//! copy of the height.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::types::Height;

/// Point-in-time view of a session's progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Highest block height seen, dispatched or not.
    pub highest_observed: Option<Height>,
    /// Height of the last batch handed to the dispatcher.
    pub last_dispatched: Option<Height>,
    /// Number of batches dispatched in this session.
    pub batches_dispatched: u64,
}

/// What happened at a recorded height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mark {
    /// The block was seen: a head snapshot, a finished backfill round, a live
    /// block, or a block whose batch was empty.
    Observed,
    /// A non-empty batch for the block was handed to the handler.
    Dispatched,
}

/// Shared, monotonic progress cell for one session.
#[derive(Debug, Clone, Default)]
pub struct HeightTracker {
    inner: Arc<Mutex<Progress>>,
}

impl HeightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Progress> {
        // Progress is plain data; a panic mid-update cannot leave it torn.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record progress at `height`. Returns `true` if it raised the highest
    /// observed height.
    pub fn record(&self, height: Height, mark: Mark) -> bool {
        let mut p = self.lock();
        if mark == Mark::Dispatched {
            p.last_dispatched = Some(height);
            p.batches_dispatched += 1;
        }
        match p.highest_observed {
            Some(h) if h >= height => false,
            _ => {
                p.highest_observed = Some(height);
                true
            }
        }
    }

    pub fn highest_observed(&self) -> Option<Height> {
        self.lock().highest_observed
    }

    pub fn snapshot(&self) -> Progress {
        *self.lock()
    }
}
