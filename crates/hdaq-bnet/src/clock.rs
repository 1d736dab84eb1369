// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Cluster time base.
//!
//! Schedules and packet stamps use seconds since a cluster epoch. Nodes of
//! an in-process cluster share one epoch; `TIMESYNC` shifts a node clock by
//! the master offset.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

/// Clock of one node.
pub trait ClusterClock: Send + Sync {
    /// Seconds since the cluster epoch.
    fn now(&self) -> f64;

    /// Shift this clock so that it reads `master_now` at this instant.
    fn sync_to(&self, master_now: f64);

    /// Current offset applied on top of the epoch.
    fn offset(&self) -> f64;
}

/// Clock counting from a shared [`Instant`] epoch.
#[derive(Debug, Clone)]
pub struct EpochClock {
    epoch: Instant,
    offset: Arc<Mutex<f64>>,
}

impl EpochClock {
    pub fn new() -> Self {
        Self::with_epoch(Instant::now())
    }

    pub fn with_epoch(epoch: Instant) -> Self {
        Self {
            epoch,
            offset: Arc::new(Mutex::new(0.0)),
        }
    }

    /// Clock of another node on the same epoch, with its own offset.
    pub fn sibling(&self) -> Self {
        Self::with_epoch(self.epoch)
    }
}

impl Default for EpochClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterClock for EpochClock {
    fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64() + *self.offset.lock()
    }

    fn sync_to(&self, master_now: f64) {
        let local = self.epoch.elapsed().as_secs_f64();
        *self.offset.lock() = master_now - local;
    }

    fn offset(&self) -> f64 {
        *self.offset.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn siblings_share_epoch_but_not_offset() {
        let master = EpochClock::new();
        let node = master.sibling();
        node.sync_to(master.now() + 10.0);
        assert!(node.offset() > 9.9);
        assert!(node.now() - master.now() > 9.9);
        assert_eq!(master.offset(), 0.0);
    }

    #[test]
    fn clock_is_monotonic() {
        let clock = EpochClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
