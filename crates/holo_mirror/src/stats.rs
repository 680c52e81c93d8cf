use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Point-in-time copy of the pipeline counters.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PipelineStatsSnapshot {
    pub events_received: u64,
    pub events_queued: u64,
    pub monitor_reconnects: u64,
    pub saved: u64,
    pub skipped: u64,
    pub dropped: u64,
    pub failed: u64,
    pub storer_reconnects: u64,
}

/// Counters shared by the monitor, the storer and the admin `info` command.
#[derive(Default, Debug)]
pub struct PipelineStats {
    events_received: AtomicU64,
    events_queued: AtomicU64,
    monitor_reconnects: AtomicU64,
    saved: AtomicU64,
    skipped: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
    storer_reconnects: AtomicU64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_event(&self) -> u64 {
        self.events_received.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_queued(&self) -> u64 {
        self.events_queued.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_monitor_reconnect(&self) -> u64 {
        self.monitor_reconnects.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_saved(&self) -> u64 {
        self.saved.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Key was not a hash.
    pub fn record_skipped(&self) -> u64 {
        self.skipped.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Durable write failed; the key was dropped.
    pub fn record_dropped(&self) -> u64 {
        self.dropped.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Live reads kept failing past the retry budget.
    pub fn record_failed(&self) -> u64 {
        self.failed.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_storer_reconnect(&self) -> u64 {
        self.storer_reconnects.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            events_received: self.events_received.load(Ordering::Relaxed),
            events_queued: self.events_queued.load(Ordering::Relaxed),
            monitor_reconnects: self.monitor_reconnects.load(Ordering::Relaxed),
            saved: self.saved.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            storer_reconnects: self.storer_reconnects.load(Ordering::Relaxed),
        }
    }
}
