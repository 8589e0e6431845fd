//! Shared traffic counters.
//!
//! One [`TrafficCounters`] instance is shared by every forward loop. All
//! mutation goes through atomics, so concurrent connections never lose an
//! update; `active_connections` is tracked by an RAII [`ConnectionGuard`].

use portgate_core::{unix_now, CounterRecord, StatsSnapshot};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Process-wide connection and byte counters.
#[derive(Debug)]
pub struct TrafficCounters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    bytes_transferred: AtomicU64,
    /// Fixed at construction; never reset.
    start_time: u64,
}

impl TrafficCounters {
    /// Fresh counters starting now.
    pub fn new() -> Self {
        Self::from_record(&CounterRecord::default())
    }

    /// Resume from a persisted record.
    ///
    /// Totals carry over; `active_connections` starts at zero because no
    /// connection survives a restart.
    pub fn from_record(record: &CounterRecord) -> Self {
        let start_time = if record.start_time == 0 {
            unix_now()
        } else {
            record.start_time
        };
        Self {
            total_connections: AtomicU64::new(record.total_connections),
            active_connections: AtomicU64::new(0),
            bytes_transferred: AtomicU64::new(record.bytes_transferred),
            start_time,
        }
    }

    /// Count a new connection. The returned guard keeps it counted as
    /// active until dropped; it is `Send` so it can move into a relay task.
    pub fn open_connection(self: &Arc<Self>) -> ConnectionGuard {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            counters: Arc::clone(self),
        }
    }

    pub fn add_bytes(&self, n: usize) {
        self.bytes_transferred.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred.load(Ordering::Relaxed)
    }

    pub fn start_time(&self) -> u64 {
        self.start_time
    }

    /// The persisted form of the current values.
    pub fn record(&self) -> CounterRecord {
        CounterRecord {
            total_connections: self.total_connections(),
            active_connections: self.active_connections(),
            bytes_transferred: self.bytes_transferred(),
            start_time: self.start_time,
        }
    }

    pub fn snapshot(&self, active_rules: usize, total_rules: usize) -> StatsSnapshot {
        StatsSnapshot {
            total_connections: self.total_connections(),
            active_connections: self.active_connections(),
            bytes_transferred: self.bytes_transferred(),
            start_time: self.start_time,
            uptime_secs: unix_now().saturating_sub(self.start_time),
            active_rules,
            total_rules,
        }
    }
}

impl Default for TrafficCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that decrements `active_connections` on drop.
pub struct ConnectionGuard {
    counters: Arc<TrafficCounters>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counters
            .active_connections
            .fetch_sub(1, Ordering::Relaxed);
    }
}
