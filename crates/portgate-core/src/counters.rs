//! Process-wide traffic counter records.

use crate::clock::unix_now;
use serde::{Deserialize, Serialize};

/// Persisted form of the shared traffic counters.
///
/// Every field defaults when absent so older files keep loading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CounterRecord {
    pub total_connections: u64,
    pub active_connections: u64,
    pub bytes_transferred: u64,
    /// Unix seconds at which counting began.
    pub start_time: u64,
}

impl Default for CounterRecord {
    fn default() -> Self {
        Self {
            total_connections: 0,
            active_connections: 0,
            bytes_transferred: 0,
            start_time: unix_now(),
        }
    }
}

/// Counters plus derived figures, as handed to the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total_connections: u64,
    pub active_connections: u64,
    pub bytes_transferred: u64,
    pub start_time: u64,
    pub uptime_secs: u64,
    /// Rules currently in `running` state.
    pub active_rules: usize,
    /// All rules in the registry, including failed ones.
    pub total_rules: usize,
}
