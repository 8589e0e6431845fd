//! Persisted abuse-detection state.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One observed request path with the unix second it was seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathHit {
    pub path: String,
    pub time: u64,
}

impl PathHit {
    pub fn new(path: impl Into<String>, time: u64) -> Self {
        Self {
            path: path.into(),
            time,
        }
    }
}

/// Snapshot of everything the abuse guard knows, keyed by client IP.
///
/// Maps are ordered so that serialization and fingerprints are stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AbuseRecord {
    /// IP → failure timestamps inside the rolling window, oldest first.
    pub failed_attempts: BTreeMap<String, Vec<u64>>,
    /// IP → unix second at which the block lifts.
    pub blocked_ips: BTreeMap<String, u64>,
    /// IP → missing-path probes inside the scanner window.
    pub scanner_detection: BTreeMap<String, Vec<PathHit>>,
    /// IP → honeypot hits, kept indefinitely.
    pub honeypot_hits: BTreeMap<String, Vec<PathHit>>,
    /// When this record was written. Not part of the content fingerprint.
    pub saved_at: u64,
}
