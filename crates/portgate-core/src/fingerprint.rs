//! Content fingerprints for change detection.
//!
//! Each persisted record type spells out exactly which fields feed its
//! fingerprint and in what order, so the value stays stable across releases
//! regardless of how the on-disk encoding evolves. Fields are length-prefixed
//! before hashing so adjacent values cannot run together.

use crate::abuse::{AbuseRecord, PathHit};
use crate::counters::CounterRecord;
use crate::rule::ForwardRule;
use sha2::{Digest, Sha256};

/// A stable, hex-encoded SHA-256 over a record's persisted fields.
pub trait Fingerprint {
    fn fingerprint(&self) -> String;
}

/// Incremental hasher with typed, length-prefixed writes.
#[derive(Default)]
pub struct FingerprintBuilder {
    hasher: Sha256,
}

impl FingerprintBuilder {
    pub fn new(domain: &str) -> Self {
        let mut builder = Self::default();
        builder.str(domain);
        builder
    }

    pub fn u64(&mut self, value: u64) -> &mut Self {
        self.hasher.update([8u8]);
        self.hasher.update(value.to_be_bytes());
        self
    }

    pub fn str(&mut self, value: &str) -> &mut Self {
        self.hasher.update((value.len() as u64).to_be_bytes());
        self.hasher.update(value.as_bytes());
        self
    }

    pub fn opt_str(&mut self, value: Option<&str>) -> &mut Self {
        match value {
            Some(s) => {
                self.hasher.update([1u8]);
                self.str(s)
            }
            None => {
                self.hasher.update([0u8]);
                self
            }
        }
    }

    pub fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

impl Fingerprint for [ForwardRule] {
    fn fingerprint(&self) -> String {
        let mut b = FingerprintBuilder::new("rules/v1");
        b.u64(self.len() as u64);
        for rule in self {
            b.str(&rule.id)
                .str(rule.protocol.as_str())
                .u64(rule.local_port as u64)
                .str(&rule.remote_host)
                .u64(rule.remote_port as u64)
                .str(rule.status.as_str())
                .u64(rule.created_at)
                .opt_str(rule.last_error.as_deref());
        }
        b.finish()
    }
}

impl Fingerprint for Vec<ForwardRule> {
    fn fingerprint(&self) -> String {
        self.as_slice().fingerprint()
    }
}

impl Fingerprint for CounterRecord {
    fn fingerprint(&self) -> String {
        let mut b = FingerprintBuilder::new("counters/v1");
        b.u64(self.total_connections)
            .u64(self.active_connections)
            .u64(self.bytes_transferred)
            .u64(self.start_time);
        b.finish()
    }
}

/// `saved_at` is excluded: it changes on every write without the content
/// changing.
impl Fingerprint for AbuseRecord {
    fn fingerprint(&self) -> String {
        let mut b = FingerprintBuilder::new("abuse/v1");

        b.u64(self.failed_attempts.len() as u64);
        for (ip, times) in &self.failed_attempts {
            b.str(ip).u64(times.len() as u64);
            for t in times {
                b.u64(*t);
            }
        }

        b.u64(self.blocked_ips.len() as u64);
        for (ip, until) in &self.blocked_ips {
            b.str(ip).u64(*until);
        }

        for map in [&self.scanner_detection, &self.honeypot_hits] {
            b.u64(map.len() as u64);
            for (ip, hits) in map {
                b.str(ip);
                hit_list(&mut b, hits);
            }
        }

        b.finish()
    }
}

fn hit_list(b: &mut FingerprintBuilder, hits: &[PathHit]) {
    b.u64(hits.len() as u64);
    for hit in hits {
        b.str(&hit.path).u64(hit.time);
    }
}
