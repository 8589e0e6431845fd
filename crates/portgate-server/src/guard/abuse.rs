//! Failed-login lockout, scanner detection and honeypot blocking.
//!
//! [`AbuseTracker`] holds the state and the rules, with explicit `now`
//! arguments so every window and expiry is deterministic. [`AbuseGuard`] is
//! the shared, lock-protected wrapper the rest of the server talks to.

use portgate_core::{unix_now, AbuseRecord, PathHit};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Thresholds, windows and block lengths, in seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardPolicy {
    /// Failures inside the window that trigger a lockout.
    pub max_failed_attempts: usize,
    pub failed_attempt_window: u64,
    pub failed_attempt_block: u64,
    /// Missing-path requests inside the window that mark a scanner.
    pub scanner_threshold: usize,
    pub scanner_window: u64,
    pub scanner_block: u64,
    /// A single honeypot hit blocks for this long.
    pub honeypot_block: u64,
}

impl Default for GuardPolicy {
    fn default() -> Self {
        Self {
            max_failed_attempts: 5,
            failed_attempt_window: 3600,
            failed_attempt_block: 300,
            scanner_threshold: 3,
            scanner_window: 1800,
            scanner_block: 3600,
            honeypot_block: 7200,
        }
    }
}

/// Counts reported on the security status view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbuseSummary {
    pub blocked_ips: usize,
    pub failed_attempt_ips: usize,
    pub scanner_ips: usize,
    pub honeypot_ips: usize,
}

/// Abuse state plus the policy that drives it.
#[derive(Debug)]
pub struct AbuseTracker {
    policy: GuardPolicy,
    state: AbuseRecord,
}

impl AbuseTracker {
    pub fn new(policy: GuardPolicy) -> Self {
        Self {
            policy,
            state: AbuseRecord::default(),
        }
    }

    /// Resume from persisted state, dropping blocks that lapsed while the
    /// process was down.
    pub fn from_record(policy: GuardPolicy, mut record: AbuseRecord, now: u64) -> Self {
        record.blocked_ips.retain(|_, until| now < *until);
        Self {
            policy,
            state: record,
        }
    }

    /// True while a block is in force. An expired block is evicted.
    pub fn is_blocked_at(&mut self, ip: &str, now: u64) -> bool {
        match self.state.blocked_ips.get(ip) {
            Some(until) if now < *until => true,
            Some(_) => {
                self.state.blocked_ips.remove(ip);
                debug!(ip, "block expired");
                false
            }
            None => false,
        }
    }

    /// Note a failed authentication. Returns `true` if this failure caused
    /// a lockout.
    pub fn record_failed_attempt_at(&mut self, ip: &str, now: u64) -> bool {
        let window = self.policy.failed_attempt_window;
        let attempts = self.state.failed_attempts.entry(ip.to_string()).or_default();
        attempts.retain(|t| now.saturating_sub(*t) < window);
        attempts.push(now);

        let count = attempts.len();
        if count >= self.policy.max_failed_attempts {
            self.block(ip, now + self.policy.failed_attempt_block);
            warn!(ip, attempts = count, "IP locked out after repeated failed attempts");
            true
        } else {
            debug!(ip, attempts = count, "failed attempt recorded");
            false
        }
    }

    /// Note a request for a missing path. Returns `true` if the IP is now
    /// treated as a scanner and blocked.
    pub fn record_scanner_behavior_at(&mut self, ip: &str, path: &str, now: u64) -> bool {
        let window = self.policy.scanner_window;
        let hits = self
            .state
            .scanner_detection
            .entry(ip.to_string())
            .or_default();
        hits.push(PathHit::new(path, now));
        hits.retain(|h| now.saturating_sub(h.time) < window);

        if hits.len() >= self.policy.scanner_threshold {
            let paths: Vec<&str> = hits.iter().map(|h| h.path.as_str()).collect();
            warn!(ip, paths = ?paths, "scanner detected and blocked");
            self.block(ip, now + self.policy.scanner_block);
            true
        } else {
            false
        }
    }

    /// Note a honeypot hit. One hit is enough to block.
    pub fn record_honeypot_hit_at(&mut self, ip: &str, path: &str, now: u64) {
        self.state
            .honeypot_hits
            .entry(ip.to_string())
            .or_default()
            .push(PathHit::new(path, now));
        self.block(ip, now + self.policy.honeypot_block);
        error!(ip, path, "honeypot triggered");
    }

    /// Forget failures after a successful authentication.
    pub fn clear_failed_attempts(&mut self, ip: &str) {
        if self.state.failed_attempts.remove(ip).is_some() {
            debug!(ip, "failed attempts cleared");
        }
    }

    /// When the block on `ip` lifts, if one is recorded.
    pub fn blocked_until(&self, ip: &str) -> Option<u64> {
        self.state.blocked_ips.get(ip).copied()
    }

    /// Drop expired blocks and empty or stale windows. Honeypot hits are
    /// kept for audit.
    pub fn gc_at(&mut self, now: u64) {
        let failed_window = self.policy.failed_attempt_window;
        let scanner_window = self.policy.scanner_window;

        self.state.blocked_ips.retain(|_, until| now < *until);
        self.state.failed_attempts.retain(|_, times| {
            times.retain(|t| now.saturating_sub(*t) < failed_window);
            !times.is_empty()
        });
        self.state.scanner_detection.retain(|_, hits| {
            hits.retain(|h| now.saturating_sub(h.time) < scanner_window);
            !hits.is_empty()
        });
    }

    pub fn summary(&self) -> AbuseSummary {
        AbuseSummary {
            blocked_ips: self.state.blocked_ips.len(),
            failed_attempt_ips: self.state.failed_attempts.len(),
            scanner_ips: self.state.scanner_detection.len(),
            honeypot_ips: self.state.honeypot_hits.len(),
        }
    }

    /// Snapshot for persistence. `saved_at` is filled in by the writer.
    pub fn record(&self) -> AbuseRecord {
        AbuseRecord {
            saved_at: 0,
            ..self.state.clone()
        }
    }

    /// A block never shortens one already in force.
    fn block(&mut self, ip: &str, until: u64) {
        let entry = self.state.blocked_ips.entry(ip.to_string()).or_insert(until);
        if *entry < until {
            *entry = until;
        }
    }
}

/// Shared abuse guard, consulted before any control-plane request.
pub struct AbuseGuard {
    tracker: Mutex<AbuseTracker>,
}

impl AbuseGuard {
    pub fn new(policy: GuardPolicy) -> Self {
        Self::from_tracker(AbuseTracker::new(policy))
    }

    pub fn from_tracker(tracker: AbuseTracker) -> Self {
        Self {
            tracker: Mutex::new(tracker),
        }
    }

    pub async fn is_blocked(&self, ip: &str) -> bool {
        self.tracker.lock().await.is_blocked_at(ip, unix_now())
    }

    pub async fn record_failed_attempt(&self, ip: &str) -> bool {
        self.tracker
            .lock()
            .await
            .record_failed_attempt_at(ip, unix_now())
    }

    pub async fn record_scanner_behavior(&self, ip: &str, path: &str) -> bool {
        self.tracker
            .lock()
            .await
            .record_scanner_behavior_at(ip, path, unix_now())
    }

    pub async fn record_honeypot_hit(&self, ip: &str, path: &str) {
        self.tracker
            .lock()
            .await
            .record_honeypot_hit_at(ip, path, unix_now())
    }

    pub async fn clear_failed_attempts(&self, ip: &str) {
        self.tracker.lock().await.clear_failed_attempts(ip)
    }

    pub async fn gc(&self) {
        self.tracker.lock().await.gc_at(unix_now())
    }

    pub async fn summary(&self) -> AbuseSummary {
        self.tracker.lock().await.summary()
    }

    pub async fn record(&self) -> AbuseRecord {
        self.tracker.lock().await.record()
    }

    /// Replace the in-memory state with a freshly loaded record.
    pub async fn replace(&self, record: AbuseRecord) {
        let mut tracker = self.tracker.lock().await;
        let policy = tracker.policy.clone();
        *tracker = AbuseTracker::from_record(policy, record, unix_now());
        info!(blocked = tracker.state.blocked_ips.len(), "abuse state reloaded");
    }
}
