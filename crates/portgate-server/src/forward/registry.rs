//! Rule registry and lifecycle.
//!
//! [`RuleStore`] is the single owner of every forwarding rule. All inserts,
//! removals and status transitions go through one `RwLock`-guarded table,
//! so workers, the reconciler and control-plane calls never race on it.

use super::{tcp, udp, ForwardSettings, TrafficCounters, WorkerContext};
use portgate_core::{
    ForwardRule, PortgateError, PortgateResult, Protocol, RuleSpec, RuleStatus, StatsSnapshot,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long `stop_rule` waits for a worker to release its socket.
const STOP_GRACE: Duration = Duration::from_secs(2);

type RuleTable = Arc<RwLock<HashMap<String, RuleEntry>>>;

/// A rule plus its runtime-only state.
struct RuleEntry {
    rule: ForwardRule,
    /// Insertion order, used for listing.
    seq: u64,
    /// Present while a worker owns the local socket.
    worker: Option<WorkerHandle>,
}

struct WorkerHandle {
    /// Sending (or dropping) signals the worker to release its socket.
    cancel_tx: mpsc::Sender<()>,
    /// Completes once the worker has exited.
    supervisor: JoinHandle<()>,
}

enum BoundSocket {
    Tcp(TcpListener),
    Udp(UdpSocket),
}

/// Lets a worker report a fault on its own rule.
#[derive(Clone)]
pub struct RuleHandle {
    rules: RuleTable,
    rule_id: String,
}

impl RuleHandle {
    /// Move the rule to `error`. No-op if the rule was already removed.
    pub async fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut rules = self.rules.write().await;
        if let Some(entry) = rules.get_mut(&self.rule_id) {
            error!(rule_id = %self.rule_id, reason = %reason, "forward rule failed");
            entry.rule.fail(reason);
        }
    }

    /// ID of the rule this handle reports on.
    pub fn rule_id(&self) -> &str {
        &self.rule_id
    }
}

/// In-memory registry of forwarding rules, keyed by rule ID.
pub struct RuleStore {
    rules: RuleTable,
    next_seq: AtomicU64,
    counters: Arc<TrafficCounters>,
    settings: ForwardSettings,
}

impl RuleStore {
    /// Create an empty registry.
    ///
    /// # Arguments
    /// * `counters` - Shared traffic counters every worker adds to
    /// * `settings` - Timeouts handed to each worker
    pub fn new(counters: Arc<TrafficCounters>, settings: ForwardSettings) -> Self {
        Self {
            rules: Arc::new(RwLock::new(HashMap::new())),
            next_seq: AtomicU64::new(0),
            counters,
            settings,
        }
    }

    /// Create a rule and launch its worker.
    ///
    /// Returns `Err` only when the request is rejected outright (invalid
    /// spec, or an active rule already claims the `(protocol, local_port)`
    /// pair). A bind failure is not an error here: the rule is retained in
    /// `error` state and returned so the caller can inspect it.
    pub async fn start_rule(&self, spec: &RuleSpec) -> PortgateResult<ForwardRule> {
        spec.validate()?;
        self.launch(ForwardRule::new(spec)).await
    }

    /// Launch a previously persisted rule, keeping its ID and creation time.
    pub async fn rearm(&self, mut rule: ForwardRule) -> PortgateResult<ForwardRule> {
        rule.spec().validate()?;
        rule.status = RuleStatus::Starting;
        rule.last_error = None;
        self.launch(rule).await
    }

    /// Register a rule directly in `error` state, without a worker.
    ///
    /// If a rule with the same ID is already registered it is left untouched
    /// and returned instead.
    pub async fn insert_failed(&self, mut rule: ForwardRule, reason: impl Into<String>) -> ForwardRule {
        rule.fail(reason);
        let seq = self.next_seq();
        let mut rules = self.rules.write().await;
        let entry = rules.entry(rule.id.clone()).or_insert(RuleEntry {
            rule,
            seq,
            worker: None,
        });
        entry.rule.clone()
    }

    /// Stop a rule: signal its worker to release the local socket, then
    /// remove it from the registry.
    ///
    /// In-flight TCP connections are left to drain on their own.
    pub async fn stop_rule(&self, rule_id: &str) -> PortgateResult<ForwardRule> {
        let entry = self
            .rules
            .write()
            .await
            .remove(rule_id)
            .ok_or_else(|| PortgateError::UnknownRule(rule_id.to_string()))?;

        if let Some(worker) = entry.worker {
            let _ = worker.cancel_tx.send(()).await;
            if tokio::time::timeout(STOP_GRACE, worker.supervisor)
                .await
                .is_err()
            {
                warn!(rule_id, "worker did not exit within grace period");
            }
        }

        let mut rule = entry.rule;
        rule.status = RuleStatus::Stopped;
        info!(rule_id, "forward rule stopped");
        Ok(rule)
    }

    /// All rules in creation order.
    pub async fn list_rules(&self) -> Vec<ForwardRule> {
        let rules = self.rules.read().await;
        let mut entries: Vec<&RuleEntry> = rules.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.rule.clone()).collect()
    }

    /// All rules in the form written to disk (status forced to `stopped`).
    pub async fn persisted_rules(&self) -> Vec<ForwardRule> {
        self.list_rules()
            .await
            .iter()
            .map(ForwardRule::persisted)
            .collect()
    }

    /// Current state of one rule, or `None` if the ID is not registered.
    pub async fn get_rule(&self, rule_id: &str) -> Option<ForwardRule> {
        self.rules
            .read()
            .await
            .get(rule_id)
            .map(|e| e.rule.clone())
    }

    /// Whether a rule with this ID is registered, in any status.
    pub async fn contains(&self, rule_id: &str) -> bool {
        self.rules.read().await.contains_key(rule_id)
    }

    /// ID of the active rule holding `(protocol, local_port)`, if any.
    pub async fn claimant(&self, protocol: Protocol, local_port: u16) -> Option<String> {
        self.rules
            .read()
            .await
            .values()
            .find(|e| e.rule.claims(protocol, local_port))
            .map(|e| e.rule.id.clone())
    }

    /// Counter snapshot with uptime and rule counts.
    pub async fn stats(&self) -> StatsSnapshot {
        let rules = self.rules.read().await;
        let running = rules
            .values()
            .filter(|e| e.rule.status == RuleStatus::Running)
            .count();
        self.counters.snapshot(running, rules.len())
    }

    /// The traffic counters shared with every worker.
    pub fn counters(&self) -> &Arc<TrafficCounters> {
        &self.counters
    }

    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    async fn launch(&self, rule: ForwardRule) -> PortgateResult<ForwardRule> {
        let rule_id = rule.id.clone();
        let spec = rule.spec();

        {
            let mut rules = self.rules.write().await;
            if rules.contains_key(&rule_id) {
                return Err(PortgateError::Other(format!(
                    "rule {rule_id} is already registered"
                )));
            }
            if let Some(holder) = rules
                .values()
                .find(|e| e.rule.claims(spec.protocol, spec.local_port))
            {
                return Err(PortgateError::PortConflict {
                    protocol: spec.protocol.to_string(),
                    port: spec.local_port,
                    rule_id: holder.rule.id.clone(),
                });
            }
            let seq = self.next_seq();
            rules.insert(
                rule_id.clone(),
                RuleEntry {
                    rule,
                    seq,
                    worker: None,
                },
            );
        }

        info!(rule_id = %rule_id, rule = %spec, "starting forward rule");

        let socket = match bind(&spec).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!(rule_id = %rule_id, local_port = spec.local_port, error = %e, "bind failed");
                let reason = PortgateError::Bind(format!("local port {}: {e}", spec.local_port));
                return self.mark_failed(&rule_id, reason.to_string()).await;
            }
        };

        let mut rules = self.rules.write().await;
        let Some(entry) = rules.get_mut(&rule_id) else {
            // Stopped while binding; dropping the socket releases the port.
            debug!(rule_id = %rule_id, "rule removed before its worker started");
            return Err(PortgateError::UnknownRule(rule_id));
        };

        let ctx = WorkerContext {
            rule_id: rule_id.clone(),
            remote_addr: spec.remote_addr(),
            counters: Arc::clone(&self.counters),
            reporter: RuleHandle {
                rules: Arc::clone(&self.rules),
                rule_id: rule_id.clone(),
            },
            settings: self.settings.clone(),
        };
        let reporter = ctx.reporter.clone();

        let (cancel_tx, cancel_rx) = mpsc::channel::<()>(1);
        let worker = match socket {
            BoundSocket::Tcp(listener) => tokio::spawn(tcp::accept_loop(listener, cancel_rx, ctx)),
            BoundSocket::Udp(socket) => tokio::spawn(udp::relay_loop(socket, cancel_rx, ctx)),
        };
        let supervisor = tokio::spawn(supervise(worker, reporter));

        entry.rule.status = RuleStatus::Running;
        entry.worker = Some(WorkerHandle {
            cancel_tx,
            supervisor,
        });
        info!(rule_id = %rule_id, rule = %spec, "forward rule running");
        Ok(entry.rule.clone())
    }

    async fn mark_failed(&self, rule_id: &str, reason: String) -> PortgateResult<ForwardRule> {
        let mut rules = self.rules.write().await;
        let entry = rules
            .get_mut(rule_id)
            .ok_or_else(|| PortgateError::UnknownRule(rule_id.to_string()))?;
        entry.rule.fail(reason);
        Ok(entry.rule.clone())
    }
}

async fn bind(spec: &RuleSpec) -> std::io::Result<BoundSocket> {
    let addr = ("0.0.0.0", spec.local_port);
    Ok(match spec.protocol {
        Protocol::Tcp => BoundSocket::Tcp(TcpListener::bind(addr).await?),
        Protocol::Udp => BoundSocket::Udp(UdpSocket::bind(addr).await?),
    })
}

/// Wait for a worker and turn a panic into an `error` status on its rule.
async fn supervise(worker: JoinHandle<()>, reporter: RuleHandle) {
    match worker.await {
        Ok(()) => debug!(rule_id = %reporter.rule_id(), "worker exited"),
        Err(e) if e.is_panic() => {
            let reason = panic_message(e.into_panic());
            reporter.fail(format!("worker panicked: {reason}")).await;
        }
        Err(_) => debug!(rule_id = %reporter.rule_id(), "worker cancelled"),
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{free_tcp_port, free_udp_port};

    fn store() -> RuleStore {
        RuleStore::new(Arc::new(TrafficCounters::new()), ForwardSettings::default())
    }

    fn handle_for(store: &RuleStore, rule_id: &str) -> RuleHandle {
        RuleHandle {
            rules: Arc::clone(&store.rules),
            rule_id: rule_id.to_string(),
        }
    }

    async fn start_tcp(store: &RuleStore) -> ForwardRule {
        store
            .start_rule(&RuleSpec::new(Protocol::Tcp, free_tcp_port(), "127.0.0.1", 9))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn start_then_list_shows_one_matching_rule() {
        let store = store();
        let port = free_tcp_port();
        let spec = RuleSpec::new(Protocol::Tcp, port, "127.0.0.1", 9);

        let rule = store.start_rule(&spec).await.unwrap();
        let listed = store.list_rules().await;

        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, rule.id);
        assert_eq!(listed[0].spec(), spec);
        assert!(listed[0].status.is_active(), "status: {}", listed[0].status);
    }

    #[tokio::test]
    async fn duplicate_pair_is_rejected() {
        let store = store();
        let port = free_tcp_port();
        let spec = RuleSpec::new(Protocol::Tcp, port, "127.0.0.1", 9);

        let first = store.start_rule(&spec).await.unwrap();
        assert_eq!(first.status, RuleStatus::Running);

        let err = store.start_rule(&spec).await.unwrap_err();
        assert!(matches!(err, PortgateError::PortConflict { .. }));
        assert_eq!(store.list_rules().await.len(), 1);
    }

    #[tokio::test]
    async fn same_port_on_other_protocol_is_allowed() {
        let store = store();
        let port = free_udp_port();
        let udp = RuleSpec::new(Protocol::Udp, port, "127.0.0.1", 9);
        store.start_rule(&udp).await.unwrap();
        assert_eq!(store.claimant(Protocol::Tcp, port).await, None);
        assert!(store.claimant(Protocol::Udp, port).await.is_some());
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_unknown_ids_fail() {
        let store = store();
        let port = free_tcp_port();
        let rule = store
            .start_rule(&RuleSpec::new(Protocol::Tcp, port, "127.0.0.1", 9))
            .await
            .unwrap();

        assert!(store.stop_rule("nope").await.is_err());
        assert_eq!(store.list_rules().await.len(), 1);

        let stopped = store.stop_rule(&rule.id).await.unwrap();
        assert_eq!(stopped.status, RuleStatus::Stopped);
        assert!(store.list_rules().await.is_empty());

        assert!(matches!(
            store.stop_rule(&rule.id).await,
            Err(PortgateError::UnknownRule(_))
        ));
    }

    #[tokio::test]
    async fn stop_releases_the_local_port() {
        let store = store();
        let port = free_tcp_port();
        let rule = store
            .start_rule(&RuleSpec::new(Protocol::Tcp, port, "127.0.0.1", 9))
            .await
            .unwrap();
        store.stop_rule(&rule.id).await.unwrap();

        let rebound = TcpListener::bind(("0.0.0.0", port)).await;
        assert!(rebound.is_ok(), "port still held: {:?}", rebound.err());
    }

    #[tokio::test]
    async fn bind_failure_leaves_rule_in_error() {
        let store = store();
        let port = free_tcp_port();
        let _occupant = std::net::TcpListener::bind(("0.0.0.0", port)).unwrap();

        let rule = store
            .start_rule(&RuleSpec::new(Protocol::Tcp, port, "127.0.0.1", 9))
            .await
            .unwrap();
        assert_eq!(rule.status, RuleStatus::Error);
        assert!(rule.last_error.as_deref().unwrap().starts_with("bind failed"));

        let listed = store.list_rules().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, RuleStatus::Error);
        // A failed rule does not hold the pair.
        assert_eq!(store.claimant(Protocol::Tcp, port).await, None);
    }

    #[tokio::test]
    async fn invalid_spec_is_rejected_without_registering() {
        let store = store();
        let spec = RuleSpec::new(Protocol::Tcp, 0, "127.0.0.1", 9);
        assert!(matches!(
            store.start_rule(&spec).await,
            Err(PortgateError::InvalidRule(_))
        ));
        assert!(store.list_rules().await.is_empty());
    }

    #[tokio::test]
    async fn rearm_keeps_identity_and_persists_as_stopped() {
        let store = store();
        let port = free_tcp_port();
        let mut saved = ForwardRule::new(&RuleSpec::new(Protocol::Tcp, port, "127.0.0.1", 9));
        saved.created_at = 1_600_000_000;
        saved.fail("old failure");

        let rule = store.rearm(saved.clone()).await.unwrap();
        assert_eq!(rule.id, saved.id);
        assert_eq!(rule.created_at, 1_600_000_000);
        assert_eq!(rule.status, RuleStatus::Running);
        assert!(rule.last_error.is_none());

        let persisted = store.persisted_rules().await;
        assert_eq!(persisted[0].status, RuleStatus::Stopped);
        assert_eq!(store.stats().await.active_rules, 1);
    }

    #[tokio::test]
    async fn list_preserves_creation_order() {
        let store = store();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let port = free_tcp_port();
            let rule = store
                .start_rule(&RuleSpec::new(Protocol::Tcp, port, "127.0.0.1", 9))
                .await
                .unwrap();
            ids.push(rule.id);
        }
        let listed: Vec<String> = store.list_rules().await.into_iter().map(|r| r.id).collect();
        assert_eq!(listed, ids);
    }

    #[tokio::test]
    async fn worker_panic_moves_only_its_rule_to_error() {
        let store = store();
        let crashed = start_tcp(&store).await;
        let healthy = start_tcp(&store).await;

        let worker = tokio::spawn(async { panic!("relay state corrupted") });
        supervise(worker, handle_for(&store, &crashed.id)).await;

        let crashed = store.get_rule(&crashed.id).await.unwrap();
        assert_eq!(crashed.status, RuleStatus::Error);
        let reason = crashed.last_error.as_deref().unwrap();
        assert!(reason.starts_with("worker panicked"), "reason: {reason}");
        assert!(reason.contains("relay state corrupted"), "reason: {reason}");

        let healthy_now = store.get_rule(&healthy.id).await.unwrap();
        assert_eq!(healthy_now.status, RuleStatus::Running);
        assert!(healthy_now.last_error.is_none());
        let stream = tokio::net::TcpStream::connect(("127.0.0.1", healthy.local_port)).await;
        assert!(stream.is_ok(), "healthy rule stopped accepting");
        assert_eq!(store.stats().await.active_rules, 1);
    }

    #[tokio::test]
    async fn clean_worker_exit_keeps_status() {
        let store = store();
        let rule = start_tcp(&store).await;
        supervise(tokio::spawn(async {}), handle_for(&store, &rule.id)).await;
        assert_eq!(store.get_rule(&rule.id).await.unwrap().status, RuleStatus::Running);
    }

    #[tokio::test]
    async fn listener_fault_leaves_rule_listed_in_error() {
        let store = store();
        let faulty = start_tcp(&store).await;
        let other = start_tcp(&store).await;

        handle_for(&store, &faulty.id)
            .fail("listener error: too many open files")
            .await;

        let listed = store.list_rules().await;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].status, RuleStatus::Error);
        assert_eq!(
            listed[0].last_error.as_deref(),
            Some("listener error: too many open files")
        );
        assert_eq!(listed[1].status, RuleStatus::Running);
        // The faulted rule gives up its pair and can still be stopped.
        assert_eq!(store.claimant(Protocol::Tcp, faulty.local_port).await, None);
        assert_eq!(
            store.claimant(Protocol::Tcp, other.local_port).await,
            Some(other.id.clone())
        );
        store.stop_rule(&faulty.id).await.unwrap();
        assert_eq!(store.list_rules().await.len(), 1);
    }

    #[tokio::test]
    async fn fault_on_removed_rule_is_ignored() {
        let store = store();
        let rule = start_tcp(&store).await;
        let handle = handle_for(&store, &rule.id);
        store.stop_rule(&rule.id).await.unwrap();
        handle.fail("socket error: late").await;
        assert!(store.get_rule(&rule.id).await.is_none());
    }

    #[test]
    fn panic_payloads_become_messages() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(42u32)), "unknown panic");
    }
}
