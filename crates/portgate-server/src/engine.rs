//! The engine facade handed to a control plane.
//!
//! [`Engine`] ties together the rule registry, the abuse guard and the
//! persistence store. Every control-plane operation goes through here, so
//! the port-conflict checks and the save paths live in one place.

use crate::forward::{availability, ForwardSettings, RuleStore, TrafficCounters};
use crate::guard::{AbuseGuard, AbuseSummary, AbuseTracker, GuardPolicy, RequestScreen, Verdict};
use crate::reconciler::{self, RestoreReport};
use crate::store::{PersistenceStatus, PersistenceStore, RecordKind, SaveOutcome, StorageSettings};
use portgate_core::{
    unix_now, AbuseRecord, CounterRecord, ForwardRule, PortgateError, PortgateResult, RuleSpec,
    StatsSnapshot,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Everything needed to open an engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub storage: StorageSettings,
    pub guard: GuardPolicy,
    pub forward: ForwardSettings,
    /// Path prefix the control plane is served under.
    pub protected_prefix: String,
}

impl EngineConfig {
    /// Defaults for everything except where the records live.
    pub fn new(storage: StorageSettings) -> Self {
        Self {
            storage,
            guard: GuardPolicy::default(),
            forward: ForwardSettings::default(),
            protected_prefix: "/portgate".to_string(),
        }
    }
}

/// Outcome of one item in a batch request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    /// The rule spec or rule ID the item refers to.
    pub target: String,
    pub success: bool,
    pub rule: Option<ForwardRule>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchReport {
    pub items: Vec<BatchItem>,
    pub succeeded: usize,
    pub failed: usize,
}

impl BatchReport {
    fn push(&mut self, target: String, result: PortgateResult<ForwardRule>) {
        let item = match result {
            Ok(rule) => {
                self.succeeded += 1;
                BatchItem {
                    target,
                    success: true,
                    rule: Some(rule),
                    error: None,
                }
            }
            Err(e) => {
                self.failed += 1;
                BatchItem {
                    target,
                    success: false,
                    rule: None,
                    error: Some(e.to_string()),
                }
            }
        };
        self.items.push(item);
    }
}

/// What a save pass did, per record kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SaveReport {
    pub written: Vec<RecordKind>,
    pub unchanged: Vec<RecordKind>,
    pub failed: Vec<(RecordKind, String)>,
    pub backups_removed: usize,
}

impl SaveReport {
    /// True when no record failed to save.
    pub fn is_ok(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Which records differ from what is on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingChanges {
    pub rules: bool,
    pub counters: bool,
    pub abuse: bool,
}

impl PendingChanges {
    pub fn any(&self) -> bool {
        self.rules || self.counters || self.abuse
    }
}

/// Owner of the running forwarding state.
pub struct Engine {
    rules: RuleStore,
    guard: AbuseGuard,
    screen: RequestScreen,
    store: PersistenceStore,
}

impl Engine {
    /// Open the storage directory and resume counters and abuse state.
    ///
    /// Fails only if the storage directory cannot be created. An unreadable
    /// record is logged and replaced with defaults. Persisted rules are not
    /// started here; see [`crate::reconciler::Reconciler::restore`].
    pub async fn open(config: EngineConfig) -> PortgateResult<Self> {
        let store = PersistenceStore::open(config.storage).await?;

        let counters: CounterRecord = load_or_default(&store, RecordKind::Counters).await;
        let abuse: AbuseRecord = load_or_default(&store, RecordKind::Abuse).await;

        let counters = Arc::new(TrafficCounters::from_record(&counters));
        let tracker = AbuseTracker::from_record(config.guard, abuse, unix_now());

        info!(
            data_dir = %store.data_dir().display(),
            total_connections = counters.total_connections(),
            bytes_transferred = counters.bytes_transferred(),
            "engine opened"
        );

        Ok(Self {
            rules: RuleStore::new(counters, config.forward),
            guard: AbuseGuard::from_tracker(tracker),
            screen: RequestScreen::new(config.protected_prefix),
            store,
        })
    }

    /// Start a new forwarding rule and save the rule list.
    ///
    /// Rejected with `PortConflict` if an active rule already holds the
    /// `(protocol, local_port)` pair, or `PortInUse` if something else on
    /// the host does. A bind failure after these checks is not an error:
    /// the returned rule is in `error` state and is saved like any other.
    ///
    /// # Arguments
    /// * `spec` - Protocol, local port and remote target of the new rule
    pub async fn start_rule(&self, spec: &RuleSpec) -> PortgateResult<ForwardRule> {
        spec.validate()?;
        if let Some(holder) = self.rules.claimant(spec.protocol, spec.local_port).await {
            return Err(PortgateError::PortConflict {
                protocol: spec.protocol.to_string(),
                port: spec.local_port,
                rule_id: holder,
            });
        }
        if !availability::port_is_free(spec.protocol, spec.local_port).await {
            return Err(PortgateError::PortInUse(spec.local_port));
        }
        let rule = self.rules.start_rule(spec).await?;
        self.persist_rules().await;
        Ok(rule)
    }

    /// Start each spec in order; one failure does not stop the rest.
    pub async fn start_rules(&self, specs: &[RuleSpec]) -> BatchReport {
        let mut report = BatchReport::default();
        for spec in specs {
            report.push(spec.to_string(), self.start_rule(spec).await);
        }
        info!(succeeded = report.succeeded, failed = report.failed, "batch start finished");
        report
    }

    /// Stop a rule, release its local port and save the rule list.
    ///
    /// # Arguments
    /// * `rule_id` - ID returned by [`Engine::start_rule`]
    pub async fn stop_rule(&self, rule_id: &str) -> PortgateResult<ForwardRule> {
        let rule = self.rules.stop_rule(rule_id).await?;
        self.persist_rules().await;
        Ok(rule)
    }

    /// Stop each ID in order, reporting unknown IDs per item.
    pub async fn stop_rules(&self, rule_ids: &[String]) -> BatchReport {
        let mut report = BatchReport::default();
        for id in rule_ids {
            report.push(id.clone(), self.stop_rule(id).await);
        }
        info!(succeeded = report.succeeded, failed = report.failed, "batch stop finished");
        report
    }

    /// All registered rules in creation order.
    pub async fn list_rules(&self) -> Vec<ForwardRule> {
        self.rules.list_rules().await
    }

    /// Traffic totals plus active and total rule counts.
    pub async fn stats(&self) -> StatsSnapshot {
        self.rules.stats().await
    }

    /// The rule registry.
    pub fn rules(&self) -> &RuleStore {
        &self.rules
    }

    /// The abuse guard shared by request screening.
    pub fn guard(&self) -> &AbuseGuard {
        &self.guard
    }

    /// The persistence store backing every record.
    pub fn store(&self) -> &PersistenceStore {
        &self.store
    }

    /// Gate one control-plane request.
    ///
    /// # Arguments
    /// * `ip` - Client address as seen by the control plane
    /// * `path` - Request path, including the control-plane prefix
    /// * `user_agent` - `User-Agent` header, if sent
    pub async fn screen_request(&self, ip: &str, path: &str, user_agent: Option<&str>) -> Verdict {
        self.screen.screen(&self.guard, ip, path, user_agent).await
    }

    /// Counts of blocked addresses and recorded abuse.
    pub async fn security_summary(&self) -> AbuseSummary {
        self.guard.summary().await
    }

    /// File, backup and autosave details for the data directory.
    pub async fn persistence_status(&self) -> PortgateResult<PersistenceStatus> {
        self.store.status().await
    }

    /// Save whatever changed and trim old backups.
    pub async fn save_now(&self) -> SaveReport {
        let mut report = self.save_records(false).await;
        match self.store.cleanup_backups().await {
            Ok(removed) => report.backups_removed = removed,
            Err(e) => warn!(error = %e, "backup cleanup failed"),
        }
        report
    }

    /// Write all three records even if nothing changed.
    pub async fn flush_all(&self) -> SaveReport {
        self.save_records(true).await
    }

    /// Compare current state with the last saved fingerprints. Nothing is
    /// written and the fingerprints are left as they are.
    pub async fn pending_changes(&self) -> PendingChanges {
        let rules = self.rules.persisted_rules().await;
        let counters = self.rules.counters().record();
        let abuse = self.guard.record().await;
        PendingChanges {
            rules: self.store.is_changed(RecordKind::Rules, &rules).await,
            counters: self.store.is_changed(RecordKind::Counters, &counters).await,
            abuse: self.store.is_changed(RecordKind::Abuse, &abuse).await,
        }
    }

    /// Reload abuse state from disk and re-arm persisted rules that are not
    /// currently registered.
    ///
    /// Both records are read before anything is applied. If either cannot
    /// be loaded the error is returned and in-memory state is left as is.
    pub async fn reload(&self) -> PortgateResult<RestoreReport> {
        let abuse: AbuseRecord = self.store.load(RecordKind::Abuse).await?;
        let persisted: Vec<ForwardRule> = self.store.load(RecordKind::Rules).await?;
        self.guard.replace(abuse).await;
        Ok(reconciler::restore_rules(&self.rules, persisted).await)
    }

    /// Save the rule list now. A failed write is logged and left to the
    /// next periodic save.
    async fn persist_rules(&self) {
        let rules = self.rules.persisted_rules().await;
        if let Err(e) = self.store.save(RecordKind::Rules, &rules).await {
            warn!(error = %e, "cannot save rules, will retry on next tick");
        }
    }

    async fn save_records(&self, force: bool) -> SaveReport {
        let rules = self.rules.persisted_rules().await;
        let counters = self.rules.counters().record();
        let mut abuse = self.guard.record().await;
        abuse.saved_at = unix_now();

        let mut report = SaveReport::default();
        let results = [
            (RecordKind::Rules, self.save_one(RecordKind::Rules, &rules, force).await),
            (RecordKind::Counters, self.save_one(RecordKind::Counters, &counters, force).await),
            (RecordKind::Abuse, self.save_one(RecordKind::Abuse, &abuse, force).await),
        ];
        for (kind, result) in results {
            match result {
                Ok(SaveOutcome::Written) => report.written.push(kind),
                Ok(SaveOutcome::Unchanged) => report.unchanged.push(kind),
                Err(e) => {
                    warn!(kind = %kind, error = %e, "save failed, previous file kept");
                    report.failed.push((kind, e.to_string()));
                }
            }
        }
        report
    }

    async fn save_one<T>(&self, kind: RecordKind, value: &T, force: bool) -> PortgateResult<SaveOutcome>
    where
        T: Serialize + portgate_core::Fingerprint + ?Sized,
    {
        if force {
            self.store.force_save(kind, value).await?;
            Ok(SaveOutcome::Written)
        } else {
            self.store.save(kind, value).await
        }
    }
}

/// Load a record, falling back to defaults if the file cannot be decoded.
pub(crate) async fn load_or_default<T>(store: &PersistenceStore, kind: RecordKind) -> T
where
    T: DeserializeOwned + Default + portgate_core::Fingerprint,
{
    match store.load(kind).await {
        Ok(value) => value,
        Err(e) => {
            warn!(kind = %kind, error = %e, "cannot load record, starting from defaults");
            T::default()
        }
    }
}
