//! Startup restore and periodic flushing.
//!
//! On startup every persisted rule is re-armed if its local port is free,
//! or registered in `error` state if not, so it stays visible. While
//! running, a timer saves whatever changed, trims old backups and expires
//! stale abuse entries.

use crate::engine::{load_or_default, Engine, SaveReport};
use crate::forward::{availability, RuleStore};
use crate::store::RecordKind;
use portgate_core::{ForwardRule, PortgateError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Counts from one restore pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreReport {
    /// Re-armed and running (or failed at bind, see the rule's status).
    pub restored: usize,
    /// Registered in `error` state because the port was taken.
    pub failed: usize,
    /// Already in the registry.
    pub skipped: usize,
}

/// Re-arm persisted rules that are not registered yet.
pub async fn restore_rules(rules: &RuleStore, persisted: Vec<ForwardRule>) -> RestoreReport {
    let mut report = RestoreReport::default();

    for rule in persisted {
        if rules.contains(&rule.id).await {
            report.skipped += 1;
            continue;
        }

        let spec = rule.spec();
        if !availability::port_is_free(spec.protocol, spec.local_port).await {
            warn!(rule_id = %rule.id, local_port = spec.local_port, "port taken, rule not restored");
            let reason = format!("local port {} is already in use", spec.local_port);
            rules.insert_failed(rule, reason).await;
            report.failed += 1;
            continue;
        }

        match rules.rearm(rule.clone()).await {
            Ok(restored) => {
                debug!(rule_id = %restored.id, status = %restored.status, "rule restored");
                report.restored += 1;
            }
            Err(PortgateError::PortConflict { rule_id: holder, .. }) => {
                let reason = format!(
                    "local port {} is already claimed by rule {holder}",
                    spec.local_port
                );
                rules.insert_failed(rule, reason).await;
                report.failed += 1;
            }
            Err(e) => {
                rules.insert_failed(rule, e.to_string()).await;
                report.failed += 1;
            }
        }
    }

    info!(
        restored = report.restored,
        failed = report.failed,
        skipped = report.skipped,
        "rule restore finished"
    );
    report
}

/// Drives restore on startup and the periodic flush.
pub struct Reconciler {
    engine: Arc<Engine>,
}

impl Reconciler {
    /// Wrap a shared engine; several reconcilers may drive the same one.
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Restore the rules saved by the previous run.
    pub async fn restore(&self) -> RestoreReport {
        let persisted: Vec<ForwardRule> =
            load_or_default(self.engine.store(), RecordKind::Rules).await;
        if persisted.is_empty() {
            debug!("no persisted rules to restore");
            return RestoreReport::default();
        }
        restore_rules(self.engine.rules(), persisted).await
    }

    /// One reconciliation step.
    pub async fn tick(&self) -> SaveReport {
        self.engine.guard().gc().await;
        let report = self.engine.save_now().await;
        if !report.written.is_empty() || report.backups_removed > 0 {
            debug!(
                written = ?report.written,
                backups_removed = report.backups_removed,
                "reconciliation tick"
            );
        }
        report
    }

    /// Tick every `interval` until `shutdown` fires.
    pub async fn run(self, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut timer = tokio::time::interval(interval);
        // The first tick completes immediately; startup state was just loaded.
        timer.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("reconciler stopping");
                    break;
                }
                _ = timer.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    /// Unconditional save of every record, used on shutdown.
    pub async fn final_flush(&self) -> SaveReport {
        let report = self.engine.flush_all().await;
        if report.is_ok() {
            info!("final flush complete");
        } else {
            warn!(failed = ?report.failed, "final flush incomplete");
        }
        report
    }
}
