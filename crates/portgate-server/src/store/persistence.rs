//! Durable JSON storage with change detection and rolling backups.
//!
//! Three record kinds live side by side in the data directory. A save is
//! skipped when the content fingerprint matches the last one written or
//! loaded. A real write goes to a temporary file first; the previous file
//! is then copied into `backups/` and the temporary file is renamed over it,
//! so a crash leaves either the old or the new content in place.

use portgate_core::{unix_millis, unix_now, Fingerprint, PortgateResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const BACKUP_DIR: &str = "backups";

/// The persisted record kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Rules,
    Counters,
    Abuse,
}

impl RecordKind {
    pub const ALL: [RecordKind; 3] = [RecordKind::Rules, RecordKind::Counters, RecordKind::Abuse];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Rules => "rules",
            RecordKind::Counters => "counters",
            RecordKind::Abuse => "abuse",
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.json", self.as_str())
    }

    fn backup_prefix(&self) -> String {
        format!("{}_backup_", self.as_str())
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a save touched the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Written,
    Unchanged,
}

/// One record file as seen on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileStatus {
    pub kind: RecordKind,
    pub path: PathBuf,
    pub exists: bool,
    pub size: u64,
    /// Unix seconds of the last modification.
    pub modified: Option<u64>,
    /// Fingerprint of the content last written or loaded.
    pub fingerprint: Option<String>,
    pub backups: usize,
}

/// Overview of the storage directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceStatus {
    pub data_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub files: Vec<FileStatus>,
    pub total_backups: usize,
    pub backup_limit: usize,
    pub autosave_interval_secs: u64,
    pub checked_at: u64,
}

/// Where and how records are stored.
#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub data_dir: PathBuf,
    /// Backups kept per record kind.
    pub backup_limit: usize,
    /// Time between reconciliation ticks.
    pub autosave_interval: Duration,
}

impl StorageSettings {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            backup_limit: 3,
            autosave_interval: Duration::from_secs(30),
        }
    }
}

/// File-backed store for rules, counters and abuse state.
pub struct PersistenceStore {
    settings: StorageSettings,
    backup_dir: PathBuf,
    /// Last fingerprint per kind. Held across a whole save so writes of the
    /// same kind never interleave.
    fingerprints: Mutex<HashMap<RecordKind, String>>,
    backup_seq: AtomicU64,
}

impl PersistenceStore {
    /// Open (creating if needed) the data directory and its backup folder.
    pub async fn open(settings: StorageSettings) -> PortgateResult<Self> {
        let backup_dir = settings.data_dir.join(BACKUP_DIR);
        tokio::fs::create_dir_all(&backup_dir).await?;
        debug!(data_dir = %settings.data_dir.display(), "persistence store opened");
        Ok(Self {
            settings,
            backup_dir,
            fingerprints: Mutex::new(HashMap::new()),
            backup_seq: AtomicU64::new(0),
        })
    }

    /// Settings the store was opened with.
    pub fn settings(&self) -> &StorageSettings {
        &self.settings
    }

    /// Directory holding the live record files.
    pub fn data_dir(&self) -> &Path {
        &self.settings.data_dir
    }

    /// Live file path for a record.
    ///
    /// # Arguments
    /// * `kind` - Which record (`rules`, `counters` or `abuse`)
    pub fn path_of(&self, kind: RecordKind) -> PathBuf {
        self.settings.data_dir.join(kind.file_name())
    }

    /// Write `value` unless its fingerprint matches the last one seen.
    pub async fn save<T>(&self, kind: RecordKind, value: &T) -> PortgateResult<SaveOutcome>
    where
        T: Serialize + Fingerprint + ?Sized,
    {
        let fingerprint = value.fingerprint();
        let mut fingerprints = self.fingerprints.lock().await;
        if fingerprints.get(&kind) == Some(&fingerprint) {
            debug!(kind = %kind, "unchanged, skipping save");
            return Ok(SaveOutcome::Unchanged);
        }
        self.write(kind, value).await?;
        fingerprints.insert(kind, fingerprint);
        Ok(SaveOutcome::Written)
    }

    /// Write `value` regardless of the stored fingerprint.
    pub async fn force_save<T>(&self, kind: RecordKind, value: &T) -> PortgateResult<()>
    where
        T: Serialize + Fingerprint + ?Sized,
    {
        let fingerprint = value.fingerprint();
        let mut fingerprints = self.fingerprints.lock().await;
        self.write(kind, value).await?;
        fingerprints.insert(kind, fingerprint);
        Ok(())
    }

    /// Read one record kind. A missing file yields the default value; an
    /// unreadable one is an error. The fingerprint is seeded so an immediate
    /// save of the same content is skipped.
    pub async fn load<T>(&self, kind: RecordKind) -> PortgateResult<T>
    where
        T: DeserializeOwned + Default + Fingerprint,
    {
        let path = self.path_of(kind);
        let value = match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let value: T = serde_json::from_str(&content)?;
                debug!(kind = %kind, path = %path.display(), "record loaded");
                value
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(kind = %kind, "no record on disk, using defaults");
                T::default()
            }
            Err(e) => return Err(e.into()),
        };
        self.fingerprints
            .lock()
            .await
            .insert(kind, value.fingerprint());
        Ok(value)
    }

    /// Whether `value` differs from what was last written or loaded.
    pub async fn is_changed<T>(&self, kind: RecordKind, value: &T) -> bool
    where
        T: Fingerprint + ?Sized,
    {
        self.fingerprints.lock().await.get(&kind) != Some(&value.fingerprint())
    }

    /// Delete all but the newest `backup_limit` backups of each kind.
    /// Returns how many files were removed.
    pub async fn cleanup_backups(&self) -> PortgateResult<usize> {
        let mut removed = 0;
        for kind in RecordKind::ALL {
            let backups = self.backups_of(kind).await?;
            for (path, _) in backups.into_iter().skip(self.settings.backup_limit) {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(path = %path.display(), error = %e, "cannot remove old backup"),
                }
            }
        }
        if removed > 0 {
            debug!(removed, "old backups removed");
        }
        Ok(removed)
    }

    pub async fn status(&self) -> PortgateResult<PersistenceStatus> {
        let fingerprints = self.fingerprints.lock().await.clone();
        let mut files = Vec::with_capacity(RecordKind::ALL.len());
        let mut total_backups = 0;
        for kind in RecordKind::ALL {
            let backups = self.backups_of(kind).await?.len();
            total_backups += backups;
            let path = self.path_of(kind);
            let meta = tokio::fs::metadata(&path).await.ok();
            files.push(FileStatus {
                kind,
                exists: meta.is_some(),
                size: meta.as_ref().map_or(0, |m| m.len()),
                modified: meta.as_ref().and_then(modified_secs),
                fingerprint: fingerprints.get(&kind).cloned(),
                backups,
                path,
            });
        }
        Ok(PersistenceStatus {
            data_dir: self.settings.data_dir.clone(),
            backup_dir: self.backup_dir.clone(),
            files,
            total_backups,
            backup_limit: self.settings.backup_limit,
            autosave_interval_secs: self.settings.autosave_interval.as_secs(),
            checked_at: unix_now(),
        })
    }

    async fn write<T>(&self, kind: RecordKind, value: &T) -> PortgateResult<()>
    where
        T: Serialize + ?Sized,
    {
        let path = self.path_of(kind);
        let tmp = self.settings.data_dir.join(format!("{}.tmp", kind.file_name()));
        let json = serde_json::to_vec_pretty(value)?;
        tokio::fs::write(&tmp, &json).await?;

        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let backup = self.backup_dir.join(format!(
                "{}{:020}_{:06}.json",
                kind.backup_prefix(),
                unix_millis(),
                self.backup_seq.fetch_add(1, Ordering::Relaxed)
            ));
            if let Err(e) = tokio::fs::copy(&path, &backup).await {
                warn!(kind = %kind, error = %e, "cannot back up previous record");
            }
        }

        tokio::fs::rename(&tmp, &path).await?;
        info!(kind = %kind, bytes = json.len(), "record saved");
        Ok(())
    }

    /// Backups of one kind, newest first.
    async fn backups_of(&self, kind: RecordKind) -> PortgateResult<Vec<(PathBuf, u64)>> {
        let prefix = kind.backup_prefix();
        let mut found = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.backup_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(&prefix) || !name.ends_with(".json") {
                continue;
            }
            let modified = entry
                .metadata()
                .await
                .ok()
                .and_then(|m| modified_secs(&m))
                .unwrap_or(0);
            found.push((entry.path(), modified));
        }
        // Names embed a zero-padded timestamp and sequence, so they break
        // ties between files written within the same second.
        found.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
        Ok(found)
    }
}

fn modified_secs(meta: &std::fs::Metadata) -> Option<u64> {
    meta.modified()
        .ok()?
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_secs())
}
