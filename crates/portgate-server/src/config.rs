//! Server configuration: TOML file + CLI overrides.

use crate::engine::EngineConfig;
use crate::forward::ForwardSettings;
use crate::guard::GuardPolicy;
use crate::store::StorageSettings;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub guard: GuardSection,
    #[serde(default)]
    pub forward: ForwardSection,
}

/// `[storage]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_backup_limit")]
    pub backup_limit: usize,
    #[serde(default = "default_autosave_interval")]
    pub autosave_interval: u64,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            backup_limit: default_backup_limit(),
            autosave_interval: default_autosave_interval(),
        }
    }
}

/// `[guard]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct GuardSection {
    #[serde(default = "default_max_failed_attempts")]
    pub max_failed_attempts: usize,
    #[serde(default = "default_failed_attempt_window")]
    pub failed_attempt_window: u64,
    #[serde(default = "default_failed_attempt_block")]
    pub failed_attempt_block: u64,
    #[serde(default = "default_scanner_threshold")]
    pub scanner_threshold: usize,
    #[serde(default = "default_scanner_window")]
    pub scanner_window: u64,
    #[serde(default = "default_scanner_block")]
    pub scanner_block: u64,
    #[serde(default = "default_honeypot_block")]
    pub honeypot_block: u64,
    #[serde(default = "default_protected_prefix")]
    pub protected_prefix: String,
}

impl Default for GuardSection {
    fn default() -> Self {
        Self {
            max_failed_attempts: default_max_failed_attempts(),
            failed_attempt_window: default_failed_attempt_window(),
            failed_attempt_block: default_failed_attempt_block(),
            scanner_threshold: default_scanner_threshold(),
            scanner_window: default_scanner_window(),
            scanner_block: default_scanner_block(),
            honeypot_block: default_honeypot_block(),
            protected_prefix: default_protected_prefix(),
        }
    }
}

/// `[forward]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ForwardSection {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    #[serde(default = "default_udp_client_idle")]
    pub udp_client_idle: u64,
}

impl Default for ForwardSection {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            udp_client_idle: default_udp_client_idle(),
        }
    }
}

fn default_data_dir() -> String {
    "~/.portgate/data".to_string()
}
fn default_backup_limit() -> usize {
    3
}
fn default_autosave_interval() -> u64 {
    30
}
fn default_max_failed_attempts() -> usize {
    5
}
fn default_failed_attempt_window() -> u64 {
    3600
}
fn default_failed_attempt_block() -> u64 {
    300
}
fn default_scanner_threshold() -> usize {
    3
}
fn default_scanner_window() -> u64 {
    1800
}
fn default_scanner_block() -> u64 {
    3600
}
fn default_honeypot_block() -> u64 {
    7200
}
fn default_protected_prefix() -> String {
    "/portgate".to_string()
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_udp_client_idle() -> u64 {
    120
}

/// Resolved configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct PortgateConfig {
    pub data_dir: PathBuf,
    pub backup_limit: usize,
    pub autosave_interval: Duration,
    pub guard: GuardPolicy,
    pub protected_prefix: String,
    pub forward: ForwardSettings,
}

impl PortgateConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_data_dir: Option<&str>,
        cli_autosave_interval: Option<u64>,
    ) -> Result<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)
                        .with_context(|| format!("cannot read {}", expanded.display()))?;
                    parse(&content)
                        .with_context(|| format!("config parse error in {}", expanded.display()))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Ok(Self::resolve(file_config, cli_data_dir, cli_autosave_interval))
    }

    fn resolve(
        file: ConfigFile,
        cli_data_dir: Option<&str>,
        cli_autosave_interval: Option<u64>,
    ) -> Self {
        let data_dir = cli_data_dir
            .map(|s| s.to_string())
            .unwrap_or(file.storage.data_dir);
        let autosave = cli_autosave_interval.unwrap_or(file.storage.autosave_interval);

        Self {
            data_dir: expand_tilde_str(&data_dir),
            backup_limit: file.storage.backup_limit,
            // A zero interval would make the timer spin.
            autosave_interval: Duration::from_secs(autosave.max(1)),
            guard: GuardPolicy {
                max_failed_attempts: file.guard.max_failed_attempts,
                failed_attempt_window: file.guard.failed_attempt_window,
                failed_attempt_block: file.guard.failed_attempt_block,
                scanner_threshold: file.guard.scanner_threshold,
                scanner_window: file.guard.scanner_window,
                scanner_block: file.guard.scanner_block,
                honeypot_block: file.guard.honeypot_block,
            },
            protected_prefix: file.guard.protected_prefix,
            forward: ForwardSettings {
                connect_timeout: Duration::from_secs(file.forward.connect_timeout),
                udp_client_idle: Duration::from_secs(file.forward.udp_client_idle),
            },
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            storage: StorageSettings {
                data_dir: self.data_dir.clone(),
                backup_limit: self.backup_limit,
                autosave_interval: self.autosave_interval,
            },
            guard: self.guard.clone(),
            forward: self.forward.clone(),
            protected_prefix: self.protected_prefix.clone(),
        }
    }
}

fn parse(content: &str) -> Result<ConfigFile> {
    Ok(toml::from_str::<ConfigFile>(content)?)
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = PortgateConfig::resolve(parse("").unwrap(), None, None);
        assert_eq!(config.backup_limit, 3);
        assert_eq!(config.autosave_interval, Duration::from_secs(30));
        assert_eq!(config.guard, GuardPolicy::default());
        assert_eq!(config.forward.connect_timeout, Duration::from_secs(10));
        assert!(config.data_dir.ends_with(".portgate/data"));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let file = parse(
            r#"
            [guard]
            honeypot_block = 86400

            [forward]
            udp_client_idle = 30
            "#,
        )
        .unwrap();
        let config = PortgateConfig::resolve(file, None, None);
        assert_eq!(config.guard.honeypot_block, 86400);
        assert_eq!(config.guard.max_failed_attempts, 5);
        assert_eq!(config.forward.udp_client_idle, Duration::from_secs(30));
        assert_eq!(config.protected_prefix, "/portgate");
    }

    #[test]
    fn cli_overrides_file() {
        let file = parse("[storage]\ndata_dir = \"/srv/a\"\nautosave_interval = 60\n").unwrap();
        let config = PortgateConfig::resolve(file, Some("/srv/b"), Some(5));
        assert_eq!(config.data_dir, PathBuf::from("/srv/b"));
        assert_eq!(config.autosave_interval, Duration::from_secs(5));
    }

    #[test]
    fn bad_toml_is_an_error() {
        assert!(parse("[storage\n").is_err());
    }

    #[test]
    fn config_file_is_read_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[storage]\nbackup_limit = 7\n").unwrap();
        let config = PortgateConfig::load(Some(&path), None, None).unwrap();
        assert_eq!(config.backup_limit, 7);

        let missing = PortgateConfig::load(Some(&dir.path().join("nope.toml")), None, None).unwrap();
        assert_eq!(missing.backup_limit, 3);
    }

    #[test]
    fn tilde_is_expanded() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde_str("~/x"), home.join("x"));
        }
        assert_eq!(expand_tilde_str("/abs"), PathBuf::from("/abs"));
    }
}
