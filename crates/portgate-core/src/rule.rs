//! Forwarding rule model.
//!
//! A [`ForwardRule`] maps one local port to a remote `host:port` for a single
//! [`Protocol`]. Rules move through [`RuleStatus`] as
//! `starting → running → (stopped | error)`; `error` may also be reached
//! straight from `starting` when the local bind fails.

use crate::clock::unix_now;
use crate::error::{PortgateError, PortgateResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Transport protocol of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    #[serde(rename = "TCP")]
    Tcp,
    #[serde(rename = "UDP")]
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = PortgateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(PortgateError::InvalidRule(format!(
                "unknown protocol: {other}"
            ))),
        }
    }
}

/// Lifecycle state of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    Starting,
    Running,
    Stopped,
    Error,
}

impl RuleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleStatus::Starting => "starting",
            RuleStatus::Running => "running",
            RuleStatus::Stopped => "stopped",
            RuleStatus::Error => "error",
        }
    }

    /// `starting` and `running` rules hold their `(protocol, local_port)` pair.
    pub fn is_active(&self) -> bool {
        matches!(self, RuleStatus::Starting | RuleStatus::Running)
    }
}

impl Default for RuleStatus {
    fn default() -> Self {
        RuleStatus::Stopped
    }
}

impl fmt::Display for RuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a caller asks for when starting a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub protocol: Protocol,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
}

impl RuleSpec {
    pub fn new(
        protocol: Protocol,
        local_port: u16,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        Self {
            protocol,
            local_port,
            remote_host: remote_host.into(),
            remote_port,
        }
    }

    /// Check ports are in 1-65535 and the remote host is non-empty.
    ///
    /// The remote is not checked for reachability.
    pub fn validate(&self) -> PortgateResult<()> {
        if self.local_port == 0 {
            return Err(PortgateError::InvalidRule(
                "local port must be in 1-65535".into(),
            ));
        }
        if self.remote_port == 0 {
            return Err(PortgateError::InvalidRule(
                "remote port must be in 1-65535".into(),
            ));
        }
        if self.remote_host.trim().is_empty() {
            return Err(PortgateError::InvalidRule("remote host is empty".into()));
        }
        Ok(())
    }

    /// `host:port` string for the remote target.
    pub fn remote_addr(&self) -> String {
        format_addr(&self.remote_host, self.remote_port)
    }
}

impl fmt::Display for RuleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {}",
            self.protocol,
            self.local_port,
            self.remote_addr()
        )
    }
}

/// Parses `PROTO:LOCAL_PORT:HOST:REMOTE_PORT`, e.g. `tcp:8080:example.com:80`.
///
/// The host may itself contain colons (bare IPv6), so the remote port is
/// taken from the last segment.
impl FromStr for RuleSpec {
    type Err = PortgateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            PortgateError::InvalidRule(format!(
                "expected PROTO:LOCAL_PORT:HOST:REMOTE_PORT, got {s:?}"
            ))
        };

        let (protocol, rest) = s.split_once(':').ok_or_else(invalid)?;
        let (local_port, rest) = rest.split_once(':').ok_or_else(invalid)?;
        let (host, remote_port) = rest.rsplit_once(':').ok_or_else(invalid)?;

        let host = host.trim_start_matches('[').trim_end_matches(']');
        let spec = RuleSpec {
            protocol: protocol.parse()?,
            local_port: local_port.parse().map_err(|_| invalid())?,
            remote_host: host.to_string(),
            remote_port: remote_port.parse().map_err(|_| invalid())?,
        };
        spec.validate()?;
        Ok(spec)
    }
}

/// A configured forwarding mapping with its lifecycle state.
///
/// Only the fields below are ever persisted; runtime handles live next to
/// the rule in the registry, never inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardRule {
    pub id: String,
    pub protocol: Protocol,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    #[serde(default)]
    pub status: RuleStatus,
    #[serde(default = "unix_now")]
    pub created_at: u64,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl ForwardRule {
    /// A fresh rule in `starting` state with a newly generated identifier.
    pub fn new(spec: &RuleSpec) -> Self {
        Self {
            id: generate_rule_id(),
            protocol: spec.protocol,
            local_port: spec.local_port,
            remote_host: spec.remote_host.clone(),
            remote_port: spec.remote_port,
            status: RuleStatus::Starting,
            created_at: unix_now(),
            last_error: None,
        }
    }

    pub fn spec(&self) -> RuleSpec {
        RuleSpec {
            protocol: self.protocol,
            local_port: self.local_port,
            remote_host: self.remote_host.clone(),
            remote_port: self.remote_port,
        }
    }

    pub fn remote_addr(&self) -> String {
        format_addr(&self.remote_host, self.remote_port)
    }

    /// Whether this rule claims the same `(protocol, local_port)` pair.
    pub fn claims(&self, protocol: Protocol, local_port: u16) -> bool {
        self.status.is_active() && self.protocol == protocol && self.local_port == local_port
    }

    /// Move to `error` with a human-readable reason.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = RuleStatus::Error;
        self.last_error = Some(reason.into());
    }

    /// The form written to disk: status is always `stopped` so a restart
    /// never believes a rule is running before it is re-armed.
    pub fn persisted(&self) -> Self {
        Self {
            status: RuleStatus::Stopped,
            ..self.clone()
        }
    }
}

/// Generate a random rule ID (hex-encoded, 16 bytes = 32 hex chars).
pub fn generate_rule_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

fn format_addr(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
