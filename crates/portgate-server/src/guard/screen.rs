//! Request screening for the control plane.
//!
//! Every incoming request is classified before it reaches a handler:
//! blocked clients are refused, decoy paths trip the honeypot, and scans
//! outside the protected prefix or from known scanning tools feed scanner
//! detection.

use super::AbuseGuard;
use tracing::debug;

/// Decoy paths. Nothing legitimate lives here.
pub const HONEYPOT_PATHS: &[&str] = &[
    "/admin",
    "/administrator",
    "/wp-admin",
    "/phpmyadmin",
    "/mysql",
    "/login",
    "/admin.php",
    "/admin/login",
    "/administrator/index.php",
    "/wp-login.php",
    "/cpanel",
    "/webmail",
    "/roundcube",
    "/squirrelmail",
    "/manager",
    "/tomcat",
    "/jenkins",
    "/gitea",
    "/grafana",
    "/kibana",
    "/.env",
    "/config.php",
    "/database.php",
    "/db_config.php",
    "/phpinfo.php",
    "/info.php",
    "/test.php",
    "/shell.php",
    "/.git/config",
    "/.svn/entries",
    "/backup.zip",
    "/backup.sql",
];

/// Substrings (lowercase) that mark a scanning tool's user agent.
pub const SUSPICIOUS_AGENTS: &[&str] = &[
    "nmap", "masscan", "zmap", "sqlmap", "nikto", "dirb", "gobuster", "dirbuster", "wfuzz",
    "hydra", "nessus", "openvas", "acunetix", "burpsuite", "zgrab", "shodan", "censys",
    "scanner", "bot",
];

/// Requests for these are never counted as scans.
pub const STATIC_EXTENSIONS: &[&str] = &[".css", ".js", ".ico", ".png", ".jpg"];

/// Longest user-agent prefix kept in a scanner record.
const AGENT_RECORD_LEN: usize = 50;

/// Outcome of screening one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Pass the request on.
    Allow,
    /// Client is blocked; refuse with 403.
    Deny,
    /// Answer 404 without revealing anything.
    NotFound,
}

/// Screens requests against the abuse guard.
#[derive(Debug, Clone)]
pub struct RequestScreen {
    /// Secret path prefix under which the real control plane lives.
    protected_prefix: String,
}

impl RequestScreen {
    pub fn new(protected_prefix: impl Into<String>) -> Self {
        let mut prefix = protected_prefix.into();
        while prefix.ends_with('/') {
            prefix.pop();
        }
        if !prefix.starts_with('/') {
            prefix.insert(0, '/');
        }
        Self {
            protected_prefix: prefix,
        }
    }

    pub fn protected_prefix(&self) -> &str {
        &self.protected_prefix
    }

    /// Classify one request and record any abuse it shows.
    pub async fn screen(
        &self,
        guard: &AbuseGuard,
        ip: &str,
        path: &str,
        user_agent: Option<&str>,
    ) -> Verdict {
        if guard.is_blocked(ip).await {
            debug!(ip, path, "request from blocked client");
            return Verdict::Deny;
        }

        if is_honeypot(path) {
            guard.record_honeypot_hit(ip, path).await;
            return Verdict::NotFound;
        }

        if !self.is_protected(path) {
            if !is_static_asset(path) {
                guard.record_scanner_behavior(ip, path).await;
                return Verdict::NotFound;
            }
            return Verdict::Allow;
        }

        if let Some(agent) = user_agent.filter(|ua| is_suspicious_agent(ua)) {
            let record: String = agent.chars().take(AGENT_RECORD_LEN).collect();
            guard
                .record_scanner_behavior(ip, &format!("UA:{record}"))
                .await;
            return Verdict::NotFound;
        }

        Verdict::Allow
    }

    fn is_protected(&self, path: &str) -> bool {
        path.strip_prefix(self.protected_prefix.as_str())
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    }
}

pub fn is_honeypot(path: &str) -> bool {
    HONEYPOT_PATHS.contains(&path)
}

pub fn is_static_asset(path: &str) -> bool {
    STATIC_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

pub fn is_suspicious_agent(user_agent: &str) -> bool {
    let ua = user_agent.to_lowercase();
    SUSPICIOUS_AGENTS.iter().any(|token| ua.contains(token))
}
