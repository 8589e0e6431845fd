//! Forwarding engine: rule registry, TCP/UDP forward loops, shared counters.
//!
//! # Submodule Architecture
//!
//! - **[`registry`]**: The [`RuleStore`] owns every [`ForwardRule`]
//!   (`portgate_core::ForwardRule`) and its worker handle. It performs the
//!   lifecycle transitions, binds the local socket, and spawns one supervised
//!   worker per rule.
//!
//! - **[`tcp`]**: Accept loop for a TCP rule. Each inbound connection dials
//!   the remote and runs a bidirectional byte relay.
//!
//! - **[`udp`]**: Datagram loop for a UDP rule. Each client address gets its
//!   own outbound socket and a return task relaying replies back.
//!
//! - **[`counters`]**: [`TrafficCounters`] shared by all workers.
//!
//! - **[`availability`]**: Local port availability heuristic used before starting
//!   or restoring a rule.
//!
//! # Data Flow
//!
//! ```text
//! Engine::start_rule
//!   → availability::port_is_free
//!   → RuleStore::start_rule
//!       → bind 0.0.0.0:local_port
//!       → spawn worker (tcp::accept_loop | udp::relay_loop)
//!       → spawn supervisor (marks the rule `error` if the worker panics)
//! RuleStore::stop_rule
//!   → cancel signal → worker drops its listener → rule removed
//! ```

pub mod counters;
pub mod availability;
pub mod registry;
pub mod tcp;
pub mod udp;

pub use counters::TrafficCounters;
pub use registry::RuleStore;

use std::sync::Arc;
use std::time::Duration;

/// Bytes read per relay step.
pub const CHUNK_SIZE: usize = 8 * 1024;

/// Runtime knobs shared by every forward loop.
#[derive(Debug, Clone)]
pub struct ForwardSettings {
    /// Upper bound on dialing the remote for one inbound TCP connection.
    pub connect_timeout: Duration,
    /// A UDP client mapping with no traffic for this long is dropped.
    pub udp_client_idle: Duration,
}

impl Default for ForwardSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            udp_client_idle: Duration::from_secs(120),
        }
    }
}

/// Everything a worker needs about its rule, cloned into each task.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub rule_id: String,
    pub remote_addr: String,
    pub counters: Arc<TrafficCounters>,
    pub reporter: registry::RuleHandle,
    pub settings: ForwardSettings,
}
