//! portgate-core: shared records for the portgate forwarding engine.
//!
//! Provides the forwarding rule model, traffic counter and abuse-state
//! records, explicit content fingerprints used for change detection, and the
//! common error type.

pub mod abuse;
pub mod clock;
pub mod counters;
pub mod error;
pub mod fingerprint;
pub mod rule;

// Re-export commonly used items at crate root.
pub use abuse::{AbuseRecord, PathHit};
pub use clock::{unix_millis, unix_now};
pub use counters::{CounterRecord, StatsSnapshot};
pub use error::{PortgateError, PortgateResult};
pub use fingerprint::Fingerprint;
pub use rule::{generate_rule_id, ForwardRule, Protocol, RuleSpec, RuleStatus};
