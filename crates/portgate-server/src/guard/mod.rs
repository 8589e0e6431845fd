//! Abuse protection for the control plane.
//!
//! - [`abuse`]: lockout, scanner and honeypot state with time-based expiry.
//! - [`screen`]: per-request classification feeding that state.

pub mod abuse;
pub mod screen;

pub use abuse::{AbuseGuard, AbuseSummary, AbuseTracker, GuardPolicy};
pub use screen::{RequestScreen, Verdict};
