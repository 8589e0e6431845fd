//! portgate-server: the forwarding engine behind the `portgate` binary.
//!
//! [`engine::Engine`] is the entry point for a control plane: it starts and
//! stops forwarding rules, screens requests through the abuse guard, and
//! exposes the persistence operations. [`reconciler::Reconciler`] restores
//! saved rules on startup and flushes changed state on a timer.

pub mod config;
pub mod engine;
pub mod forward;
pub mod guard;
pub mod reconciler;
pub mod store;

#[cfg(test)]
mod testutil;

pub use engine::{BatchReport, Engine, EngineConfig, PendingChanges, SaveReport};
pub use reconciler::{Reconciler, RestoreReport};
