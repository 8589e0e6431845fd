//! On-disk persistence for rules, counters and abuse state.

pub mod persistence;

pub use persistence::{
    FileStatus, PersistenceStatus, PersistenceStore, RecordKind, SaveOutcome, StorageSettings,
};
