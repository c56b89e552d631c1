//! Self-hosted backup orchestrator: incremental and full-archive backups to an
//! S3-compatible object store, with a Postgres metadata ledger.
//!
//! Module layout splits engines (scan/upload/restore logic) from the storage
//! abstraction and the metadata store, with a worker and scheduler layered on top
//! to own run lifecycle and dispatch.

pub mod cancel;
pub mod config;
pub mod db;
pub mod encryption;
pub mod error;
pub mod full_archive;
pub mod incremental;
pub mod metrics;
pub mod reconcile;
pub mod restore;
pub mod retry;
pub mod scheduler;
pub mod storage;
pub mod worker;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Commonly imported types.
pub mod prelude {
    pub use crate::cancel::CancellationToken;
    pub use crate::config::AppConfig;
    pub use crate::db::models::{BackupRun, Job, JobKind, RunStatus, Snapshot};
    pub use crate::error::{Error, Result};
    pub use crate::scheduler::Scheduler;
    pub use crate::storage::{StorageBackend, StorageClass};
    pub use crate::worker::Worker;
}
