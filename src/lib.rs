//! Bolt Backup - backup orchestration for block and directory volumes
//!
//! This crate drives backups through their lifecycle on one host: creating
//! them from volumes or snapshots, restoring them onto volumes, deleting,
//! exporting and importing them, and repairing whatever an interrupted
//! process left behind at startup.

pub mod attach;
pub mod config;
pub mod connector;
pub mod context;
pub mod drivers;
pub mod error;
pub mod keys;
pub mod ledger;
pub mod limiter;
pub mod manager;
pub mod models;
pub mod monitoring;
pub mod notify;
pub mod quota;
pub mod recovery;
pub mod repository;
pub mod temp;
pub mod volume_api;

pub use config::BackupConfig;
pub use context::RequestContext;
pub use error::{BackupError, ConfigError, Result};
pub use manager::{
    BackupManager, BackupManagerBuilder, BackupRecord, ImportOutcome, RestoreOutcome,
    RestoreReport,
};
pub use models::{Backup, BackupStatus, Snapshot, SnapshotStatus, Volume, VolumeStatus};
pub use recovery::RecoveryReport;

// Re-export anyhow for compatibility
pub use anyhow;

/// Re-exports for easier API usage
pub mod api {
    pub use crate::drivers::{BackupDriver, BackupDriverRegistry, PosixBackupDriver, RestoreContext};
    pub use crate::keys::{InMemoryKeyManager, KeyManager};
    pub use crate::manager::{BackupRpc, InProcessRouter};
    pub use crate::notify::{NotificationSink, TracingNotifier, UsageEvent};
    pub use crate::quota::{InMemoryQuota, QuotaService, UnlimitedQuota};
    pub use crate::repository::{MemoryRepository, Repository};
    pub use crate::volume_api::{LocalVolumeApi, VolumeApi};
    pub use crate::{BackupConfig, BackupManager, RequestContext};
}
