//! Narrow persistence interface consumed by the orchestrator.
//!
//! Records are returned by value. Mutations are expressed as update patches
//! so that every write names exactly the fields it touches, and status
//! changes that race with other workers go through the conditional
//! (compare-and-set) variants.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::error::Result;
use crate::models::{
    Backup, BackupStatus, Snapshot, SnapshotStatus, Volume, VolumeAttachment, VolumeStatus,
};

pub mod memory;

pub use memory::MemoryRepository;

/// Whether soft-deleted records are visible to a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadDeleted {
    #[default]
    No,
    Yes,
}

#[derive(Debug, Clone, Default)]
pub struct BackupFilter {
    pub host: Option<String>,
    pub status: Option<BackupStatus>,
    pub volume_id: Option<String>,
    pub parent_id: Option<String>,
    pub read_deleted: ReadDeleted,
}

impl BackupFilter {
    pub fn by_host(host: impl Into<String>) -> Self {
        Self {
            host: Some(host.into()),
            ..Default::default()
        }
    }

    pub fn by_parent(parent_id: impl Into<String>) -> Self {
        Self {
            parent_id: Some(parent_id.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, backup: &Backup) -> bool {
        if backup.deleted && self.read_deleted == ReadDeleted::No {
            return false;
        }
        if let Some(ref host) = self.host {
            if backup.host.as_deref() != Some(host.as_str()) {
                return false;
            }
        }
        if let Some(status) = self.status {
            if backup.status != status {
                return false;
            }
        }
        if let Some(ref volume_id) = self.volume_id {
            if &backup.volume_id != volume_id {
                return false;
            }
        }
        if let Some(ref parent_id) = self.parent_id {
            if backup.parent_id.as_deref() != Some(parent_id.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Field patch for a backup. `Some(None)` clears a nullable field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackupUpdate {
    pub status: Option<BackupStatus>,
    pub host: Option<Option<String>>,
    pub service: Option<Option<String>>,
    pub container: Option<Option<String>>,
    pub volume_id: Option<String>,
    pub snapshot_id: Option<Option<String>>,
    pub size: Option<u64>,
    pub object_count: Option<u64>,
    pub parent_id: Option<Option<String>>,
    pub num_dependent_backups: Option<u32>,
    pub temp_volume_id: Option<Option<String>>,
    pub temp_snapshot_id: Option<Option<String>>,
    pub restore_volume_id: Option<Option<String>>,
    pub encryption_key_id: Option<Option<String>>,
    pub fail_reason: Option<Option<String>>,
    pub data_timestamp: Option<DateTime<Utc>>,
}

impl BackupUpdate {
    pub fn status(status: BackupStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Terminal error status with an operator-facing reason.
    pub fn failed(status: BackupStatus, reason: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            fail_reason: Some(Some(reason.into())),
            ..Default::default()
        }
    }

    pub fn with_fail_reason(mut self, reason: Option<String>) -> Self {
        self.fail_reason = Some(reason);
        self
    }

    pub fn with_temp_volume(mut self, id: Option<String>) -> Self {
        self.temp_volume_id = Some(id);
        self
    }

    pub fn with_temp_snapshot(mut self, id: Option<String>) -> Self {
        self.temp_snapshot_id = Some(id);
        self
    }

    pub fn with_encryption_key(mut self, id: Option<String>) -> Self {
        self.encryption_key_id = Some(id);
        self
    }

    pub fn apply(&self, backup: &mut Backup) {
        if let Some(status) = self.status {
            backup.status = status;
        }
        if let Some(ref v) = self.host {
            backup.host = v.clone();
        }
        if let Some(ref v) = self.service {
            backup.service = v.clone();
        }
        if let Some(ref v) = self.container {
            backup.container = v.clone();
        }
        if let Some(ref v) = self.volume_id {
            backup.volume_id = v.clone();
        }
        if let Some(ref v) = self.snapshot_id {
            backup.snapshot_id = v.clone();
        }
        if let Some(v) = self.size {
            backup.size = v;
        }
        if let Some(v) = self.object_count {
            backup.object_count = v;
        }
        if let Some(ref v) = self.parent_id {
            backup.parent_id = v.clone();
        }
        if let Some(v) = self.num_dependent_backups {
            backup.num_dependent_backups = v;
        }
        if let Some(ref v) = self.temp_volume_id {
            backup.temp_volume_id = v.clone();
        }
        if let Some(ref v) = self.temp_snapshot_id {
            backup.temp_snapshot_id = v.clone();
        }
        if let Some(ref v) = self.restore_volume_id {
            backup.restore_volume_id = v.clone();
        }
        if let Some(ref v) = self.encryption_key_id {
            backup.encryption_key_id = v.clone();
        }
        if let Some(ref v) = self.fail_reason {
            backup.fail_reason = v.clone();
        }
        if let Some(v) = self.data_timestamp {
            backup.data_timestamp = v;
        }
        backup.updated_at = Some(Utc::now());
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VolumeUpdate {
    pub status: Option<VolumeStatus>,
    pub previous_status: Option<Option<VolumeStatus>>,
    pub encryption_key_id: Option<Option<String>>,
    pub launched_at: Option<Option<DateTime<Utc>>>,
    pub set_metadata: BTreeMap<String, String>,
    pub remove_metadata: Vec<String>,
}

impl VolumeUpdate {
    pub fn status(status: VolumeStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn transition(status: VolumeStatus, previous: Option<VolumeStatus>) -> Self {
        Self {
            status: Some(status),
            previous_status: previous.map(Some),
            ..Default::default()
        }
    }

    pub fn with_encryption_key(mut self, id: Option<String>) -> Self {
        self.encryption_key_id = Some(id);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_launched_at(mut self, at: DateTime<Utc>) -> Self {
        self.launched_at = Some(Some(at));
        self
    }

    pub fn apply(&self, volume: &mut Volume) {
        if let Some(status) = self.status {
            volume.status = status;
        }
        if let Some(previous) = self.previous_status {
            volume.previous_status = previous;
        }
        if let Some(ref key) = self.encryption_key_id {
            volume.encryption_key_id = key.clone();
        }
        if let Some(at) = self.launched_at {
            volume.launched_at = at;
        }
        for (key, value) in &self.set_metadata {
            volume.metadata.insert(key.clone(), value.clone());
        }
        for key in &self.remove_metadata {
            volume.metadata.remove(key);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotUpdate {
    pub status: Option<SnapshotStatus>,
}

impl SnapshotUpdate {
    pub fn status(status: SnapshotStatus) -> Self {
        Self {
            status: Some(status),
        }
    }

    pub fn apply(&self, snapshot: &mut Snapshot) {
        if let Some(status) = self.status {
            snapshot.status = status;
        }
    }
}

/// Persistence collaborator. Implementations must make the conditional
/// updates atomic; they are the only concurrency guard on a record.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn create_backup(&self, backup: Backup) -> Result<Backup>;
    async fn get_backup(&self, id: &str, read_deleted: ReadDeleted) -> Result<Backup>;
    async fn list_backups(&self, filter: &BackupFilter) -> Result<Vec<Backup>>;
    async fn update_backup(&self, id: &str, update: &BackupUpdate) -> Result<Backup>;
    /// Applies `update` only while the stored status is one of `expected`.
    /// Returns `None` when the status did not match.
    async fn conditional_update_backup(
        &self,
        id: &str,
        expected: &[BackupStatus],
        update: &BackupUpdate,
    ) -> Result<Option<Backup>>;
    /// Soft delete: the record stays readable with `ReadDeleted::Yes`.
    async fn destroy_backup(&self, id: &str) -> Result<Backup>;

    async fn create_volume(&self, volume: Volume) -> Result<Volume>;
    async fn get_volume(&self, id: &str) -> Result<Volume>;
    async fn list_volumes_by_host(&self, host: &str) -> Result<Vec<Volume>>;
    async fn update_volume(&self, id: &str, update: &VolumeUpdate) -> Result<Volume>;
    async fn conditional_update_volume(
        &self,
        id: &str,
        expected: &[VolumeStatus],
        update: &VolumeUpdate,
    ) -> Result<Option<Volume>>;
    async fn destroy_volume(&self, id: &str) -> Result<()>;
    async fn attach_volume(&self, volume_id: &str, attachment: VolumeAttachment) -> Result<Volume>;
    async fn detach_volume(&self, volume_id: &str, attachment_id: &str) -> Result<Volume>;

    async fn create_snapshot(&self, snapshot: Snapshot) -> Result<Snapshot>;
    async fn get_snapshot(&self, id: &str) -> Result<Snapshot>;
    async fn update_snapshot(&self, id: &str, update: &SnapshotUpdate) -> Result<Snapshot>;
    async fn destroy_snapshot(&self, id: &str) -> Result<()>;
}
