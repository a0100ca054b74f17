//! Value records for backups and the volumes/snapshots they are taken from.
//!
//! Records are plain data; all mutation goes through the repository's
//! update types (`BackupUpdate`, `VolumeUpdate`, `SnapshotUpdate`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod status;

pub use status::{BackupStatus, SnapshotStatus, VolumeStatus};

/// Volume metadata key recording the backup a volume was last restored from.
pub const SRC_BACKUP_ID_KEY: &str = "src_backup_id";

/// Volume metadata key a driver may use to hand back a backup's key id.
pub const ENCRYPTION_KEY_ID_KEY: &str = "encryption_key_id";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backup {
    pub id: String,
    pub volume_id: String,
    pub snapshot_id: Option<String>,
    pub status: BackupStatus,
    pub host: Option<String>,
    /// Name of the backup driver that created the backup.
    pub service: Option<String>,
    pub container: Option<String>,
    /// Size in GiB.
    pub size: u64,
    pub object_count: u64,
    pub parent_id: Option<String>,
    pub num_dependent_backups: u32,
    pub temp_volume_id: Option<String>,
    pub temp_snapshot_id: Option<String>,
    pub restore_volume_id: Option<String>,
    pub encryption_key_id: Option<String>,
    pub fail_reason: Option<String>,
    pub project_id: String,
    pub display_name: Option<String>,
    pub data_timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Backup {
    /// New backup record in `creating`, as the API layer would persist it.
    pub fn new(id: impl Into<String>, volume_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            volume_id: volume_id.into(),
            snapshot_id: None,
            status: BackupStatus::Creating,
            host: None,
            service: None,
            container: None,
            size: 0,
            object_count: 0,
            parent_id: None,
            num_dependent_backups: 0,
            temp_volume_id: None,
            temp_snapshot_id: None,
            restore_volume_id: None,
            encryption_key_id: None,
            fail_reason: None,
            project_id: String::new(),
            display_name: None,
            data_timestamp: now,
            created_at: now,
            updated_at: None,
            deleted: false,
            deleted_at: None,
        }
    }

    pub fn with_snapshot(mut self, snapshot_id: impl Into<String>) -> Self {
        self.snapshot_id = Some(snapshot_id.into());
        self
    }

    pub fn with_status(mut self, status: BackupStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn is_snapshot_sourced(&self) -> bool {
        self.snapshot_id.is_some()
    }

    pub fn has_temp_resources(&self) -> bool {
        self.temp_volume_id.is_some() || self.temp_snapshot_id.is_some()
    }

    pub fn has_encryption_key(&self) -> bool {
        self.encryption_key_id
            .as_deref()
            .is_some_and(|key| !key.is_empty())
    }
}

/// A record that a volume is attached somewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeAttachment {
    pub id: String,
    pub attached_host: Option<String>,
    pub instance_uuid: Option<String>,
    pub mountpoint: Option<String>,
    pub attached_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    pub host: Option<String>,
    pub status: VolumeStatus,
    pub previous_status: Option<VolumeStatus>,
    /// Size in GiB.
    pub size: u64,
    pub encryption_key_id: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub attachments: Vec<VolumeAttachment>,
    pub project_id: String,
    pub launched_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub deleted: bool,
}

impl Volume {
    pub fn new(id: impl Into<String>, size: u64) -> Self {
        Self {
            id: id.into(),
            host: None,
            status: VolumeStatus::Available,
            previous_status: None,
            size,
            encryption_key_id: None,
            metadata: BTreeMap::new(),
            attachments: Vec::new(),
            project_id: String::new(),
            launched_at: None,
            created_at: Utc::now(),
            deleted: false,
        }
    }

    pub fn with_status(mut self, status: VolumeStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_encryption_key(mut self, key_id: impl Into<String>) -> Self {
        self.encryption_key_id = Some(key_id.into());
        self
    }

    pub fn src_backup_id(&self) -> Option<&str> {
        self.metadata.get(SRC_BACKUP_ID_KEY).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub volume_id: String,
    pub status: SnapshotStatus,
    pub size: u64,
    pub encryption_key_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub deleted: bool,
}

impl Snapshot {
    pub fn new(id: impl Into<String>, volume_id: impl Into<String>, size: u64) -> Self {
        Self {
            id: id.into(),
            volume_id: volume_id.into(),
            status: SnapshotStatus::Available,
            size,
            encryption_key_id: None,
            created_at: Utc::now(),
            deleted: false,
        }
    }

    pub fn with_status(mut self, status: SnapshotStatus) -> Self {
        self.status = status;
        self
    }
}
