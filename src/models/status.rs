use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle states of a backup record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Creating,
    Available,
    Error,
    Restoring,
    ErrorRestoring,
    Deleting,
    ErrorDeleting,
    Deleted,
}

impl BackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::Creating => "creating",
            BackupStatus::Available => "available",
            BackupStatus::Error => "error",
            BackupStatus::Restoring => "restoring",
            BackupStatus::ErrorRestoring => "error_restoring",
            BackupStatus::Deleting => "deleting",
            BackupStatus::ErrorDeleting => "error_deleting",
            BackupStatus::Deleted => "deleted",
        }
    }

    /// States that only exist while an operation is in flight.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BackupStatus::Creating | BackupStatus::Restoring | BackupStatus::Deleting
        )
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "creating" => BackupStatus::Creating,
            "available" => BackupStatus::Available,
            "error" => BackupStatus::Error,
            "restoring" => BackupStatus::Restoring,
            "error_restoring" => BackupStatus::ErrorRestoring,
            "deleting" => BackupStatus::Deleting,
            "error_deleting" => BackupStatus::ErrorDeleting,
            "deleted" => BackupStatus::Deleted,
            _ => return None,
        })
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Volume states as seen by the backup subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumeStatus {
    #[serde(rename = "creating")]
    Creating,
    #[serde(rename = "available")]
    Available,
    #[serde(rename = "in-use")]
    InUse,
    #[serde(rename = "attaching")]
    Attaching,
    #[serde(rename = "detaching")]
    Detaching,
    #[serde(rename = "backing-up")]
    BackingUp,
    #[serde(rename = "restoring-backup")]
    RestoringBackup,
    #[serde(rename = "deleting")]
    Deleting,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "error_restoring")]
    ErrorRestoring,
    #[serde(rename = "error_deleting")]
    ErrorDeleting,
    /// Only ever used as a `previous_status` marker after a failed backup.
    #[serde(rename = "error_backing-up")]
    ErrorBackingUp,
}

impl VolumeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeStatus::Creating => "creating",
            VolumeStatus::Available => "available",
            VolumeStatus::InUse => "in-use",
            VolumeStatus::Attaching => "attaching",
            VolumeStatus::Detaching => "detaching",
            VolumeStatus::BackingUp => "backing-up",
            VolumeStatus::RestoringBackup => "restoring-backup",
            VolumeStatus::Deleting => "deleting",
            VolumeStatus::Error => "error",
            VolumeStatus::ErrorRestoring => "error_restoring",
            VolumeStatus::ErrorDeleting => "error_deleting",
            VolumeStatus::ErrorBackingUp => "error_backing-up",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            VolumeStatus::Creating
                | VolumeStatus::Attaching
                | VolumeStatus::Detaching
                | VolumeStatus::BackingUp
                | VolumeStatus::RestoringBackup
                | VolumeStatus::Deleting
        )
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            VolumeStatus::Error
                | VolumeStatus::ErrorRestoring
                | VolumeStatus::ErrorDeleting
                | VolumeStatus::ErrorBackingUp
        )
    }
}

impl fmt::Display for VolumeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SnapshotStatus {
    #[serde(rename = "creating")]
    Creating,
    #[serde(rename = "available")]
    Available,
    #[serde(rename = "backing-up")]
    BackingUp,
    #[serde(rename = "deleting")]
    Deleting,
    #[serde(rename = "deleted")]
    Deleted,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "error_deleting")]
    ErrorDeleting,
}

impl SnapshotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotStatus::Creating => "creating",
            SnapshotStatus::Available => "available",
            SnapshotStatus::BackingUp => "backing-up",
            SnapshotStatus::Deleting => "deleting",
            SnapshotStatus::Deleted => "deleted",
            SnapshotStatus::Error => "error",
            SnapshotStatus::ErrorDeleting => "error_deleting",
        }
    }
}

impl fmt::Display for SnapshotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
