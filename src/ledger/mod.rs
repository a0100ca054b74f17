//! Status transition table for backups, volumes and snapshots.
//!
//! Everything here is pure: callers read the current status, ask the ledger
//! whether an operation may start and which status to write next, and then
//! persist the answer through the repository.

use crate::error::{BackupError, Result};
use crate::models::{BackupStatus, SnapshotStatus, VolumeStatus};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Orchestrated operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Create,
    Restore,
    Delete,
    Export,
    Import,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Create => "create",
            Operation::Restore => "restore",
            Operation::Delete => "delete",
            Operation::Export => "export",
            Operation::Import => "import",
        };
        f.write_str(name)
    }
}

/// Status pair to write on a volume. `previous_status: None` leaves the
/// stored previous status untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeTransition {
    pub status: VolumeStatus,
    pub previous_status: Option<VolumeStatus>,
}

/// What startup recovery must do with a backup found in a given status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    SetStatus(BackupStatus),
    RetryDelete,
}

pub struct StatusLedger;

impl StatusLedger {
    pub fn backup_can_start(status: BackupStatus, op: Operation) -> bool {
        match op {
            Operation::Create | Operation::Import => status == BackupStatus::Creating,
            Operation::Restore => status == BackupStatus::Available,
            Operation::Delete => matches!(
                status,
                BackupStatus::Available
                    | BackupStatus::Error
                    | BackupStatus::Deleting
                    | BackupStatus::ErrorDeleting
            ),
            Operation::Export => status == BackupStatus::Available,
        }
    }

    /// Volume states from which an operation may take the volume over.
    /// Operations that do not touch the source volume always pass.
    pub fn volume_can_start(status: VolumeStatus, op: Operation) -> bool {
        match op {
            Operation::Create => matches!(
                status,
                VolumeStatus::Available | VolumeStatus::InUse | VolumeStatus::BackingUp
            ),
            Operation::Restore => matches!(
                status,
                VolumeStatus::Available | VolumeStatus::RestoringBackup | VolumeStatus::Creating
            ),
            Operation::Delete | Operation::Export | Operation::Import => true,
        }
    }

    /// A snapshot source must already be marked by the caller.
    pub fn snapshot_can_start(status: SnapshotStatus, op: Operation) -> bool {
        match op {
            Operation::Create => status == SnapshotStatus::BackingUp,
            _ => true,
        }
    }

    pub fn check_backup(status: BackupStatus, op: Operation) -> Result<()> {
        if Self::backup_can_start(status, op) {
            return Ok(());
        }
        Err(BackupError::invalid_backup(format!(
            "cannot {} a backup in status '{}'",
            op, status
        )))
    }

    pub fn check_volume(status: VolumeStatus, op: Operation) -> Result<()> {
        if Self::volume_can_start(status, op) {
            return Ok(());
        }
        Err(BackupError::invalid_volume(format!(
            "cannot {} backup with volume in status '{}'",
            op, status
        )))
    }

    pub fn check_snapshot(status: SnapshotStatus, op: Operation) -> Result<()> {
        if Self::snapshot_can_start(status, op) {
            return Ok(());
        }
        Err(BackupError::invalid_snapshot(format!(
            "expected snapshot status '{}' but found '{}'",
            SnapshotStatus::BackingUp,
            status
        )))
    }

    pub fn backup_on_start(op: Operation) -> BackupStatus {
        match op {
            Operation::Create | Operation::Import => BackupStatus::Creating,
            Operation::Restore => BackupStatus::Restoring,
            Operation::Delete => BackupStatus::Deleting,
            Operation::Export => BackupStatus::Available,
        }
    }

    pub fn backup_on_success(op: Operation) -> BackupStatus {
        match op {
            Operation::Delete => BackupStatus::Deleted,
            _ => BackupStatus::Available,
        }
    }

    /// A failed restore leaves the backup data untouched, so the backup
    /// stays usable.
    pub fn backup_on_failure(op: Operation) -> BackupStatus {
        match op {
            Operation::Create | Operation::Import => BackupStatus::Error,
            Operation::Restore | Operation::Export => BackupStatus::Available,
            Operation::Delete => BackupStatus::ErrorDeleting,
        }
    }

    pub fn backup_on_cancel(op: Operation) -> BackupStatus {
        match op {
            Operation::Restore => BackupStatus::Available,
            other => Self::backup_on_failure(other),
        }
    }

    /// Enter the transient status of `op`, remembering where the volume
    /// came from. Re-entering (the caller pre-marked the volume) keeps the
    /// recorded previous status.
    pub fn volume_on_start(
        op: Operation,
        current: VolumeStatus,
        previous: Option<VolumeStatus>,
    ) -> VolumeTransition {
        match op {
            Operation::Create => {
                let previous = if current == VolumeStatus::BackingUp {
                    previous.unwrap_or(VolumeStatus::Available)
                } else {
                    current
                };
                VolumeTransition {
                    status: VolumeStatus::BackingUp,
                    previous_status: Some(previous),
                }
            }
            Operation::Restore => {
                let previous = if current == VolumeStatus::RestoringBackup {
                    previous.unwrap_or(VolumeStatus::Available)
                } else {
                    current
                };
                VolumeTransition {
                    status: VolumeStatus::RestoringBackup,
                    previous_status: Some(previous),
                }
            }
            _ => VolumeTransition {
                status: current,
                previous_status: None,
            },
        }
    }

    pub fn volume_on_success(op: Operation, previous: Option<VolumeStatus>) -> VolumeTransition {
        match op {
            Operation::Create => VolumeTransition {
                status: Self::pre_backup_status(previous),
                previous_status: Some(VolumeStatus::BackingUp),
            },
            Operation::Restore => VolumeTransition {
                status: VolumeStatus::Available,
                previous_status: Some(VolumeStatus::RestoringBackup),
            },
            _ => VolumeTransition {
                status: previous.unwrap_or(VolumeStatus::Available),
                previous_status: None,
            },
        }
    }

    /// A failed backup hands the volume back in its pre-operation status and
    /// leaves `error_backing-up` as the previous-status marker. A failed
    /// restore into a freshly created volume yields `error`, otherwise
    /// `error_restoring`.
    pub fn volume_on_failure(op: Operation, previous: Option<VolumeStatus>) -> VolumeTransition {
        match op {
            Operation::Create => VolumeTransition {
                status: Self::pre_backup_status(previous),
                previous_status: Some(VolumeStatus::ErrorBackingUp),
            },
            Operation::Restore => {
                let status = if previous == Some(VolumeStatus::Creating) {
                    VolumeStatus::Error
                } else {
                    VolumeStatus::ErrorRestoring
                };
                VolumeTransition {
                    status,
                    previous_status: Some(VolumeStatus::RestoringBackup),
                }
            }
            _ => VolumeTransition {
                status: VolumeStatus::Error,
                previous_status: None,
            },
        }
    }

    /// Cancellation leaves the destination unusable on purpose: `error`,
    /// never `error_restoring`.
    pub fn volume_on_cancel(op: Operation, previous: Option<VolumeStatus>) -> VolumeTransition {
        match op {
            Operation::Restore => VolumeTransition {
                status: VolumeStatus::Error,
                previous_status: Some(VolumeStatus::RestoringBackup),
            },
            other => Self::volume_on_failure(other, previous),
        }
    }

    pub fn snapshot_on_start(current: SnapshotStatus) -> Option<SnapshotStatus> {
        match current {
            SnapshotStatus::Available | SnapshotStatus::BackingUp => Some(SnapshotStatus::BackingUp),
            _ => None,
        }
    }

    /// Snapshot sources are handed back `available` whatever the outcome.
    pub fn snapshot_on_finish() -> SnapshotStatus {
        SnapshotStatus::Available
    }

    pub fn volume_on_recovery(current: VolumeStatus) -> Option<VolumeStatus> {
        match current {
            VolumeStatus::BackingUp => Some(VolumeStatus::Available),
            VolumeStatus::RestoringBackup => Some(VolumeStatus::ErrorRestoring),
            _ => None,
        }
    }

    pub fn backup_on_recovery(current: BackupStatus) -> Option<RecoveryAction> {
        match current {
            BackupStatus::Creating => Some(RecoveryAction::SetStatus(BackupStatus::Error)),
            BackupStatus::Restoring => Some(RecoveryAction::SetStatus(BackupStatus::Available)),
            BackupStatus::Deleting => Some(RecoveryAction::RetryDelete),
            _ => None,
        }
    }

    fn pre_backup_status(previous: Option<VolumeStatus>) -> VolumeStatus {
        match previous {
            Some(VolumeStatus::InUse) => VolumeStatus::InUse,
            _ => VolumeStatus::Available,
        }
    }
}
