use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use super::BackupManager;
use crate::attach::{AttachTarget, DeviceMode};
use crate::context::RequestContext;
use crate::drivers::{RestoreContext, RestoredMetadata};
use crate::error::{BackupError, Result};
use crate::ledger::{Operation, StatusLedger};
use crate::models::{
    Backup, BackupStatus, ENCRYPTION_KEY_ID_KEY, SRC_BACKUP_ID_KEY, Volume, VolumeStatus,
};
use crate::notify::UsageEvent;
use crate::repository::{BackupUpdate, ReadDeleted, VolumeUpdate};

/// Usage event key naming the volume a restore writes to.
pub const RESTORE_VOLUME_EXTRA: &str = "restore_volume_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreOutcome {
    Completed,
    /// The destination volume is left in `error` and must be re-provisioned.
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub outcome: RestoreOutcome,
    pub backup: Backup,
    pub volume: Volume,
    /// Key handling problems that did not fail the restore.
    pub warnings: Vec<String>,
}

impl BackupManager {
    /// Write the data of `backup_id` onto `volume_id`.
    ///
    /// A cancelled restore is not an error: it returns
    /// [`RestoreOutcome::Cancelled`] with the backup `available` and the
    /// volume in `error`.
    #[instrument(skip(self, ctx), fields(request_id = %ctx.request_id))]
    pub async fn restore_backup(
        &self,
        ctx: &RequestContext,
        backup_id: &str,
        volume_id: &str,
    ) -> Result<RestoreReport> {
        let _permit = self.limiter.acquire().await?;

        let backup = self.repo.get_backup(backup_id, ReadDeleted::No).await?;
        let volume = self.repo.get_volume(volume_id).await?;
        StatusLedger::check_backup(backup.status, Operation::Restore)?;
        StatusLedger::check_volume(volume.status, Operation::Restore)?;

        info!("♻️ Restoring backup {} onto volume {}", backup.id, volume.id);
        self.emit(
            ctx,
            UsageEvent::for_backup(&backup, "restore.start").with_extra(RESTORE_VOLUME_EXTRA, &volume.id),
        );

        let marked = BackupUpdate {
            restore_volume_id: Some(Some(volume.id.clone())),
            ..BackupUpdate::status(StatusLedger::backup_on_start(Operation::Restore))
        };
        let backup = self
            .repo
            .conditional_update_backup(&backup.id, &[BackupStatus::Available], &marked)
            .await?
            .ok_or_else(|| {
                BackupError::invalid_backup(format!(
                    "backup {} changed status while the restore was starting",
                    backup_id
                ))
            })?;

        let start = StatusLedger::volume_on_start(Operation::Restore, volume.status, volume.previous_status);
        let pre_status = start.previous_status;
        let volume = match self
            .repo
            .conditional_update_volume(
                &volume.id,
                &[volume.status],
                &VolumeUpdate::transition(start.status, start.previous_status),
            )
            .await?
        {
            Some(volume) => volume,
            None => {
                self.release_restored_backup(&backup.id).await;
                return Err(BackupError::invalid_volume(format!(
                    "volume {} changed status while the restore was starting",
                    volume_id
                )));
            }
        };

        if let Err(e) = self.check_restore_target(&backup, &volume) {
            error!("❌ Restore of backup {} refused: {}", backup.id, e);
            self.release_restored_backup(&backup.id).await;
            self.set_volume_status(&volume.id, VolumeStatus::Error).await;
            return Err(e);
        }

        let original_key = volume.encryption_key_id.clone();
        let Some(cancel) = self.register_restore(&backup.id) else {
            let e = BackupError::invalid_backup(format!(
                "backup {} is already being restored on {}",
                backup.id, self.config.host
            ));
            self.set_volume(&volume.id, StatusLedger::volume_on_failure(Operation::Restore, pre_status))
                .await;
            return Err(e);
        };
        let result = self.run_restore(ctx, &backup, &volume.id, &cancel).await;
        self.restores().remove(&backup.id);

        let completed = match result {
            Ok(metadata) => {
                self.complete_restore(ctx, &backup, &volume.id, pre_status, original_key.as_deref(), metadata)
                    .await
            }
            Err(e) => Err(e),
        };

        match completed {
            Ok(report) => {
                info!("✅ Backup {} restored onto volume {}", backup.id, volume.id);
                self.emit(
                    ctx,
                    UsageEvent::for_backup(&report.backup, "restore.end")
                        .with_extra(RESTORE_VOLUME_EXTRA, &report.volume.id),
                );
                Ok(report)
            }
            Err(e) if e.is_cancelled() => {
                warn!("Restore of backup {} onto {} cancelled", backup.id, volume.id);
                self.set_volume(&volume.id, StatusLedger::volume_on_cancel(Operation::Restore, pre_status))
                    .await;
                self.mark_backup(
                    &backup.id,
                    &[BackupStatus::Restoring],
                    BackupUpdate::status(StatusLedger::backup_on_cancel(Operation::Restore)),
                )
                .await;
                Ok(RestoreReport {
                    outcome: RestoreOutcome::Cancelled,
                    backup: self.repo.get_backup(&backup.id, ReadDeleted::No).await?,
                    volume: self.repo.get_volume(&volume.id).await?,
                    warnings: Vec::new(),
                })
            }
            Err(e) => {
                error!("❌ Restore of backup {} onto {} failed: {}", backup.id, volume.id, e);
                self.set_volume(&volume.id, StatusLedger::volume_on_failure(Operation::Restore, pre_status))
                    .await;
                self.release_restored_backup(&backup.id).await;
                Err(e)
            }
        }
    }

    fn check_restore_target(&self, backup: &Backup, volume: &Volume) -> Result<()> {
        let service = backup.service.as_deref().ok_or_else(|| {
            BackupError::invalid_backup(format!("backup {} was never stored by a driver", backup.id))
        })?;
        if !self.drivers.contains(service) {
            return Err(BackupError::invalid_backup(format!(
                "backup service '{}' of backup {} is not available on {}",
                service, backup.id, self.config.host
            )));
        }
        if volume.size < backup.size {
            return Err(BackupError::invalid_volume(format!(
                "volume {} ({} GiB) is smaller than backup {} ({} GiB)",
                volume.id, volume.size, backup.id, backup.size
            )));
        }
        Ok(())
    }

    async fn run_restore(
        &self,
        ctx: &RequestContext,
        backup: &Backup,
        volume_id: &str,
        cancel: &RestoreContext,
    ) -> Result<RestoredMetadata> {
        let secure = self
            .volume_api
            .secure_file_operations_enabled(ctx, volume_id)
            .await?;
        let device = self
            .attach
            .attach(ctx, AttachTarget::Volume(volume_id.to_string()), secure)
            .await?;

        let restored = async {
            let service = backup.service.as_deref().unwrap_or(&self.config.backup_driver);
            let driver = self.drivers.get(service)?;
            let mut io = device.open(DeviceMode::Write)?;
            let record = backup.clone();
            let target = volume_id.to_string();
            let cancel = cancel.clone();
            self.limiter
                .run_blocking(move || driver.restore(&record, &target, &mut io, &cancel))
                .await
        }
        .await;

        if let Err(e) = device.release(false, false).await {
            warn!("Detach after restore of backup {} failed: {}", backup.id, e);
        }
        restored
    }

    /// Record where the volume came from, settle its keys and hand both
    /// records back as `available`.
    async fn complete_restore(
        &self,
        ctx: &RequestContext,
        backup: &Backup,
        volume_id: &str,
        pre_status: Option<VolumeStatus>,
        original_key: Option<&str>,
        metadata: RestoredMetadata,
    ) -> Result<RestoreReport> {
        let mut update = VolumeUpdate::default().with_metadata(SRC_BACKUP_ID_KEY, backup.id.clone());
        update.set_metadata.extend(metadata);
        if pre_status == Some(VolumeStatus::Creating) {
            update = update.with_launched_at(Utc::now());
        }
        let volume = self.repo.update_volume(volume_id, &update).await?;

        let plan = self.broker.on_restore(ctx, backup, &volume, original_key).await;
        if let Some(key) = plan.gleaned_backup_key {
            self.repo
                .update_backup(&backup.id, &BackupUpdate::default().with_encryption_key(Some(key)))
                .await?;
        }

        let done = StatusLedger::volume_on_success(Operation::Restore, pre_status);
        let mut update = VolumeUpdate::transition(done.status, done.previous_status);
        update.encryption_key_id = plan.volume_key;
        update.remove_metadata.push(ENCRYPTION_KEY_ID_KEY.to_string());
        let volume = self.repo.update_volume(volume_id, &update).await?;

        let backup = self
            .repo
            .conditional_update_backup(
                &backup.id,
                &[BackupStatus::Restoring],
                &BackupUpdate::status(StatusLedger::backup_on_success(Operation::Restore)),
            )
            .await?
            .ok_or_else(|| {
                BackupError::invalid_backup(format!(
                    "backup {} left 'restoring' during the restore",
                    backup.id
                ))
            })?;

        for warning in &plan.warnings {
            warn!("Restore of backup {}: {}", backup.id, warning);
        }
        Ok(RestoreReport {
            outcome: RestoreOutcome::Completed,
            backup,
            volume,
            warnings: plan.warnings,
        })
    }

    /// The backup data is untouched by a failed restore, so the backup
    /// stays usable.
    async fn release_restored_backup(&self, backup_id: &str) {
        self.mark_backup(
            backup_id,
            &[BackupStatus::Restoring],
            BackupUpdate::status(StatusLedger::backup_on_failure(Operation::Restore)),
        )
        .await;
    }

    async fn set_volume_status(&self, volume_id: &str, status: VolumeStatus) {
        if let Err(e) = self
            .repo
            .update_volume(volume_id, &VolumeUpdate::status(status))
            .await
        {
            warn!("Could not move volume {} to '{}': {}", volume_id, status, e);
        }
    }
}
