use tracing::{error, info, instrument, warn};

use super::BackupManager;
use crate::attach::{AttachTarget, DeviceMode};
use crate::context::RequestContext;
use crate::drivers::BackupOutcome;
use crate::error::{BackupError, Result};
use crate::ledger::{Operation, StatusLedger, VolumeTransition};
use crate::models::{Backup, BackupStatus, Volume, VolumeStatus};
use crate::repository::{BackupUpdate, ReadDeleted, SnapshotUpdate, VolumeUpdate};

impl BackupManager {
    /// Store the data of a backup record the API layer left in `creating`.
    ///
    /// Precondition violations on the backup itself are returned without
    /// touching anything. Once the backup is known to be ours every failure
    /// leaves it in `error` and is returned unchanged.
    #[instrument(skip(self, ctx), fields(request_id = %ctx.request_id))]
    pub async fn create_backup(&self, ctx: &RequestContext, backup_id: &str) -> Result<Backup> {
        let _permit = self.limiter.acquire().await?;

        let backup = self.repo.get_backup(backup_id, ReadDeleted::No).await?;
        StatusLedger::check_backup(backup.status, Operation::Create)?;

        let volume = match self.check_create_sources(&backup).await {
            Ok(volume) => volume,
            Err(e) => {
                self.fail_create(&backup.id, &e).await;
                return Err(e);
            }
        };

        info!("💾 Creating backup {} of volume {}", backup.id, volume.id);
        self.notify(ctx, &backup, "create.start");

        let claimed = BackupUpdate {
            host: Some(Some(self.config.host.clone())),
            service: Some(Some(self.config.backup_driver.clone())),
            ..Default::default()
        };
        let backup = self.repo.update_backup(&backup.id, &claimed).await?;

        let pre_status = if backup.is_snapshot_sourced() {
            None
        } else {
            match self.mark_source_volume(&volume).await {
                Ok(previous) => previous,
                Err(e) => {
                    self.fail_create(&backup.id, &e).await;
                    return Err(e);
                }
            }
        };

        let result = self.run_backup(ctx, &backup, &volume, pre_status).await;
        self.cleanup_scratch(ctx, &backup.id).await;

        match result {
            Ok(outcome) => self.finish_create(ctx, &backup, &volume, pre_status, outcome).await,
            Err(e) => {
                error!("❌ Backup {} failed: {}", backup.id, e);
                if !backup.is_snapshot_sourced() {
                    self.set_volume(&volume.id, StatusLedger::volume_on_failure(Operation::Create, pre_status))
                        .await;
                }
                self.release_snapshot_source(&backup).await;
                self.fail_create(&backup.id, &e).await;
                Err(e)
            }
        }
    }

    async fn check_create_sources(&self, backup: &Backup) -> Result<Volume> {
        let volume = self.repo.get_volume(&backup.volume_id).await?;
        if let Some(ref snapshot_id) = backup.snapshot_id {
            let snapshot = self.repo.get_snapshot(snapshot_id).await?;
            StatusLedger::check_snapshot(snapshot.status, Operation::Create)?;
        }
        StatusLedger::check_volume(volume.status, Operation::Create)?;
        Ok(volume)
    }

    /// Move the source volume into `backing-up`. Returns the status it must
    /// be handed back in.
    async fn mark_source_volume(&self, volume: &Volume) -> Result<Option<VolumeStatus>> {
        let start = StatusLedger::volume_on_start(Operation::Create, volume.status, volume.previous_status);
        let update = VolumeUpdate::transition(start.status, start.previous_status);
        self.repo
            .conditional_update_volume(&volume.id, &[volume.status], &update)
            .await?
            .ok_or_else(|| {
                BackupError::invalid_volume(format!(
                    "volume {} left status '{}' while the backup was starting",
                    volume.id, volume.status
                ))
            })?;
        Ok(start.previous_status)
    }

    async fn run_backup(
        &self,
        ctx: &RequestContext,
        backup: &Backup,
        volume: &Volume,
        pre_status: Option<VolumeStatus>,
    ) -> Result<BackupOutcome> {
        let source_key = match backup.snapshot_id {
            Some(ref id) => self.repo.get_snapshot(id).await?.encryption_key_id,
            None => volume.encryption_key_id.clone(),
        };
        let key = self
            .broker
            .on_backup_create(ctx, backup, source_key.as_deref())
            .await?;
        let mut backup = backup.clone();
        if key != backup.encryption_key_id {
            backup = self
                .repo
                .update_backup(&backup.id, &BackupUpdate::default().with_encryption_key(key))
                .await?;
        }

        let target = match backup.snapshot_id {
            Some(ref id) => AttachTarget::Snapshot(id.clone()),
            None if pre_status == Some(VolumeStatus::InUse) => {
                let scratch = self
                    .temp
                    .ensure_scratch(ctx, &backup, volume, self.config.backup_use_same_host)
                    .await?;
                scratch.attach_target()
            }
            None => AttachTarget::Volume(volume.id.clone()),
        };

        let secure = self
            .volume_api
            .secure_file_operations_enabled(ctx, &volume.id)
            .await?;
        let device = self.attach.attach(ctx, target, secure).await?;

        let stored = async {
            let driver = self.drivers.get(&self.config.backup_driver)?;
            let mut io = device.open(DeviceMode::Read)?;
            let record = backup.clone();
            self.limiter
                .run_blocking(move || driver.backup(&record, &mut io))
                .await
        }
        .await;

        if let Err(e) = device.release(false, false).await {
            warn!("Detach after backup {} failed: {}", backup.id, e);
        }
        stored
    }

    async fn finish_create(
        &self,
        ctx: &RequestContext,
        backup: &Backup,
        volume: &Volume,
        pre_status: Option<VolumeStatus>,
        outcome: BackupOutcome,
    ) -> Result<Backup> {
        if !backup.is_snapshot_sourced() {
            self.set_volume(&volume.id, StatusLedger::volume_on_success(Operation::Create, pre_status))
                .await;
        }
        self.release_snapshot_source(backup).await;

        let parent_id = outcome.parent_id.filter(|parent| parent != &backup.id);
        let update = BackupUpdate {
            size: Some(outcome.size),
            object_count: Some(outcome.object_count),
            container: Some(outcome.container),
            parent_id: Some(parent_id.clone()),
            ..BackupUpdate::status(StatusLedger::backup_on_success(Operation::Create))
        }
        .with_fail_reason(None);

        let done = match self
            .repo
            .conditional_update_backup(&backup.id, &[BackupStatus::Creating], &update)
            .await?
        {
            Some(done) => done,
            None => {
                warn!(
                    "Backup {} left 'creating' while its data was stored, keeping the new status",
                    backup.id
                );
                return self.repo.get_backup(&backup.id, ReadDeleted::No).await;
            }
        };

        if let Some(ref parent) = parent_id {
            self.adjust_dependents(parent, 1).await;
        }

        info!(
            "✅ Backup {} available ({} GiB, {} objects)",
            done.id, done.size, done.object_count
        );
        self.notify(ctx, &done, "create.end");
        Ok(done)
    }

    async fn fail_create(&self, backup_id: &str, cause: &BackupError) {
        self.mark_backup(
            backup_id,
            &[BackupStatus::Creating],
            BackupUpdate::failed(StatusLedger::backup_on_failure(Operation::Create), cause.to_string()),
        )
        .await;
    }

    /// Temp resources never outlive the operation that made them.
    async fn cleanup_scratch(&self, ctx: &RequestContext, backup_id: &str) {
        let backup = match self.repo.get_backup(backup_id, ReadDeleted::No).await {
            Ok(backup) if backup.has_temp_resources() => backup,
            Ok(_) => return,
            Err(e) => {
                warn!("Could not re-read backup {} for temp cleanup: {}", backup_id, e);
                return;
            }
        };
        if let Err(e) = self.temp.cleanup_one(ctx, &backup).await {
            warn!("Temp resources of backup {} not cleaned up: {}", backup_id, e);
        }
    }

    async fn release_snapshot_source(&self, backup: &Backup) {
        let Some(ref snapshot_id) = backup.snapshot_id else {
            return;
        };
        let update = SnapshotUpdate::status(StatusLedger::snapshot_on_finish());
        if let Err(e) = self.repo.update_snapshot(snapshot_id, &update).await {
            warn!("Snapshot {} not released after backup {}: {}", snapshot_id, backup.id, e);
        }
    }

    pub(super) async fn set_volume(&self, volume_id: &str, transition: VolumeTransition) {
        let update = VolumeUpdate::transition(transition.status, transition.previous_status);
        if let Err(e) = self.repo.update_volume(volume_id, &update).await {
            warn!(
                "Could not move volume {} to '{}': {}",
                volume_id, transition.status, e
            );
        }
    }
}
