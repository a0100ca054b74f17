//! Startup repair of work a previous process left half done.
//!
//! Runs once per process start on the primary worker. Every entity is
//! handled on its own: a failure is logged and counted, and the scan moves
//! on to the next one.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::connector::ConnectorProperties;
use crate::context::RequestContext;
use crate::error::Result;
use crate::keys::{KeyManager, MigrationReport, migrate_fixed_key};
use crate::ledger::{RecoveryAction, StatusLedger};
use crate::models::{Backup, BackupStatus, SnapshotStatus, Volume, VolumeStatus};
use crate::repository::{
    BackupFilter, BackupUpdate, Repository, SnapshotUpdate, VolumeUpdate,
};
use crate::temp::TempResourceManager;
use crate::volume_api::VolumeApi;

/// Re-runs the delete of a backup found in `deleting`.
#[async_trait]
pub trait DeleteRetry: Send + Sync {
    async fn retry_delete(&self, ctx: &RequestContext, backup_id: &str) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Not the primary worker; nothing was touched.
    pub skipped: bool,
    pub volumes_reset: usize,
    pub backups_examined: usize,
    pub backups_reset: usize,
    pub deletes_retried: usize,
    pub temp_cleanups_attempted: usize,
    /// Tasks handed to the cleanup pool, key migration included.
    pub tasks_scheduled: usize,
    pub failures: usize,
    pub key_migration: Option<MigrationReport>,
}

impl RecoveryReport {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }
}

enum PoolTask {
    Delete { backup_id: String, result: Result<()> },
    Migration(Result<MigrationReport>),
}

pub struct CleanupRecoveryService {
    repo: Arc<dyn Repository>,
    volume_api: Arc<dyn VolumeApi>,
    temp: Arc<TempResourceManager>,
    keys: Arc<dyn KeyManager>,
    deleter: Arc<dyn DeleteRetry>,
    connector: ConnectorProperties,
    host: String,
    offload_deletes: bool,
}

impl CleanupRecoveryService {
    pub fn new(
        repo: Arc<dyn Repository>,
        volume_api: Arc<dyn VolumeApi>,
        temp: Arc<TempResourceManager>,
        keys: Arc<dyn KeyManager>,
        deleter: Arc<dyn DeleteRetry>,
        connector: ConnectorProperties,
        offload_deletes: bool,
    ) -> Self {
        let host = connector.host.clone();
        Self {
            repo,
            volume_api,
            temp,
            keys,
            deleter,
            connector,
            host,
            offload_deletes,
        }
    }

    pub async fn run(&self, ctx: &RequestContext) -> RecoveryReport {
        info!("🧹 Cleaning up incomplete backup operations on {}", self.host);
        let mut report = RecoveryReport::default();

        self.recover_volumes(ctx, &mut report).await;

        let backups = match self.repo.list_backups(&BackupFilter::by_host(&self.host)).await {
            Ok(backups) => backups,
            Err(e) => {
                error!("Could not list backups of {}: {}", self.host, e);
                report.failures += 1;
                Vec::new()
            }
        };

        let mut pool = JoinSet::new();
        for backup in backups {
            report.backups_examined += 1;

            if backup.has_temp_resources() {
                report.temp_cleanups_attempted += 1;
                if let Err(e) = self.temp.cleanup_one(ctx, &backup).await {
                    error!(
                        "Temporary resource cleanup of backup {} failed: {}",
                        backup.id, e
                    );
                    report.failures += 1;
                }
            }

            match StatusLedger::backup_on_recovery(backup.status) {
                Some(RecoveryAction::SetStatus(status)) => {
                    match self.recover_backup(ctx, &backup, status).await {
                        Ok(()) => report.backups_reset += 1,
                        Err(e) => {
                            error!("Cleanup of backup {} failed: {}", backup.id, e);
                            report.failures += 1;
                        }
                    }
                }
                Some(RecoveryAction::RetryDelete) => {
                    report.deletes_retried += 1;
                    if self.offload_deletes {
                        let deleter = Arc::clone(&self.deleter);
                        let ctx = ctx.clone();
                        pool.spawn(async move {
                            let result = deleter.retry_delete(&ctx, &backup.id).await;
                            PoolTask::Delete {
                                backup_id: backup.id,
                                result,
                            }
                        });
                        report.tasks_scheduled += 1;
                    } else if let Err(e) = self.deleter.retry_delete(ctx, &backup.id).await {
                        error!("Retried delete of backup {} failed: {}", backup.id, e);
                        report.failures += 1;
                    }
                }
                None => {}
            }
        }

        let repo = Arc::clone(&self.repo);
        let keys = Arc::clone(&self.keys);
        let host = self.host.clone();
        let migration_ctx = ctx.clone();
        pool.spawn(async move {
            PoolTask::Migration(
                migrate_fixed_key(&migration_ctx, repo.as_ref(), keys.as_ref(), &host).await,
            )
        });
        report.tasks_scheduled += 1;

        while let Some(joined) = pool.join_next().await {
            match joined {
                Ok(PoolTask::Delete { backup_id, result }) => {
                    if let Err(e) = result {
                        error!("Retried delete of backup {} failed: {}", backup_id, e);
                        report.failures += 1;
                    }
                }
                Ok(PoolTask::Migration(Ok(migration))) => {
                    report.failures += migration.failures;
                    report.key_migration = Some(migration);
                }
                Ok(PoolTask::Migration(Err(e))) => {
                    error!("Fixed key migration failed: {}", e);
                    report.failures += 1;
                }
                Err(e) => {
                    error!("Cleanup task aborted: {}", e);
                    report.failures += 1;
                }
            }
        }

        info!(
            "✅ Cleanup done: {} volumes and {} backups reset, {} deletes retried, {} failures",
            report.volumes_reset, report.backups_reset, report.deletes_retried, report.failures
        );
        report
    }

    async fn recover_volumes(&self, ctx: &RequestContext, report: &mut RecoveryReport) {
        let volumes = match self.repo.list_volumes_by_host(&self.host).await {
            Ok(volumes) => volumes,
            Err(e) => {
                error!("Could not list volumes of {}: {}", self.host, e);
                report.failures += 1;
                return;
            }
        };

        for volume in volumes {
            let Some(target) = StatusLedger::volume_on_recovery(volume.status) else {
                continue;
            };
            match self.reset_volume(ctx, &volume, target).await {
                Ok(()) => report.volumes_reset += 1,
                Err(e) => {
                    error!("Cleanup of volume {} failed: {}", volume.id, e);
                    report.failures += 1;
                }
            }
        }
    }

    async fn reset_volume(
        &self,
        ctx: &RequestContext,
        volume: &Volume,
        target: VolumeStatus,
    ) -> Result<()> {
        info!(
            "Resetting volume {} from {} to {}",
            volume.id, volume.status, target
        );
        self.detach_leftovers(ctx, volume).await;
        self.repo
            .conditional_update_volume(
                &volume.id,
                &[volume.status],
                &VolumeUpdate::transition(target, Some(volume.status)),
            )
            .await?;
        Ok(())
    }

    /// Best effort: drop the export and attachment records this host made.
    async fn detach_leftovers(&self, ctx: &RequestContext, volume: &Volume) {
        if let Err(e) = self
            .volume_api
            .terminate_connection(ctx, &volume.id, &self.connector, true)
            .await
        {
            warn!("Terminating connection of volume {} failed: {}", volume.id, e);
        }

        for attachment in &volume.attachments {
            if attachment.attached_host.as_deref() != Some(self.host.as_str()) {
                continue;
            }
            if let Err(e) = self.repo.detach_volume(&volume.id, &attachment.id).await {
                warn!(
                    "Detaching attachment {} of volume {} failed: {}",
                    attachment.id, volume.id, e
                );
            }
        }
    }

    async fn recover_backup(
        &self,
        ctx: &RequestContext,
        backup: &Backup,
        target: BackupStatus,
    ) -> Result<()> {
        info!(
            "Resetting backup {} from {} to {}",
            backup.id, backup.status, target
        );

        match backup.status {
            BackupStatus::Creating => self.recover_creating_source(ctx, backup).await,
            BackupStatus::Restoring => self.recover_restore_target(backup).await,
            _ => {}
        }

        let update = match target {
            BackupStatus::Error => BackupUpdate::failed(
                target,
                format!("backup {} was interrupted by a service restart", backup.status),
            ),
            other => BackupUpdate::status(other),
        };
        self.repo
            .conditional_update_backup(&backup.id, &[backup.status], &update)
            .await?;
        Ok(())
    }

    async fn recover_creating_source(&self, ctx: &RequestContext, backup: &Backup) {
        if let Some(ref snapshot_id) = backup.snapshot_id {
            if let Err(e) = self
                .volume_api
                .terminate_connection_snapshot(ctx, snapshot_id, &self.connector, true)
                .await
            {
                warn!("Terminating connection of snapshot {} failed: {}", snapshot_id, e);
            }
            if let Err(e) = self.volume_api.remove_export_snapshot(ctx, snapshot_id).await {
                warn!("Removing export of snapshot {} failed: {}", snapshot_id, e);
            }
            match self.repo.get_snapshot(snapshot_id).await {
                Ok(snapshot) if snapshot.status == SnapshotStatus::BackingUp => {
                    if let Err(e) = self
                        .repo
                        .update_snapshot(snapshot_id, &SnapshotUpdate::status(StatusLedger::snapshot_on_finish()))
                        .await
                    {
                        warn!("Resetting snapshot {} failed: {}", snapshot_id, e);
                    }
                }
                Ok(_) => {}
                Err(e) => debug!("Source snapshot {} not reset: {}", snapshot_id, e),
            }
            return;
        }

        match self.repo.get_volume(&backup.volume_id).await {
            Ok(volume) if volume.status == VolumeStatus::BackingUp => {
                if let Err(e) = self.reset_volume(ctx, &volume, VolumeStatus::Available).await {
                    warn!("Resetting source volume {} failed: {}", volume.id, e);
                }
            }
            Ok(_) => {}
            Err(e) => debug!("Source volume {} not reset: {}", backup.volume_id, e),
        }
    }

    async fn recover_restore_target(&self, backup: &Backup) {
        let Some(ref volume_id) = backup.restore_volume_id else {
            return;
        };
        match self.repo.get_volume(volume_id).await {
            Ok(volume) if volume.status == VolumeStatus::RestoringBackup => {
                let update = VolumeUpdate::transition(
                    VolumeStatus::ErrorRestoring,
                    Some(VolumeStatus::RestoringBackup),
                );
                if let Err(e) = self
                    .repo
                    .conditional_update_volume(volume_id, &[VolumeStatus::RestoringBackup], &update)
                    .await
                {
                    warn!("Resetting restore target {} failed: {}", volume_id, e);
                }
            }
            Ok(_) => {}
            Err(e) => debug!("Restore target {} not reset: {}", volume_id, e),
        }
    }
}
