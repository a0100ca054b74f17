use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use super::BackupManager;
use crate::context::RequestContext;
use crate::drivers::BackupDriver;
use crate::error::{BackupError, Result};
use crate::ledger::{Operation, StatusLedger};
use crate::models::{Backup, BackupStatus};
use crate::quota::QuotaDeltas;
use crate::repository::{BackupUpdate, ReadDeleted};

impl BackupManager {
    /// Remove a backup's stored data and soft-delete its record.
    ///
    /// `force` asks for deletion even when the normal checks would refuse;
    /// it is honoured only by drivers that declare force-delete support.
    #[instrument(skip(self, ctx), fields(request_id = %ctx.request_id))]
    pub async fn delete_backup(&self, ctx: &RequestContext, backup_id: &str, force: bool) -> Result<()> {
        let backup = self.repo.get_backup(backup_id, ReadDeleted::No).await?;
        StatusLedger::check_backup(backup.status, Operation::Delete)?;

        info!("🗑️ Deleting backup {}{}", backup.id, if force { " (forced)" } else { "" });
        self.notify(ctx, &backup, "delete.start");

        let backup = self
            .repo
            .conditional_update_backup(
                &backup.id,
                &[backup.status],
                &BackupUpdate::status(StatusLedger::backup_on_start(Operation::Delete)),
            )
            .await?
            .ok_or_else(|| {
                BackupError::invalid_backup(format!(
                    "backup {} changed status while the delete was starting",
                    backup_id
                ))
            })?;

        // no service means the data never reached a driver
        if let Some(service) = backup.service.clone() {
            let driver = self.delete_driver(&backup, &service, force).await?;
            let record = backup.clone();
            let deleted = self
                .limiter
                .run_blocking(move || driver.delete(&record))
                .await;
            if let Err(e) = deleted {
                error!("❌ Driver {} failed to delete backup {}: {}", service, backup.id, e);
                self.mark_backup(
                    &backup.id,
                    &[BackupStatus::Deleting],
                    BackupUpdate::failed(StatusLedger::backup_on_failure(Operation::Delete), e.to_string()),
                )
                .await;
                return Err(e);
            }
        }

        self.broker.on_backup_delete(ctx, &backup).await;
        self.release_quota(ctx, &backup).await;

        let deleted = self.repo.destroy_backup(&backup.id).await?;
        if let Some(ref parent) = backup.parent_id {
            self.adjust_dependents(parent, -1).await;
        }

        info!("✅ Backup {} deleted", deleted.id);
        self.notify(ctx, &deleted, "delete.end");
        Ok(())
    }

    /// Pick the driver that may delete `backup`. Refusals leave the backup
    /// in a status an operator can see: `error` when this host cannot
    /// handle the service at all, `error_deleting` when a forced delete was
    /// asked of a driver that cannot do it.
    async fn delete_driver(
        &self,
        backup: &Backup,
        service: &str,
        force: bool,
    ) -> Result<Arc<dyn BackupDriver>> {
        let refusal = if !self.drivers.contains(service) {
            Some((
                BackupStatus::Error,
                format!("backup service '{}' is not available on {}", service, self.config.host),
            ))
        } else if force && !self.drivers.supports_force_delete(service) {
            Some((
                StatusLedger::backup_on_failure(Operation::Delete),
                format!("backup service '{}' does not support forced deletion", service),
            ))
        } else if service != self.config.backup_driver && !self.drivers.supports_force_delete(service) {
            Some((
                BackupStatus::Error,
                format!(
                    "backup service '{}' does not match the configured service '{}'",
                    service, self.config.backup_driver
                ),
            ))
        } else {
            None
        };

        if let Some((status, reason)) = refusal {
            warn!("Refusing to delete backup {}: {}", backup.id, reason);
            self.mark_backup(
                &backup.id,
                &[BackupStatus::Deleting],
                BackupUpdate::failed(status, reason.clone()),
            )
            .await;
            return Err(BackupError::invalid_backup(reason));
        }

        self.drivers.get(service)
    }

    /// Quota is returned best effort; the data is already gone.
    async fn release_quota(&self, ctx: &RequestContext, backup: &Backup) {
        let deltas = QuotaDeltas::for_backup(backup.size).negate();
        let reservation = match self.quota.reserve(ctx, deltas).await {
            Ok(reservation) => reservation,
            Err(e) => {
                warn!("Failed to release quota of backup {}: {}", backup.id, e);
                return;
            }
        };
        if let Err(e) = self.quota.commit(ctx, &reservation).await {
            warn!("Failed to commit quota release of backup {}: {}", backup.id, e);
        }
    }
}
