//! Scratch volumes and snapshots used to back up an in-use volume without
//! touching the live device.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::attach::AttachTarget;
use crate::connector::ConnectorProperties;
use crate::context::RequestContext;
use crate::error::Result;
use crate::models::{Backup, Volume};
use crate::repository::{BackupUpdate, Repository};
use crate::volume_api::VolumeApi;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TempKind {
    Volume,
    Snapshot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TempResource {
    pub id: String,
    pub kind: TempKind,
}

impl TempResource {
    pub fn attach_target(&self) -> AttachTarget {
        match self.kind {
            TempKind::Volume => AttachTarget::Volume(self.id.clone()),
            TempKind::Snapshot => AttachTarget::Snapshot(self.id.clone()),
        }
    }
}

/// What `cleanup_one` did, for recovery accounting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TempCleanup {
    pub removed: Vec<String>,
    pub already_gone: Vec<String>,
    pub failed: Vec<String>,
}

pub struct TempResourceManager {
    repo: Arc<dyn Repository>,
    volume_api: Arc<dyn VolumeApi>,
    connector: ConnectorProperties,
    use_temp_snapshot: bool,
    use_same_host: bool,
}

impl TempResourceManager {
    pub fn new(
        repo: Arc<dyn Repository>,
        volume_api: Arc<dyn VolumeApi>,
        connector: ConnectorProperties,
        use_temp_snapshot: bool,
        use_same_host: bool,
    ) -> Self {
        Self {
            repo,
            volume_api,
            connector,
            use_temp_snapshot,
            use_same_host,
        }
    }

    /// Provide a scratch copy of `source` for `backup`, recording it on the
    /// backup before it is used so a crash leaves a reference recovery can
    /// clean up.
    ///
    /// A temporary snapshot is taken when configured and the volume backend
    /// supports it; otherwise the volume is cloned. With `reuse_same_host`
    /// a temp resource already recorded on the backup is used again when it
    /// still exists.
    pub async fn ensure_scratch(
        &self,
        ctx: &RequestContext,
        backup: &Backup,
        source: &Volume,
        reuse_same_host: bool,
    ) -> Result<TempResource> {
        if reuse_same_host {
            if let Some(existing) = self.existing(backup).await? {
                info!(
                    "♻️ Reusing temporary {:?} {} for backup {}",
                    existing.kind, existing.id, backup.id
                );
                return Ok(existing);
            }
        }

        let support = self.volume_api.get_backup_device(ctx, &source.id).await?;
        if self.use_temp_snapshot && support.temp_snapshot {
            let snapshot = self.volume_api.create_temp_snapshot(ctx, &source.id).await?;
            self.record(backup, BackupUpdate::default().with_temp_snapshot(Some(snapshot.id.clone())))
                .await?;
            return Ok(TempResource {
                id: snapshot.id,
                kind: TempKind::Snapshot,
            });
        }

        let clone = self
            .volume_api
            .create_temp_cloned_volume(ctx, &source.id, self.use_same_host)
            .await?;
        self.record(backup, BackupUpdate::default().with_temp_volume(Some(clone.id.clone())))
            .await?;
        Ok(TempResource {
            id: clone.id,
            kind: TempKind::Volume,
        })
    }

    async fn existing(&self, backup: &Backup) -> Result<Option<TempResource>> {
        if let Some(ref id) = backup.temp_snapshot_id {
            match self.repo.get_snapshot(id).await {
                Ok(_) => {
                    return Ok(Some(TempResource {
                        id: id.clone(),
                        kind: TempKind::Snapshot,
                    }));
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        if let Some(ref id) = backup.temp_volume_id {
            match self.repo.get_volume(id).await {
                Ok(_) => {
                    return Ok(Some(TempResource {
                        id: id.clone(),
                        kind: TempKind::Volume,
                    }));
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    async fn record(&self, backup: &Backup, update: BackupUpdate) -> Result<()> {
        self.repo.update_backup(&backup.id, &update).await?;
        Ok(())
    }

    /// Destroy the temp resources referenced by `backup` and clear the
    /// references. Resources that are already gone count as cleaned; any
    /// other deletion failure is logged and the reference is cleared
    /// anyway. Only a failure to persist the cleared reference is an error.
    pub async fn cleanup_one(&self, ctx: &RequestContext, backup: &Backup) -> Result<TempCleanup> {
        let mut outcome = TempCleanup::default();
        let mut update = BackupUpdate::default();

        if let Some(ref id) = backup.temp_volume_id {
            self.detach_temp_volume(ctx, id).await;
            match self.volume_api.delete_volume(ctx, id).await {
                Ok(()) => outcome.removed.push(id.clone()),
                Err(e) if e.is_not_found() => {
                    debug!("Temporary volume {} of backup {} already gone", id, backup.id);
                    outcome.already_gone.push(id.clone());
                }
                Err(e) => {
                    warn!(
                        "Failed to delete temporary volume {} of backup {}: {}",
                        id, backup.id, e
                    );
                    outcome.failed.push(id.clone());
                }
            }
            update = update.with_temp_volume(None);
        }

        if let Some(ref id) = backup.temp_snapshot_id {
            if let Err(e) = self
                .volume_api
                .terminate_connection_snapshot(ctx, id, &self.connector, true)
                .await
            {
                debug!("Terminating temp snapshot {} export: {}", id, e);
            }
            match self.volume_api.delete_snapshot(ctx, id).await {
                Ok(()) => outcome.removed.push(id.clone()),
                Err(e) if e.is_not_found() => {
                    debug!("Temporary snapshot {} of backup {} already gone", id, backup.id);
                    outcome.already_gone.push(id.clone());
                }
                Err(e) => {
                    warn!(
                        "Failed to delete temporary snapshot {} of backup {}: {}",
                        id, backup.id, e
                    );
                    outcome.failed.push(id.clone());
                }
            }
            update = update.with_temp_snapshot(None);
        }

        if update != BackupUpdate::default() {
            match self.repo.update_backup(&backup.id, &update).await {
                Ok(_) => {}
                // the owning backup vanished too; nothing left to clear
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(outcome)
    }

    /// Best effort: drop the export and any attachment records left by the
    /// operation that created the temp volume.
    async fn detach_temp_volume(&self, ctx: &RequestContext, volume_id: &str) {
        if let Err(e) = self
            .volume_api
            .terminate_connection(ctx, volume_id, &self.connector, true)
            .await
        {
            debug!("Terminating temp volume {} export: {}", volume_id, e);
        }

        let volume = match self.repo.get_volume(volume_id).await {
            Ok(volume) => volume,
            Err(_) => return,
        };
        for attachment in &volume.attachments {
            if let Err(e) = self.repo.detach_volume(volume_id, &attachment.id).await {
                warn!(
                    "Failed to detach attachment {} of temporary volume {}: {}",
                    attachment.id, volume_id, e
                );
            }
        }
    }
}
