use async_trait::async_trait;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;
use walkdir::WalkDir;

use super::{BackupDeviceSupport, VolumeApi};
use crate::connector::{ConnectionInfo, ConnectorProperties};
use crate::context::RequestContext;
use crate::error::{BackupError, ResourceKind, Result};
use crate::models::{Snapshot, Volume, VolumeStatus};
use crate::repository::Repository;

const GIB: u64 = 1024 * 1024 * 1024;

/// Volume service backed by image files (or directories) under one
/// directory on this host.
pub struct LocalVolumeApi {
    repo: Arc<dyn Repository>,
    volumes_dir: PathBuf,
    host: String,
    temp_snapshots: bool,
    secure_file_operations: bool,
}

impl LocalVolumeApi {
    pub fn new(repo: Arc<dyn Repository>, volumes_dir: impl Into<PathBuf>, host: impl Into<String>) -> Self {
        Self {
            repo,
            volumes_dir: volumes_dir.into(),
            host: host.into(),
            temp_snapshots: true,
            secure_file_operations: true,
        }
    }

    pub fn with_temp_snapshots(mut self, enabled: bool) -> Self {
        self.temp_snapshots = enabled;
        self
    }

    pub fn with_secure_file_operations(mut self, enabled: bool) -> Self {
        self.secure_file_operations = enabled;
        self
    }

    /// Directory-backed volumes win over image files of the same id.
    pub fn volume_path(&self, volume_id: &str) -> PathBuf {
        Self::device_path(&self.volumes_dir, volume_id)
    }

    pub fn snapshot_path(&self, snapshot_id: &str) -> PathBuf {
        Self::device_path(&self.volumes_dir.join("snapshots"), snapshot_id)
    }

    fn device_path(dir: &Path, id: &str) -> PathBuf {
        let as_dir = dir.join(id);
        if as_dir.is_dir() {
            as_dir
        } else {
            dir.join(format!("{}.img", id))
        }
    }

    /// Create the backing image for `volume` and persist the record.
    /// `bytes` overrides the image length implied by `volume.size`.
    pub async fn provision_volume(&self, mut volume: Volume, bytes: Option<u64>) -> Result<Volume> {
        let len = match bytes {
            Some(len) => len,
            None => volume.size.checked_mul(GIB).ok_or_else(|| {
                BackupError::invalid_volume(format!(
                    "volume {} size of {} GiB is too large",
                    volume.id, volume.size
                ))
            })?,
        };
        tokio::fs::create_dir_all(&self.volumes_dir).await?;
        let path = self.volumes_dir.join(format!("{}.img", volume.id));
        let file = tokio::fs::File::create(&path).await?;
        file.set_len(len).await?;

        if volume.host.is_none() {
            volume.host = Some(self.host.clone());
        }
        info!("📦 Provisioned volume {} at {:?}", volume.id, path);
        self.repo.create_volume(volume).await
    }

    /// Create a directory-backed volume and persist the record.
    pub async fn provision_directory_volume(&self, mut volume: Volume) -> Result<Volume> {
        let path = self.volumes_dir.join(&volume.id);
        tokio::fs::create_dir_all(&path).await?;
        if volume.host.is_none() {
            volume.host = Some(self.host.clone());
        }
        info!("📁 Provisioned directory volume {} at {:?}", volume.id, path);
        self.repo.create_volume(volume).await
    }

    async fn copy_device(src: PathBuf, dst: PathBuf) -> Result<PathBuf> {
        tokio::task::spawn_blocking(move || -> io::Result<PathBuf> {
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent)?;
            }
            if src.is_dir() {
                copy_tree(&src, &dst)?;
            } else {
                fs::copy(&src, &dst)?;
            }
            Ok(dst)
        })
        .await
        .map_err(|e| BackupError::Other(e.into()))?
        .map_err(BackupError::from)
    }

    async fn remove_device(path: &Path) -> io::Result<()> {
        if path.is_dir() {
            tokio::fs::remove_dir_all(path).await
        } else {
            tokio::fs::remove_file(path).await
        }
    }

    fn connection_for(path: PathBuf, kind: ResourceKind, id: &str) -> Result<ConnectionInfo> {
        if !path.exists() {
            return Err(BackupError::not_found(kind, id));
        }
        Ok(ConnectionInfo::local(&path))
    }
}

/// Recursive copy of a directory-backed device.
pub(crate) fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(io::Error::other)?;
        let target = dst.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[async_trait]
impl VolumeApi for LocalVolumeApi {
    async fn get_backup_device(
        &self,
        _ctx: &RequestContext,
        volume_id: &str,
    ) -> Result<BackupDeviceSupport> {
        self.repo.get_volume(volume_id).await?;
        Ok(BackupDeviceSupport {
            temp_snapshot: self.temp_snapshots,
        })
    }

    async fn secure_file_operations_enabled(
        &self,
        _ctx: &RequestContext,
        _volume_id: &str,
    ) -> Result<bool> {
        Ok(self.secure_file_operations)
    }

    async fn initialize_connection(
        &self,
        _ctx: &RequestContext,
        volume_id: &str,
        connector: &ConnectorProperties,
    ) -> Result<ConnectionInfo> {
        debug!("Exporting volume {} to {}", volume_id, connector.host);
        Self::connection_for(self.volume_path(volume_id), ResourceKind::Volume, volume_id)
    }

    async fn terminate_connection(
        &self,
        _ctx: &RequestContext,
        volume_id: &str,
        connector: &ConnectorProperties,
        force: bool,
    ) -> Result<()> {
        debug!(
            "Terminated connection of volume {} to {} (force: {})",
            volume_id, connector.host, force
        );
        Ok(())
    }

    async fn initialize_connection_snapshot(
        &self,
        _ctx: &RequestContext,
        snapshot_id: &str,
        connector: &ConnectorProperties,
    ) -> Result<ConnectionInfo> {
        debug!("Exporting snapshot {} to {}", snapshot_id, connector.host);
        Self::connection_for(
            self.snapshot_path(snapshot_id),
            ResourceKind::Snapshot,
            snapshot_id,
        )
    }

    async fn terminate_connection_snapshot(
        &self,
        _ctx: &RequestContext,
        snapshot_id: &str,
        connector: &ConnectorProperties,
        force: bool,
    ) -> Result<()> {
        debug!(
            "Terminated connection of snapshot {} to {} (force: {})",
            snapshot_id, connector.host, force
        );
        Ok(())
    }

    async fn remove_export_snapshot(&self, _ctx: &RequestContext, snapshot_id: &str) -> Result<()> {
        debug!("Removed export of snapshot {}", snapshot_id);
        Ok(())
    }

    async fn create_temp_snapshot(&self, _ctx: &RequestContext, volume_id: &str) -> Result<Snapshot> {
        let volume = self.repo.get_volume(volume_id).await?;
        let id = Uuid::new_v4().to_string();
        let src = self.volume_path(volume_id);
        let dst = if src.is_dir() {
            self.volumes_dir.join("snapshots").join(&id)
        } else {
            self.volumes_dir.join("snapshots").join(format!("{}.img", id))
        };
        Self::copy_device(src, dst).await?;

        let mut snapshot = Snapshot::new(id, volume_id, volume.size);
        snapshot.encryption_key_id = volume.encryption_key_id.clone();
        let snapshot = self.repo.create_snapshot(snapshot).await?;
        info!("📸 Created temporary snapshot {} of volume {}", snapshot.id, volume_id);
        Ok(snapshot)
    }

    async fn create_temp_cloned_volume(
        &self,
        _ctx: &RequestContext,
        volume_id: &str,
        same_host: bool,
    ) -> Result<Volume> {
        let source = self.repo.get_volume(volume_id).await?;
        let id = Uuid::new_v4().to_string();
        let src = self.volume_path(volume_id);
        let dst = if src.is_dir() {
            self.volumes_dir.join(&id)
        } else {
            self.volumes_dir.join(format!("{}.img", id))
        };
        Self::copy_device(src, dst).await?;

        let mut clone = Volume::new(id, source.size);
        clone.host = if same_host {
            source.host.clone()
        } else {
            Some(self.host.clone())
        };
        clone.status = VolumeStatus::Available;
        clone.encryption_key_id = source.encryption_key_id.clone();
        clone.project_id = source.project_id.clone();
        let clone = self.repo.create_volume(clone).await?;
        info!("📦 Created temporary clone {} of volume {}", clone.id, volume_id);
        Ok(clone)
    }

    async fn delete_volume(&self, _ctx: &RequestContext, volume_id: &str) -> Result<()> {
        let record = self.repo.destroy_volume(volume_id).await;
        let file = Self::remove_device(&self.volume_path(volume_id)).await;

        match (record, file) {
            (Err(e), Err(_)) if e.is_not_found() => Err(e),
            (Err(e), _) if !e.is_not_found() => Err(e),
            (_, Err(e)) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => {
                info!("🗑️ Deleted volume {}", volume_id);
                Ok(())
            }
        }
    }

    async fn delete_snapshot(&self, _ctx: &RequestContext, snapshot_id: &str) -> Result<()> {
        let record = self.repo.destroy_snapshot(snapshot_id).await;
        let file = Self::remove_device(&self.snapshot_path(snapshot_id)).await;

        match (record, file) {
            (Err(e), Err(_)) if e.is_not_found() => Err(e),
            (Err(e), _) if !e.is_not_found() => Err(e),
            (_, Err(e)) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => {
                info!("🗑️ Deleted snapshot {}", snapshot_id);
                Ok(())
            }
        }
    }
}
