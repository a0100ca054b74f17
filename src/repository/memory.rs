use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{
    BackupFilter, BackupUpdate, ReadDeleted, Repository, SnapshotUpdate, VolumeUpdate,
};
use crate::error::{BackupError, ResourceKind, Result};
use crate::models::{
    Backup, BackupStatus, Snapshot, SnapshotStatus, Volume, VolumeAttachment, VolumeStatus,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct State {
    backups: BTreeMap<String, Backup>,
    volumes: BTreeMap<String, Volume>,
    snapshots: BTreeMap<String, Snapshot>,
}

/// Repository kept in memory, optionally mirrored to a JSON state file
/// after every write.
#[derive(Debug, Clone, Default)]
pub struct MemoryRepository {
    state: Arc<RwLock<State>>,
    state_file: Option<PathBuf>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the state file if it exists; writes go back to the same file.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = if tokio::fs::try_exists(&path).await? {
            let content = tokio::fs::read_to_string(&path).await?;
            let state: State = serde_json::from_str(&content)?;
            info!(
                "📂 Loaded state from {:?}: {} backups, {} volumes, {} snapshots",
                path,
                state.backups.len(),
                state.volumes.len(),
                state.snapshots.len()
            );
            state
        } else {
            debug!("State file {:?} does not exist yet, starting empty", path);
            State::default()
        };

        Ok(Self {
            state: Arc::new(RwLock::new(state)),
            state_file: Some(path),
        })
    }

    async fn persist(&self, state: &State) -> Result<()> {
        let Some(ref path) = self.state_file else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let content = serde_json::to_string_pretty(state)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Run `change` against the state. With a state file the change is made
    /// on a copy that replaces the live state only once it is on disk.
    async fn write<T, F>(&self, change: F) -> Result<T>
    where
        F: FnOnce(&mut State) -> Result<T> + Send,
    {
        let mut state = self.state.write().await;
        if self.state_file.is_none() {
            return change(&mut state);
        }
        let mut next = state.clone();
        let out = change(&mut next)?;
        self.persist(&next).await?;
        *state = next;
        Ok(out)
    }

    fn live_volume<'a>(state: &'a mut State, id: &str) -> Result<&'a mut Volume> {
        state
            .volumes
            .get_mut(id)
            .filter(|v| !v.deleted)
            .ok_or_else(|| BackupError::not_found(ResourceKind::Volume, id))
    }

    fn live_backup<'a>(state: &'a mut State, id: &str) -> Result<&'a mut Backup> {
        state
            .backups
            .get_mut(id)
            .filter(|b| !b.deleted)
            .ok_or_else(|| BackupError::not_found(ResourceKind::Backup, id))
    }

    fn live_snapshot<'a>(state: &'a mut State, id: &str) -> Result<&'a mut Snapshot> {
        state
            .snapshots
            .get_mut(id)
            .filter(|s| !s.deleted)
            .ok_or_else(|| BackupError::not_found(ResourceKind::Snapshot, id))
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn create_backup(&self, backup: Backup) -> Result<Backup> {
        self.write(|state| {
            if state.backups.get(&backup.id).is_some_and(|b| !b.deleted) {
                return Err(BackupError::invalid_backup(format!(
                    "backup {} already exists",
                    backup.id
                )));
            }
            state.backups.insert(backup.id.clone(), backup.clone());
            Ok(backup)
        })
        .await
    }

    async fn get_backup(&self, id: &str, read_deleted: ReadDeleted) -> Result<Backup> {
        let state = self.state.read().await;
        state
            .backups
            .get(id)
            .filter(|b| !b.deleted || read_deleted == ReadDeleted::Yes)
            .cloned()
            .ok_or_else(|| BackupError::not_found(ResourceKind::Backup, id))
    }

    async fn list_backups(&self, filter: &BackupFilter) -> Result<Vec<Backup>> {
        let state = self.state.read().await;
        Ok(state
            .backups
            .values()
            .filter(|b| filter.matches(b))
            .cloned()
            .collect())
    }

    async fn update_backup(&self, id: &str, update: &BackupUpdate) -> Result<Backup> {
        self.write(|state| {
            let backup = Self::live_backup(state, id)?;
            update.apply(backup);
            Ok(backup.clone())
        })
        .await
    }

    async fn conditional_update_backup(
        &self,
        id: &str,
        expected: &[BackupStatus],
        update: &BackupUpdate,
    ) -> Result<Option<Backup>> {
        self.write(|state| {
            let backup = Self::live_backup(state, id)?;
            if !expected.contains(&backup.status) {
                return Ok(None);
            }
            update.apply(backup);
            Ok(Some(backup.clone()))
        })
        .await
    }

    async fn destroy_backup(&self, id: &str) -> Result<Backup> {
        self.write(|state| {
            let backup = Self::live_backup(state, id)?;
            let now = Utc::now();
            backup.status = BackupStatus::Deleted;
            backup.deleted = true;
            backup.deleted_at = Some(now);
            backup.updated_at = Some(now);
            Ok(backup.clone())
        })
        .await
    }

    async fn create_volume(&self, volume: Volume) -> Result<Volume> {
        self.write(|state| {
            state.volumes.insert(volume.id.clone(), volume.clone());
            Ok(volume)
        })
        .await
    }

    async fn get_volume(&self, id: &str) -> Result<Volume> {
        let state = self.state.read().await;
        state
            .volumes
            .get(id)
            .filter(|v| !v.deleted)
            .cloned()
            .ok_or_else(|| BackupError::not_found(ResourceKind::Volume, id))
    }

    async fn list_volumes_by_host(&self, host: &str) -> Result<Vec<Volume>> {
        let state = self.state.read().await;
        Ok(state
            .volumes
            .values()
            .filter(|v| !v.deleted && v.host.as_deref() == Some(host))
            .cloned()
            .collect())
    }

    async fn update_volume(&self, id: &str, update: &VolumeUpdate) -> Result<Volume> {
        self.write(|state| {
            let volume = Self::live_volume(state, id)?;
            update.apply(volume);
            Ok(volume.clone())
        })
        .await
    }

    async fn conditional_update_volume(
        &self,
        id: &str,
        expected: &[VolumeStatus],
        update: &VolumeUpdate,
    ) -> Result<Option<Volume>> {
        self.write(|state| {
            let volume = Self::live_volume(state, id)?;
            if !expected.contains(&volume.status) {
                return Ok(None);
            }
            update.apply(volume);
            Ok(Some(volume.clone()))
        })
        .await
    }

    async fn destroy_volume(&self, id: &str) -> Result<()> {
        self.write(|state| {
            let volume = Self::live_volume(state, id)?;
            volume.deleted = true;
            volume.status = VolumeStatus::Deleting;
            Ok(())
        })
        .await
    }

    async fn attach_volume(&self, volume_id: &str, attachment: VolumeAttachment) -> Result<Volume> {
        self.write(|state| {
            let volume = Self::live_volume(state, volume_id)?;
            volume.attachments.retain(|a| a.id != attachment.id);
            volume.attachments.push(attachment);
            Ok(volume.clone())
        })
        .await
    }

    async fn detach_volume(&self, volume_id: &str, attachment_id: &str) -> Result<Volume> {
        self.write(|state| {
            let volume = Self::live_volume(state, volume_id)?;
            let before = volume.attachments.len();
            volume.attachments.retain(|a| a.id != attachment_id);
            if volume.attachments.len() == before {
                return Err(BackupError::not_found(ResourceKind::Attachment, attachment_id));
            }
            Ok(volume.clone())
        })
        .await
    }

    async fn create_snapshot(&self, snapshot: Snapshot) -> Result<Snapshot> {
        self.write(|state| {
            state.snapshots.insert(snapshot.id.clone(), snapshot.clone());
            Ok(snapshot)
        })
        .await
    }

    async fn get_snapshot(&self, id: &str) -> Result<Snapshot> {
        let state = self.state.read().await;
        state
            .snapshots
            .get(id)
            .filter(|s| !s.deleted)
            .cloned()
            .ok_or_else(|| BackupError::not_found(ResourceKind::Snapshot, id))
    }

    async fn update_snapshot(&self, id: &str, update: &SnapshotUpdate) -> Result<Snapshot> {
        self.write(|state| {
            let snapshot = Self::live_snapshot(state, id)?;
            update.apply(snapshot);
            Ok(snapshot.clone())
        })
        .await
    }

    async fn destroy_snapshot(&self, id: &str) -> Result<()> {
        self.write(|state| {
            let snapshot = Self::live_snapshot(state, id)?;
            snapshot.deleted = true;
            snapshot.status = SnapshotStatus::Deleted;
            Ok(())
        })
        .await
    }
}
