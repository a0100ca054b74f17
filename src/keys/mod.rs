//! Encryption key lifecycle for backups of encrypted volumes.
//!
//! A backup never shares a key id with a volume: creating a backup clones
//! the source key, and restoring onto another volume clones the backup's
//! key for that volume.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::context::RequestContext;
use crate::error::Result;
use crate::models::{Backup, ENCRYPTION_KEY_ID_KEY, Volume};
use crate::repository::{BackupFilter, BackupUpdate, Repository, VolumeUpdate};

pub mod memory;

pub use memory::InMemoryKeyManager;

/// Key id shared by every volume encrypted before per-volume keys existed.
pub const FIXED_KEY_ID: &str = "00000000-0000-0000-0000-000000000000";

/// Encryption key service collaborator
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeyManager: Send + Sync {
    /// Copy the key material under a new id and return that id.
    async fn clone_key(&self, ctx: &RequestContext, key_id: &str) -> Result<String>;
    async fn delete_key(&self, ctx: &RequestContext, key_id: &str) -> Result<()>;
}

/// Key changes to persist after a restore, plus anything operators should
/// hear about.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RestoreKeyPlan {
    /// Key id gleaned for a legacy backup; persist it on the backup.
    pub gleaned_backup_key: Option<String>,
    /// New key id for the restored volume, `Some(None)` clears it.
    pub volume_key: Option<Option<String>>,
    pub warnings: Vec<String>,
}

fn non_empty(key: Option<&str>) -> Option<&str> {
    key.filter(|k| !k.is_empty())
}

pub struct EncryptionKeyBroker {
    keys: Arc<dyn KeyManager>,
}

impl EncryptionKeyBroker {
    pub fn new(keys: Arc<dyn KeyManager>) -> Self {
        Self { keys }
    }

    /// Key id the backup should carry. Idempotent: a backup that already
    /// has a key keeps it and nothing is cloned.
    pub async fn on_backup_create(
        &self,
        ctx: &RequestContext,
        backup: &Backup,
        source_key_id: Option<&str>,
    ) -> Result<Option<String>> {
        if backup.has_encryption_key() {
            debug!(
                "Backup {} already carries key {:?}, not cloning again",
                backup.id, backup.encryption_key_id
            );
            return Ok(backup.encryption_key_id.clone());
        }

        let Some(source) = non_empty(source_key_id) else {
            return Ok(None);
        };

        let cloned = self.keys.clone_key(ctx, source).await?;
        info!("🔑 Cloned key {} for backup {}", source, backup.id);
        Ok(Some(cloned))
    }

    /// Decide the key state of `volume` after the driver restored `backup`
    /// onto it. `original_volume_key` is the volume's key before the
    /// restore started.
    pub async fn on_restore(
        &self,
        ctx: &RequestContext,
        backup: &Backup,
        volume: &Volume,
        original_volume_key: Option<&str>,
    ) -> RestoreKeyPlan {
        let mut plan = RestoreKeyPlan::default();
        let original = non_empty(original_volume_key).map(str::to_string);
        let current = volume.encryption_key_id.clone();

        let mut backup_key = non_empty(backup.encryption_key_id.as_deref()).map(str::to_string);
        if backup_key.is_none() {
            let gleaned = non_empty(volume.metadata.get(ENCRYPTION_KEY_ID_KEY).map(String::as_str))
                .map(str::to_string);
            if let Some(ref key) = gleaned {
                info!("🔑 Gleaned key {} for legacy backup {}", key, backup.id);
                plan.gleaned_backup_key = Some(key.clone());
            }
            backup_key = gleaned;
        }

        if volume.id == backup.volume_id {
            if current != original {
                plan.volume_key = Some(original);
            }
            return plan;
        }

        let Some(backup_key) = backup_key else {
            if current != original {
                plan.volume_key = Some(original);
            }
            return plan;
        };

        match self.keys.clone_key(ctx, &backup_key).await {
            Ok(cloned) => {
                plan.volume_key = Some(Some(cloned));
            }
            Err(e) => {
                error!(
                    "Failed to clone key {} of backup {} for volume {}: {}",
                    backup_key, backup.id, volume.id, e
                );
                plan.warnings.push(format!(
                    "volume {} keeps its previous key: cloning backup key failed: {}",
                    volume.id, e
                ));
                if current != original {
                    plan.volume_key = Some(original);
                }
                return plan;
            }
        }

        if let Some(previous) = original {
            if let Some(warning) = self.delete_quietly(ctx, &previous).await {
                plan.warnings.push(warning);
            }
        }

        plan
    }

    /// Drop a backup's key when the backup goes away.
    pub async fn on_backup_delete(&self, ctx: &RequestContext, backup: &Backup) -> Option<String> {
        let key = non_empty(backup.encryption_key_id.as_deref())?;
        self.delete_quietly(ctx, key).await
    }

    /// Missing keys are fine; any other failure is logged and returned as a
    /// warning.
    async fn delete_quietly(&self, ctx: &RequestContext, key_id: &str) -> Option<String> {
        match self.keys.delete_key(ctx, key_id).await {
            Ok(()) => {
                debug!("Deleted key {}", key_id);
                None
            }
            Err(e) if e.is_not_found() => {
                debug!("Key {} already gone", key_id);
                None
            }
            Err(e) => {
                warn!("Failed to delete key {}: {}", key_id, e);
                Some(format!("failed to delete key {}: {}", key_id, e))
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub volumes_migrated: usize,
    pub backups_migrated: usize,
    pub failures: usize,
}

/// Replace the legacy fixed key on this host's volumes and backups with
/// per-entity clones. One failing entity does not stop the rest.
pub async fn migrate_fixed_key(
    ctx: &RequestContext,
    repo: &dyn Repository,
    keys: &dyn KeyManager,
    host: &str,
) -> Result<MigrationReport> {
    let mut report = MigrationReport::default();

    for volume in repo.list_volumes_by_host(host).await? {
        if volume.encryption_key_id.as_deref() != Some(FIXED_KEY_ID) {
            continue;
        }
        let migrated = async {
            let key = keys.clone_key(ctx, FIXED_KEY_ID).await?;
            repo.update_volume(&volume.id, &VolumeUpdate::default().with_encryption_key(Some(key)))
                .await
        };
        match migrated.await {
            Ok(_) => report.volumes_migrated += 1,
            Err(e) => {
                warn!("Fixed key migration failed for volume {}: {}", volume.id, e);
                report.failures += 1;
            }
        }
    }

    for backup in repo.list_backups(&BackupFilter::by_host(host)).await? {
        if backup.encryption_key_id.as_deref() != Some(FIXED_KEY_ID) {
            continue;
        }
        let migrated = async {
            let key = keys.clone_key(ctx, FIXED_KEY_ID).await?;
            repo.update_backup(&backup.id, &BackupUpdate::default().with_encryption_key(Some(key)))
                .await
        };
        match migrated.await {
            Ok(_) => report.backups_migrated += 1,
            Err(e) => {
                warn!("Fixed key migration failed for backup {}: {}", backup.id, e);
                report.failures += 1;
            }
        }
    }

    if report.volumes_migrated + report.backups_migrated > 0 {
        info!(
            "🔑 Fixed key migration: {} volumes, {} backups, {} failures",
            report.volumes_migrated, report.backups_migrated, report.failures
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BackupError, ResourceKind};

    fn ctx() -> RequestContext {
        RequestContext::admin()
    }

    #[tokio::test]
    async fn create_clones_source_key_once() {
        let mut keys = MockKeyManager::new();
        keys.expect_clone_key()
            .withf(|_, id| id == "vol-key")
            .times(1)
            .returning(|_, _| Ok("backup-key".to_string()));
        let broker = EncryptionKeyBroker::new(Arc::new(keys));

        let mut backup = Backup::new("b1", "v1");
        let first = broker
            .on_backup_create(&ctx(), &backup, Some("vol-key"))
            .await
            .unwrap();
        assert_eq!(first.as_deref(), Some("backup-key"));

        backup.encryption_key_id = first;
        let second = broker
            .on_backup_create(&ctx(), &backup, Some("vol-key"))
            .await
            .unwrap();
        assert_eq!(second.as_deref(), Some("backup-key"));
    }

    #[tokio::test]
    async fn create_without_source_key_is_noop() {
        let keys = MockKeyManager::new();
        let broker = EncryptionKeyBroker::new(Arc::new(keys));
        let backup = Backup::new("b1", "v1");
        assert_eq!(broker.on_backup_create(&ctx(), &backup, None).await.unwrap(), None);
        assert_eq!(broker.on_backup_create(&ctx(), &backup, Some("")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn restore_onto_source_volume_keeps_key() {
        let keys = MockKeyManager::new();
        let broker = EncryptionKeyBroker::new(Arc::new(keys));

        let mut backup = Backup::new("b1", "v1");
        backup.encryption_key_id = Some("backup-key".into());
        let volume = Volume::new("v1", 1).with_encryption_key("vol-key");

        let plan = broker.on_restore(&ctx(), &backup, &volume, Some("vol-key")).await;
        assert_eq!(plan, RestoreKeyPlan::default());
    }

    #[tokio::test]
    async fn restore_onto_other_volume_replaces_key() {
        let mut keys = MockKeyManager::new();
        keys.expect_clone_key()
            .withf(|_, id| id == "backup-key")
            .times(1)
            .returning(|_, _| Ok("fresh-key".to_string()));
        keys.expect_delete_key()
            .withf(|_, id| id == "old-key")
            .times(1)
            .returning(|_, _| Ok(()));
        let broker = EncryptionKeyBroker::new(Arc::new(keys));

        let mut backup = Backup::new("b1", "v1");
        backup.encryption_key_id = Some("backup-key".into());
        let volume = Volume::new("v2", 1).with_encryption_key("old-key");

        let plan = broker.on_restore(&ctx(), &backup, &volume, Some("old-key")).await;
        assert_eq!(plan.volume_key, Some(Some("fresh-key".to_string())));
        assert!(plan.warnings.is_empty());
    }

    #[tokio::test]
    async fn legacy_backup_key_is_gleaned_from_metadata() {
        let mut keys = MockKeyManager::new();
        keys.expect_clone_key()
            .withf(|_, id| id == "gleaned-key")
            .times(1)
            .returning(|_, _| Ok("fresh-key".to_string()));
        let broker = EncryptionKeyBroker::new(Arc::new(keys));

        let backup = Backup::new("b1", "v1");
        let mut volume = Volume::new("v2", 1);
        volume
            .metadata
            .insert(ENCRYPTION_KEY_ID_KEY.to_string(), "gleaned-key".to_string());

        let plan = broker.on_restore(&ctx(), &backup, &volume, None).await;
        assert_eq!(plan.gleaned_backup_key.as_deref(), Some("gleaned-key"));
        assert_eq!(plan.volume_key, Some(Some("fresh-key".to_string())));
    }

    #[tokio::test]
    async fn stale_key_delete_failure_is_reported() {
        let mut keys = MockKeyManager::new();
        keys.expect_clone_key()
            .returning(|_, _| Ok("fresh-key".to_string()));
        keys.expect_delete_key()
            .returning(|_, _| Err(BackupError::Other(anyhow::anyhow!("key service down"))));
        let broker = EncryptionKeyBroker::new(Arc::new(keys));

        let mut backup = Backup::new("b1", "v1");
        backup.encryption_key_id = Some("backup-key".into());
        let volume = Volume::new("v2", 1).with_encryption_key("old-key");

        let plan = broker.on_restore(&ctx(), &backup, &volume, Some("old-key")).await;
        assert_eq!(plan.volume_key, Some(Some("fresh-key".to_string())));
        assert_eq!(plan.warnings.len(), 1);
    }

    #[tokio::test]
    async fn missing_backup_key_on_delete_is_not_a_warning() {
        let mut keys = MockKeyManager::new();
        keys.expect_delete_key()
            .returning(|_, id| Err(BackupError::not_found(ResourceKind::EncryptionKey, id)));
        let broker = EncryptionKeyBroker::new(Arc::new(keys));

        let mut backup = Backup::new("b1", "v1");
        backup.encryption_key_id = Some("gone".into());
        assert_eq!(broker.on_backup_delete(&ctx(), &backup).await, None);
    }
}
