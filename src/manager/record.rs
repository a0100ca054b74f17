//! Portable backup records.
//!
//! An exported record is the backup's driver name plus a hex encoded JSON
//! document holding the fields another deployment needs to adopt the data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use super::BackupManager;
use crate::context::RequestContext;
use crate::error::{BackupError, Result};
use crate::ledger::{Operation, StatusLedger};
use crate::models::{Backup, BackupStatus};
use crate::quota::QuotaDeltas;
use crate::repository::{BackupUpdate, ReadDeleted};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub backup_service: String,
    pub backup_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedBackup {
    pub id: String,
    pub volume_id: String,
    pub size: u64,
    pub object_count: u64,
    pub container: Option<String>,
    pub parent_id: Option<String>,
    pub service: String,
    pub snapshot: bool,
    pub encryption_key_id: Option<String>,
    pub data_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub driver_info: serde_json::Value,
}

impl ExportedBackup {
    pub fn from_backup(backup: &Backup, service: &str, driver_info: serde_json::Value) -> Self {
        Self {
            id: backup.id.clone(),
            volume_id: backup.volume_id.clone(),
            size: backup.size,
            object_count: backup.object_count,
            container: backup.container.clone(),
            parent_id: backup.parent_id.clone(),
            service: service.to_string(),
            snapshot: backup.is_snapshot_sourced(),
            encryption_key_id: backup.encryption_key_id.clone(),
            data_timestamp: backup.data_timestamp,
            driver_info,
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(hex::encode(serde_json::to_vec(self)?))
    }

    pub fn decode(backup_url: &str) -> Result<Self> {
        let bytes = hex::decode(backup_url.trim())
            .map_err(|e| BackupError::invalid_backup(format!("backup url is not hex: {}", e)))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| BackupError::invalid_backup(format!("backup url does not hold a backup record: {}", e)))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImportOutcome {
    Imported(Backup),
    /// Handed to another host that has the service.
    Relayed { host: String },
}

impl BackupManager {
    /// Describe an `available` backup so it can be imported elsewhere.
    /// The backup's status is not changed.
    #[instrument(skip(self, ctx), fields(request_id = %ctx.request_id))]
    pub async fn export_record(&self, ctx: &RequestContext, backup_id: &str) -> Result<BackupRecord> {
        let backup = self.repo.get_backup(backup_id, ReadDeleted::No).await?;
        StatusLedger::check_backup(backup.status, Operation::Export)?;

        let service = backup.service.clone().ok_or_else(|| {
            BackupError::invalid_backup(format!("backup {} was never stored by a driver", backup.id))
        })?;
        if service != self.config.backup_driver {
            return Err(BackupError::invalid_backup(format!(
                "backup {} belongs to service '{}', {} runs '{}'",
                backup.id, service, self.config.host, self.config.backup_driver
            )));
        }
        let driver = self.drivers.get(&service)?;

        let record = backup.clone();
        let driver_info = self
            .limiter
            .run_blocking(move || driver.export_record(&record))
            .await?;

        let backup_url = ExportedBackup::from_backup(&backup, &service, driver_info).encode()?;
        info!("📤 Exported backup {} ({})", backup.id, service);
        self.notify(ctx, &backup, "export");
        Ok(BackupRecord {
            backup_service: service,
            backup_url,
        })
    }

    /// Adopt an exported record into the placeholder backup `backup_id`.
    ///
    /// When `service` is not registered here the import is relayed to the
    /// first of `candidate_hosts` other than this host, with that host
    /// removed from the list it receives.
    #[instrument(skip(self, ctx, backup_url), fields(request_id = %ctx.request_id))]
    pub async fn import_record(
        &self,
        ctx: &RequestContext,
        backup_id: &str,
        service: &str,
        backup_url: &str,
        candidate_hosts: Vec<String>,
    ) -> Result<ImportOutcome> {
        if !self.drivers.contains(service) {
            return self
                .relay_import(ctx, backup_id, service, backup_url, candidate_hosts)
                .await;
        }

        let backup = self.repo.get_backup(backup_id, ReadDeleted::No).await?;
        StatusLedger::check_backup(backup.status, Operation::Import)?;
        self.notify(ctx, &backup, "import.start");

        let exported = match ExportedBackup::decode(backup_url) {
            Ok(exported) if exported.id == backup.id => exported,
            Ok(exported) => {
                let e = BackupError::invalid_backup(format!(
                    "record describes backup {}, not {}",
                    exported.id, backup.id
                ));
                self.fail_import(&backup.id, &e).await;
                return Err(e);
            }
            Err(e) => {
                self.fail_import(&backup.id, &e).await;
                return Err(e);
            }
        };

        let reservation = match self
            .quota
            .reserve(ctx, QuotaDeltas::for_backup(exported.size))
            .await
        {
            Ok(reservation) => reservation,
            Err(e) => {
                self.fail_import(&backup.id, &e).await;
                return Err(e);
            }
        };

        let adopted = async {
            let driver = self.drivers.get(service)?;
            let record = backup.clone();
            let driver_info = exported.driver_info.clone();
            self.limiter
                .run_blocking(move || driver.import_record(&record, &driver_info))
                .await?;

            let update = BackupUpdate {
                host: Some(Some(self.config.host.clone())),
                service: Some(Some(service.to_string())),
                volume_id: Some(exported.volume_id.clone()),
                container: Some(exported.container.clone()),
                size: Some(exported.size),
                object_count: Some(exported.object_count),
                parent_id: Some(exported.parent_id.clone()),
                encryption_key_id: Some(exported.encryption_key_id.clone()),
                data_timestamp: Some(exported.data_timestamp),
                ..BackupUpdate::status(StatusLedger::backup_on_success(Operation::Import))
            }
            .with_fail_reason(None);
            self.repo
                .conditional_update_backup(&backup.id, &[BackupStatus::Creating], &update)
                .await?
                .ok_or_else(|| {
                    BackupError::invalid_backup(format!(
                        "backup {} left 'creating' during the import",
                        backup.id
                    ))
                })
        }
        .await;

        match adopted {
            Ok(imported) => {
                if let Err(e) = self.quota.commit(ctx, &reservation).await {
                    warn!("Failed to commit quota of imported backup {}: {}", imported.id, e);
                }
                info!("📥 Imported backup {} ({})", imported.id, service);
                self.notify(ctx, &imported, "import.end");
                Ok(ImportOutcome::Imported(imported))
            }
            Err(e) => {
                error!("❌ Import of backup {} failed: {}", backup.id, e);
                if let Err(rollback) = self.quota.rollback(ctx, &reservation).await {
                    warn!("Failed to roll back quota of backup {}: {}", backup.id, rollback);
                }
                self.fail_import(&backup.id, &e).await;
                Err(e)
            }
        }
    }

    async fn relay_import(
        &self,
        ctx: &RequestContext,
        backup_id: &str,
        service: &str,
        backup_url: &str,
        candidate_hosts: Vec<String>,
    ) -> Result<ImportOutcome> {
        let mut remaining: Vec<String> = candidate_hosts
            .into_iter()
            .filter(|host| host != &self.config.host)
            .collect();

        if let Some(rpc) = self.rpc.as_ref().filter(|_| !remaining.is_empty()) {
            let next = remaining.remove(0);
            info!(
                "📨 Service {} not on {}, relaying import of {} to {} ({} hosts left)",
                service,
                self.config.host,
                backup_id,
                next,
                remaining.len()
            );
            if let Err(e) = rpc
                .import_record(ctx, &next, backup_id, service, backup_url, remaining)
                .await
            {
                error!("❌ Relay of import {} to {} failed: {}", backup_id, next, e);
                self.fail_import(backup_id, &e).await;
                return Err(e);
            }
            return Ok(ImportOutcome::Relayed { host: next });
        }

        let e = BackupError::ServiceNotRegistered {
            service: service.to_string(),
        };
        self.fail_import(backup_id, &e).await;
        Err(e)
    }

    async fn fail_import(&self, backup_id: &str, cause: &BackupError) {
        self.mark_backup(
            backup_id,
            &[BackupStatus::Creating],
            BackupUpdate::failed(StatusLedger::backup_on_failure(Operation::Import), cause.to_string()),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn record_survives_hex_and_json() {
        let mut backup = Backup::new("bk-1", "vol-1").with_service("posix");
        backup.size = 3;
        backup.container = Some("nightly".into());
        let exported = ExportedBackup::from_backup(&backup, "posix", serde_json::json!({"chunks": []}));

        let url = exported.encode().unwrap();
        assert!(url.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(ExportedBackup::decode(&url).unwrap(), exported);
    }

    #[test]
    fn garbage_urls_are_invalid_backups() {
        let err = ExportedBackup::decode("not hex").unwrap_err();
        assert!(matches!(err, BackupError::InvalidBackup { .. }));

        let err = ExportedBackup::decode(&hex::encode(b"{\"id\": 1}")).unwrap_err();
        assert!(matches!(err, BackupError::InvalidBackup { .. }));
    }
}
