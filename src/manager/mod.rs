//! The backup orchestrator.
//!
//! `BackupManager` drives create, restore, delete, export and import of
//! backups on one host. Every operation re-reads the records it changes and
//! moves statuses with compare-and-set updates; the repository is the only
//! guard against a concurrent worker touching the same backup.

use async_trait::async_trait;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, instrument, warn};

use crate::attach::DeviceAttachmentCoordinator;
use crate::config::BackupConfig;
use crate::connector::DeviceConnector;
use crate::context::RequestContext;
use crate::drivers::{BackupDriverRegistry, RestoreContext};
use crate::error::{BackupError, Result};
use crate::keys::{EncryptionKeyBroker, KeyManager};
use crate::limiter::ConcurrencyLimiter;
use crate::models::{Backup, BackupStatus};
use crate::notify::{self, NotificationSink, TracingNotifier, UsageEvent};
use crate::quota::{QuotaService, UnlimitedQuota};
use crate::recovery::{CleanupRecoveryService, DeleteRetry, RecoveryReport};
use crate::repository::{BackupFilter, BackupUpdate, ReadDeleted, Repository};
use crate::temp::TempResourceManager;
use crate::volume_api::VolumeApi;

mod create;
mod delete;
mod record;
mod restore;
pub mod rpc;

pub use record::{BackupRecord, ExportedBackup, ImportOutcome};
pub use restore::{RESTORE_VOLUME_EXTRA, RestoreOutcome, RestoreReport};
pub use rpc::{BackupRpc, InProcessRouter};

pub struct BackupManager {
    config: BackupConfig,
    repo: Arc<dyn Repository>,
    volume_api: Arc<dyn VolumeApi>,
    drivers: BackupDriverRegistry,
    attach: Arc<DeviceAttachmentCoordinator>,
    temp: Arc<TempResourceManager>,
    keys: Arc<dyn KeyManager>,
    broker: EncryptionKeyBroker,
    limiter: ConcurrencyLimiter,
    quota: Arc<dyn QuotaService>,
    notifier: Arc<dyn NotificationSink>,
    rpc: Option<Arc<dyn BackupRpc>>,
    restores: Mutex<HashMap<String, RestoreContext>>,
    initialized: AtomicBool,
}

pub struct BackupManagerBuilder {
    config: BackupConfig,
    repo: Arc<dyn Repository>,
    volume_api: Arc<dyn VolumeApi>,
    keys: Arc<dyn KeyManager>,
    drivers: Option<BackupDriverRegistry>,
    quota: Arc<dyn QuotaService>,
    notifier: Arc<dyn NotificationSink>,
    rpc: Option<Arc<dyn BackupRpc>>,
    connectors: Vec<Arc<dyn DeviceConnector>>,
}

impl BackupManagerBuilder {
    /// Replace the built-in driver set.
    pub fn drivers(mut self, drivers: BackupDriverRegistry) -> Self {
        self.drivers = Some(drivers);
        self
    }

    pub fn quota(mut self, quota: Arc<dyn QuotaService>) -> Self {
        self.quota = quota;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn rpc(mut self, rpc: Arc<dyn BackupRpc>) -> Self {
        self.rpc = Some(rpc);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn DeviceConnector>) -> Self {
        self.connectors.push(connector);
        self
    }

    pub fn build(self) -> Result<Arc<BackupManager>> {
        self.config.validate()?;
        let drivers = self
            .drivers
            .unwrap_or_else(BackupDriverRegistry::with_builtin)
            .build(&self.config)?;

        let mut attach = DeviceAttachmentCoordinator::new(Arc::clone(&self.volume_api), &self.config.host);
        for connector in self.connectors {
            attach.register_connector(connector);
        }
        let attach = Arc::new(attach);

        let temp = Arc::new(TempResourceManager::new(
            Arc::clone(&self.repo),
            Arc::clone(&self.volume_api),
            attach.connector_properties(),
            self.config.backup_use_temp_snapshot,
            self.config.backup_use_same_host,
        ));
        let limiter = ConcurrencyLimiter::new(
            self.config.max_concurrent_operations,
            self.config.native_thread_pool_size,
        );

        info!(
            "🚀 Backup manager for {} using driver {} ({} operation slots, {} native threads)",
            self.config.host,
            self.config.backup_driver,
            match self.config.max_concurrent_operations {
                0 => "unbounded".to_string(),
                n => n.to_string(),
            },
            self.config.native_thread_pool_size
        );

        Ok(Arc::new(BackupManager {
            broker: EncryptionKeyBroker::new(Arc::clone(&self.keys)),
            config: self.config,
            repo: self.repo,
            volume_api: self.volume_api,
            drivers,
            attach,
            temp,
            keys: self.keys,
            limiter,
            quota: self.quota,
            notifier: self.notifier,
            rpc: self.rpc,
            restores: Mutex::new(HashMap::new()),
            initialized: AtomicBool::new(false),
        }))
    }
}

impl BackupManager {
    pub fn builder(
        config: BackupConfig,
        repo: Arc<dyn Repository>,
        volume_api: Arc<dyn VolumeApi>,
        keys: Arc<dyn KeyManager>,
    ) -> BackupManagerBuilder {
        BackupManagerBuilder {
            config,
            repo,
            volume_api,
            keys,
            drivers: None,
            quota: Arc::new(UnlimitedQuota),
            notifier: Arc::new(TracingNotifier),
            rpc: None,
            connectors: Vec::new(),
        }
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    pub fn host(&self) -> &str {
        &self.config.host
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    pub fn drivers(&self) -> &BackupDriverRegistry {
        &self.drivers
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    /// Ready to serve: startup cleanup ran and the active driver is loaded.
    pub fn is_working(&self) -> bool {
        self.initialized.load(Ordering::SeqCst) && self.drivers.contains(&self.config.backup_driver)
    }

    /// Startup entry point: repair what a previous process left behind.
    /// Only the primary worker of a host cleans up.
    #[instrument(skip_all, fields(host = %self.config.host))]
    pub async fn init_host(self: &Arc<Self>, ctx: &RequestContext) -> Result<RecoveryReport> {
        let report = if self.config.is_primary_worker() {
            let recovery = CleanupRecoveryService::new(
                Arc::clone(&self.repo),
                Arc::clone(&self.volume_api),
                Arc::clone(&self.temp),
                Arc::clone(&self.keys),
                Arc::clone(self) as Arc<dyn DeleteRetry>,
                self.attach.connector_properties(),
                self.config.service_inithost_offload,
            );
            recovery.run(ctx).await
        } else {
            info!(
                "Worker {} leaves startup cleanup to worker 1",
                self.config.process_number
            );
            RecoveryReport::skipped()
        };

        self.initialized.store(true, Ordering::SeqCst);
        Ok(report)
    }

    /// Whether any live backup is incremental to `backup_id`.
    pub async fn has_dependent_backups(&self, backup_id: &str) -> Result<bool> {
        let dependents = self.repo.list_backups(&BackupFilter::by_parent(backup_id)).await?;
        Ok(!dependents.is_empty())
    }

    /// Ask a running restore of `backup_id` to stop. Returns false when no
    /// restore of it is running on this host.
    pub fn cancel_restore(&self, backup_id: &str) -> bool {
        match self.restores().get(backup_id) {
            Some(ctx) => {
                info!("✋ Cancelling restore of backup {}", backup_id);
                ctx.cancel();
                true
            }
            None => false,
        }
    }

    /// Administrative override of a backup's status.
    #[instrument(skip(self, ctx), fields(request_id = %ctx.request_id))]
    pub async fn reset_status(
        &self,
        ctx: &RequestContext,
        backup_id: &str,
        status: BackupStatus,
    ) -> Result<Backup> {
        if !matches!(status, BackupStatus::Available | BackupStatus::Error) {
            return Err(BackupError::invalid_backup(format!(
                "cannot reset a backup to {}, only available or error",
                status
            )));
        }

        let backup = self.repo.get_backup(backup_id, ReadDeleted::No).await?;
        self.notify(ctx, &backup, "reset_status.start");
        info!("Resetting backup {} from {} to {}", backup.id, backup.status, status);

        let mut update = BackupUpdate::status(status);
        if status == BackupStatus::Available {
            update = update.with_fail_reason(None);
        }
        let backup = self.repo.update_backup(backup_id, &update).await?;

        self.notify(ctx, &backup, "reset_status.end");
        Ok(backup)
    }

    /// Claim the cancel slot of `backup_id`. None while another restore of
    /// it holds the slot.
    fn register_restore(&self, backup_id: &str) -> Option<RestoreContext> {
        match self.restores().entry(backup_id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => Some(slot.insert(RestoreContext::new()).clone()),
        }
    }

    fn restores(&self) -> MutexGuard<'_, HashMap<String, RestoreContext>> {
        self.restores
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self, ctx: &RequestContext, backup: &Backup, suffix: &str) {
        self.emit(ctx, UsageEvent::for_backup(backup, suffix));
    }

    fn emit(&self, ctx: &RequestContext, event: UsageEvent) {
        notify::emit(self.notifier.as_ref(), ctx, event);
    }

    /// Best effort compare-and-set into an error status; the operation's own
    /// error is what the caller sees.
    async fn mark_backup(
        &self,
        backup_id: &str,
        expected: &[BackupStatus],
        update: BackupUpdate,
    ) {
        match self
            .repo
            .conditional_update_backup(backup_id, expected, &update)
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => warn!(
                "Backup {} left {:?} concurrently, status not changed to {:?}",
                backup_id, expected, update.status
            ),
            Err(e) => warn!("Could not update status of backup {}: {}", backup_id, e),
        }
    }

    /// Keep the parent's dependent counter in step with incremental
    /// children.
    async fn adjust_dependents(&self, parent_id: &str, delta: i64) {
        let parent = match self.repo.get_backup(parent_id, ReadDeleted::No).await {
            Ok(parent) => parent,
            Err(e) => {
                warn!("Parent backup {} not updated: {}", parent_id, e);
                return;
            }
        };
        let count = (i64::from(parent.num_dependent_backups) + delta).max(0) as u32;
        let update = BackupUpdate {
            num_dependent_backups: Some(count),
            ..Default::default()
        };
        if let Err(e) = self.repo.update_backup(parent_id, &update).await {
            warn!("Parent backup {} not updated: {}", parent_id, e);
        }
    }
}

#[async_trait]
impl DeleteRetry for BackupManager {
    async fn retry_delete(&self, ctx: &RequestContext, backup_id: &str) -> Result<()> {
        self.delete_backup(ctx, backup_id, true).await
    }
}
