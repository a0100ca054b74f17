#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use bolt_backup::api::{
    BackupDriver, BackupDriverRegistry, InMemoryKeyManager, KeyManager, LocalVolumeApi,
    MemoryRepository, NotificationSink, Repository, RestoreContext, UsageEvent, VolumeApi,
};
use bolt_backup::attach::DeviceIo;
use bolt_backup::connector::{ConnectionInfo, ConnectorProperties};
use bolt_backup::volume_api::BackupDeviceSupport;
use bolt_backup::drivers::{BackupOutcome, RestoredMetadata};
use bolt_backup::models::VolumeAttachment;
use bolt_backup::repository::{BackupFilter, BackupUpdate, ReadDeleted, SnapshotUpdate, VolumeUpdate};
use bolt_backup::{
    Backup, BackupConfig, BackupError, BackupManager, BackupStatus, RequestContext, Result, Snapshot,
    Volume, VolumeStatus,
};

pub const HOST: &str = "node-a";
pub const DRIVER: &str = "fake";

fn injected(what: &str) -> BackupError {
    BackupError::Other(anyhow::anyhow!("injected {} failure", what))
}

/// Backup driver keeping backup data in memory, with switches to make
/// each call fail.
pub struct FaultyDriver {
    name: String,
    force_delete: bool,
    pub fail_backup: AtomicBool,
    pub fail_delete: AtomicBool,
    pub fail_restore: AtomicBool,
    /// Restores spin until cancelled.
    pub block_restore: AtomicBool,
    pub report_size: AtomicU64,
    pub report_parent: Mutex<Option<String>>,
    pub restore_metadata: Mutex<RestoredMetadata>,
    stored: Mutex<HashMap<String, Vec<u8>>>,
    pub backups: AtomicUsize,
    pub restores_started: AtomicUsize,
    pub deletes: AtomicUsize,
}

impl FaultyDriver {
    pub fn new(name: &str, force_delete: bool) -> Self {
        Self {
            name: name.to_string(),
            force_delete,
            fail_backup: AtomicBool::new(false),
            fail_delete: AtomicBool::new(false),
            fail_restore: AtomicBool::new(false),
            block_restore: AtomicBool::new(false),
            report_size: AtomicU64::new(1),
            report_parent: Mutex::new(None),
            restore_metadata: Mutex::new(RestoredMetadata::new()),
            stored: Mutex::new(HashMap::new()),
            backups: AtomicUsize::new(0),
            restores_started: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
        }
    }

    pub fn stored(&self, backup_id: &str) -> Option<Vec<u8>> {
        self.stored.lock().unwrap().get(backup_id).cloned()
    }
}

impl BackupDriver for FaultyDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn backup(&self, backup: &Backup, device: &mut DeviceIo) -> Result<BackupOutcome> {
        self.backups.fetch_add(1, Ordering::SeqCst);
        if self.fail_backup.load(Ordering::SeqCst) {
            return Err(BackupError::driver(&self.name, "injected backup failure"));
        }

        let mut data = Vec::new();
        if let DeviceIo::File { file, .. } = device {
            file.read_to_end(&mut data)?;
        }
        self.stored.lock().unwrap().insert(backup.id.clone(), data);

        Ok(BackupOutcome {
            size: self.report_size.load(Ordering::SeqCst),
            object_count: 1,
            parent_id: self.report_parent.lock().unwrap().clone(),
            container: Some("fake-container".to_string()),
        })
    }

    fn restore(
        &self,
        backup: &Backup,
        _volume_id: &str,
        device: &mut DeviceIo,
        ctx: &RestoreContext,
    ) -> Result<RestoredMetadata> {
        self.restores_started.fetch_add(1, Ordering::SeqCst);
        if self.block_restore.load(Ordering::SeqCst) {
            for _ in 0..2000 {
                ctx.check(&backup.id)?;
                std::thread::sleep(Duration::from_millis(5));
            }
            return Err(BackupError::driver(&self.name, "restore was never cancelled"));
        }
        if self.fail_restore.load(Ordering::SeqCst) {
            return Err(BackupError::driver(&self.name, "injected restore failure"));
        }

        let data = self
            .stored(&backup.id)
            .ok_or_else(|| BackupError::driver(&self.name, "no data stored"))?;
        if let DeviceIo::File { file, .. } = device {
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&data)?;
            file.set_len(data.len() as u64)?;
        }
        Ok(self.restore_metadata.lock().unwrap().clone())
    }

    fn delete(&self, backup: &Backup) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(BackupError::driver(&self.name, "injected delete failure"));
        }
        self.stored.lock().unwrap().remove(&backup.id);
        Ok(())
    }

    fn export_record(&self, backup: &Backup) -> Result<serde_json::Value> {
        let data = self.stored(&backup.id).unwrap_or_default();
        Ok(serde_json::json!({ "data": hex::encode(data) }))
    }

    fn import_record(&self, backup: &Backup, driver_info: &serde_json::Value) -> Result<()> {
        let data = driver_info["data"]
            .as_str()
            .and_then(|encoded| hex::decode(encoded).ok())
            .ok_or_else(|| BackupError::driver(&self.name, "driver info has no data"))?;
        self.stored.lock().unwrap().insert(backup.id.clone(), data);
        Ok(())
    }

    fn supports_force_delete(&self) -> bool {
        self.force_delete
    }
}

/// Repository whose backup writes fail for chosen ids, counting every
/// conditional update it sees.
#[derive(Default)]
pub struct FlakyRepository {
    inner: MemoryRepository,
    failing: Mutex<HashSet<String>>,
    conditional_calls: Mutex<HashMap<String, usize>>,
}

impl FlakyRepository {
    pub fn fail_backup(&self, id: &str) {
        self.failing.lock().unwrap().insert(id.to_string());
    }

    pub fn conditional_calls(&self, id: &str) -> usize {
        self.conditional_calls.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    fn check(&self, id: &str) -> Result<()> {
        if self.failing.lock().unwrap().contains(id) {
            return Err(injected("repository"));
        }
        Ok(())
    }
}

#[async_trait]
impl Repository for FlakyRepository {
    async fn create_backup(&self, backup: Backup) -> Result<Backup> {
        self.inner.create_backup(backup).await
    }

    async fn get_backup(&self, id: &str, read_deleted: ReadDeleted) -> Result<Backup> {
        self.inner.get_backup(id, read_deleted).await
    }

    async fn list_backups(&self, filter: &BackupFilter) -> Result<Vec<Backup>> {
        self.inner.list_backups(filter).await
    }

    async fn update_backup(&self, id: &str, update: &BackupUpdate) -> Result<Backup> {
        self.check(id)?;
        self.inner.update_backup(id, update).await
    }

    async fn conditional_update_backup(
        &self,
        id: &str,
        expected: &[BackupStatus],
        update: &BackupUpdate,
    ) -> Result<Option<Backup>> {
        *self
            .conditional_calls
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_default() += 1;
        self.check(id)?;
        self.inner.conditional_update_backup(id, expected, update).await
    }

    async fn destroy_backup(&self, id: &str) -> Result<Backup> {
        self.check(id)?;
        self.inner.destroy_backup(id).await
    }

    async fn create_volume(&self, volume: Volume) -> Result<Volume> {
        self.inner.create_volume(volume).await
    }

    async fn get_volume(&self, id: &str) -> Result<Volume> {
        self.inner.get_volume(id).await
    }

    async fn list_volumes_by_host(&self, host: &str) -> Result<Vec<Volume>> {
        self.inner.list_volumes_by_host(host).await
    }

    async fn update_volume(&self, id: &str, update: &VolumeUpdate) -> Result<Volume> {
        self.inner.update_volume(id, update).await
    }

    async fn conditional_update_volume(
        &self,
        id: &str,
        expected: &[VolumeStatus],
        update: &VolumeUpdate,
    ) -> Result<Option<Volume>> {
        self.inner.conditional_update_volume(id, expected, update).await
    }

    async fn destroy_volume(&self, id: &str) -> Result<()> {
        self.inner.destroy_volume(id).await
    }

    async fn attach_volume(&self, volume_id: &str, attachment: VolumeAttachment) -> Result<Volume> {
        self.inner.attach_volume(volume_id, attachment).await
    }

    async fn detach_volume(&self, volume_id: &str, attachment_id: &str) -> Result<Volume> {
        self.inner.detach_volume(volume_id, attachment_id).await
    }

    async fn create_snapshot(&self, snapshot: Snapshot) -> Result<Snapshot> {
        self.inner.create_snapshot(snapshot).await
    }

    async fn get_snapshot(&self, id: &str) -> Result<Snapshot> {
        self.inner.get_snapshot(id).await
    }

    async fn update_snapshot(&self, id: &str, update: &SnapshotUpdate) -> Result<Snapshot> {
        self.inner.update_snapshot(id, update).await
    }

    async fn destroy_snapshot(&self, id: &str) -> Result<()> {
        self.inner.destroy_snapshot(id).await
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<UsageEvent>>,
    pub fail: AtomicBool,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|event| event.event_type.clone())
            .collect()
    }

    /// Most recent event of `event_type`.
    pub fn last(&self, event_type: &str) -> Option<UsageEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|event| event.event_type == event_type)
            .cloned()
    }
}

impl NotificationSink for RecordingNotifier {
    fn notify_usage(&self, _ctx: &RequestContext, event: &UsageEvent) -> Result<()> {
        self.events.lock().unwrap().push(event.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(injected("notification"));
        }
        Ok(())
    }
}

/// Key service counting clones and remembering deletions.
#[derive(Default)]
pub struct CountingKeys {
    pub inner: InMemoryKeyManager,
    pub clones: AtomicUsize,
    deleted: Mutex<Vec<String>>,
}

impl CountingKeys {
    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn clone_count(&self) -> usize {
        self.clones.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeyManager for CountingKeys {
    async fn clone_key(&self, ctx: &RequestContext, key_id: &str) -> Result<String> {
        self.clones.fetch_add(1, Ordering::SeqCst);
        self.inner.clone_key(ctx, key_id).await
    }

    async fn delete_key(&self, ctx: &RequestContext, key_id: &str) -> Result<()> {
        self.deleted.lock().unwrap().push(key_id.to_string());
        self.inner.delete_key(ctx, key_id).await
    }
}

/// Volume service counting temp resource deletions; deletions of chosen
/// ids fail.
pub struct CountingVolumeApi {
    inner: Arc<LocalVolumeApi>,
    failing: Mutex<HashSet<String>>,
    pub volume_deletes: AtomicUsize,
    pub snapshot_deletes: AtomicUsize,
}

impl CountingVolumeApi {
    pub fn new(inner: Arc<LocalVolumeApi>) -> Self {
        Self {
            inner,
            failing: Mutex::new(HashSet::new()),
            volume_deletes: AtomicUsize::new(0),
            snapshot_deletes: AtomicUsize::new(0),
        }
    }

    pub fn fail_delete(&self, id: &str) {
        self.failing.lock().unwrap().insert(id.to_string());
    }

    pub fn deletes(&self) -> usize {
        self.volume_deletes.load(Ordering::SeqCst) + self.snapshot_deletes.load(Ordering::SeqCst)
    }

    fn check(&self, id: &str) -> Result<()> {
        if self.failing.lock().unwrap().contains(id) {
            return Err(injected("volume service"));
        }
        Ok(())
    }
}

#[async_trait]
impl VolumeApi for CountingVolumeApi {
    async fn get_backup_device(
        &self,
        ctx: &RequestContext,
        volume_id: &str,
    ) -> Result<BackupDeviceSupport> {
        self.inner.get_backup_device(ctx, volume_id).await
    }

    async fn secure_file_operations_enabled(
        &self,
        ctx: &RequestContext,
        volume_id: &str,
    ) -> Result<bool> {
        self.inner.secure_file_operations_enabled(ctx, volume_id).await
    }

    async fn initialize_connection(
        &self,
        ctx: &RequestContext,
        volume_id: &str,
        connector: &ConnectorProperties,
    ) -> Result<ConnectionInfo> {
        self.inner.initialize_connection(ctx, volume_id, connector).await
    }

    async fn terminate_connection(
        &self,
        ctx: &RequestContext,
        volume_id: &str,
        connector: &ConnectorProperties,
        force: bool,
    ) -> Result<()> {
        self.inner
            .terminate_connection(ctx, volume_id, connector, force)
            .await
    }

    async fn initialize_connection_snapshot(
        &self,
        ctx: &RequestContext,
        snapshot_id: &str,
        connector: &ConnectorProperties,
    ) -> Result<ConnectionInfo> {
        self.inner
            .initialize_connection_snapshot(ctx, snapshot_id, connector)
            .await
    }

    async fn terminate_connection_snapshot(
        &self,
        ctx: &RequestContext,
        snapshot_id: &str,
        connector: &ConnectorProperties,
        force: bool,
    ) -> Result<()> {
        self.inner
            .terminate_connection_snapshot(ctx, snapshot_id, connector, force)
            .await
    }

    async fn remove_export_snapshot(&self, ctx: &RequestContext, snapshot_id: &str) -> Result<()> {
        self.inner.remove_export_snapshot(ctx, snapshot_id).await
    }

    async fn create_temp_snapshot(&self, ctx: &RequestContext, volume_id: &str) -> Result<Snapshot> {
        self.inner.create_temp_snapshot(ctx, volume_id).await
    }

    async fn create_temp_cloned_volume(
        &self,
        ctx: &RequestContext,
        volume_id: &str,
        same_host: bool,
    ) -> Result<Volume> {
        self.inner
            .create_temp_cloned_volume(ctx, volume_id, same_host)
            .await
    }

    async fn delete_volume(&self, ctx: &RequestContext, volume_id: &str) -> Result<()> {
        self.volume_deletes.fetch_add(1, Ordering::SeqCst);
        self.check(volume_id)?;
        self.inner.delete_volume(ctx, volume_id).await
    }

    async fn delete_snapshot(&self, ctx: &RequestContext, snapshot_id: &str) -> Result<()> {
        self.snapshot_deletes.fetch_add(1, Ordering::SeqCst);
        self.check(snapshot_id)?;
        self.inner.delete_snapshot(ctx, snapshot_id).await
    }
}

/// One backup host wired to fakes, with its files under a temp dir.
pub struct Harness {
    pub dir: TempDir,
    pub config: BackupConfig,
    pub repo: Arc<FlakyRepository>,
    pub volumes: Arc<LocalVolumeApi>,
    pub volume_api: Arc<CountingVolumeApi>,
    pub keys: Arc<CountingKeys>,
    pub driver: Arc<FaultyDriver>,
    pub notifier: Arc<RecordingNotifier>,
    pub manager: Arc<BackupManager>,
    pub ctx: RequestContext,
}

pub fn test_config(dir: &TempDir, host: &str) -> BackupConfig {
    let mut config = BackupConfig::default();
    config.host = host.to_string();
    config.backup_driver = DRIVER.to_string();
    config.native_thread_pool_size = 4;
    config.state_file = dir.path().join("state.json");
    config.volumes_dir = dir.path().join("volumes");
    config.posix.path = dir.path().join("backups");
    config
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(tweak: impl FnOnce(&mut BackupConfig)) -> Self {
        Self::build(tweak, true, |builder| builder)
    }

    /// `customize` sees the builder after the fakes are wired in.
    pub fn build(
        tweak: impl FnOnce(&mut BackupConfig),
        force_delete: bool,
        customize: impl FnOnce(bolt_backup::BackupManagerBuilder) -> bolt_backup::BackupManagerBuilder,
    ) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir, HOST);
        tweak(&mut config);

        let repo = Arc::new(FlakyRepository::default());
        let volumes = Arc::new(LocalVolumeApi::new(
            repo.clone(),
            &config.volumes_dir,
            &config.host,
        ));
        let volume_api = Arc::new(CountingVolumeApi::new(volumes.clone()));
        let keys = Arc::new(CountingKeys::default());
        let driver = Arc::new(FaultyDriver::new(&config.backup_driver, force_delete));
        let notifier = Arc::new(RecordingNotifier::default());

        let mut drivers = BackupDriverRegistry::new();
        drivers.register(driver.clone());

        let builder = BackupManager::builder(config.clone(), repo.clone(), volume_api.clone(), keys.clone())
            .drivers(drivers)
            .notifier(notifier.clone());
        let manager = customize(builder).build().unwrap();

        Self {
            dir,
            config,
            repo,
            volumes,
            volume_api,
            keys,
            driver,
            notifier,
            manager,
            ctx: RequestContext::admin(),
        }
    }

    /// Image-file volume on this host holding `content`.
    pub async fn volume_with(&self, id: &str, size_gb: u64, content: &[u8]) -> Volume {
        self.provision(Volume::new(id, size_gb).with_host(&self.config.host), content)
            .await
    }

    pub async fn provision(&self, volume: Volume, content: &[u8]) -> Volume {
        let id = volume.id.clone();
        self.volumes
            .provision_volume(volume, Some(content.len() as u64))
            .await
            .unwrap();
        std::fs::write(self.volumes.volume_path(&id), content).unwrap();
        self.repo.get_volume(&id).await.unwrap()
    }

    pub async fn set_volume_status(&self, id: &str, status: VolumeStatus) {
        self.repo
            .update_volume(id, &VolumeUpdate::status(status))
            .await
            .unwrap();
    }

    /// Backup record as the API layer leaves it before `create_backup`.
    pub async fn pending_backup(&self, id: &str, volume_id: &str) -> Backup {
        self.repo
            .create_backup(Backup::new(id, volume_id).with_host(&self.config.host))
            .await
            .unwrap()
    }

    /// A backup that went through `create_backup` successfully.
    pub async fn available_backup(&self, id: &str, volume_id: &str) -> Backup {
        self.pending_backup(id, volume_id).await;
        self.manager.create_backup(&self.ctx, id).await.unwrap()
    }

    pub async fn backup(&self, id: &str) -> Backup {
        self.repo.get_backup(id, ReadDeleted::Yes).await.unwrap()
    }

    pub async fn volume(&self, id: &str) -> Volume {
        self.repo.get_volume(id).await.unwrap()
    }

    pub fn read_volume(&self, id: &str) -> Vec<u8> {
        std::fs::read(self.volumes.volume_path(id)).unwrap()
    }
}
