use bolt_backup::api::{InMemoryKeyManager, LocalVolumeApi, MemoryRepository, Repository};
use bolt_backup::repository::ReadDeleted;
use bolt_backup::{Backup, BackupConfig, BackupManager, BackupStatus, RequestContext, Volume};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tempfile::TempDir;

struct Host {
    repo: Arc<MemoryRepository>,
    volumes: Arc<LocalVolumeApi>,
    manager: Arc<BackupManager>,
}

fn config(dir: &TempDir, backups: &TempDir, host: &str) -> BackupConfig {
    let mut config = BackupConfig::default();
    config.host = host.to_string();
    config.native_thread_pool_size = 2;
    config.state_file = dir.path().join("state.json");
    config.volumes_dir = dir.path().join("volumes");
    config.posix.path = backups.path().to_path_buf();
    config.posix.chunk_size = 1024;
    config
}

fn host(dir: &TempDir, backups: &TempDir, name: &str) -> Host {
    let config = config(dir, backups, name);
    let repo = Arc::new(MemoryRepository::new());
    let volumes = Arc::new(LocalVolumeApi::new(
        repo.clone(),
        &config.volumes_dir,
        &config.host,
    ));
    let manager = BackupManager::builder(
        config,
        repo.clone(),
        volumes.clone(),
        Arc::new(InMemoryKeyManager::new()),
    )
    .build()
    .unwrap();
    Host {
        repo,
        volumes,
        manager,
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

#[tokio::test]
async fn test_posix_block_volume_round_trip() {
    let dir = TempDir::new().unwrap();
    let backups = TempDir::new().unwrap();
    let h = host(&dir, &backups, "node-a");
    let ctx = RequestContext::admin();
    let data = pattern(10_000);

    h.volumes
        .provision_volume(Volume::new("vol-1", 1), Some(data.len() as u64))
        .await
        .unwrap();
    std::fs::write(h.volumes.volume_path("vol-1"), &data).unwrap();
    h.volumes
        .provision_volume(Volume::new("vol-2", 1), Some(data.len() as u64))
        .await
        .unwrap();

    h.repo.create_backup(Backup::new("bk-1", "vol-1")).await.unwrap();
    let backup = h.manager.create_backup(&ctx, "bk-1").await.unwrap();
    assert_eq!(backup.status, BackupStatus::Available);
    assert_eq!(backup.service.as_deref(), Some("posix"));
    assert_eq!(backup.size, 1);
    assert_eq!(backup.object_count, 10);

    h.manager.restore_backup(&ctx, "bk-1", "vol-2").await.unwrap();
    assert_eq!(std::fs::read(h.volumes.volume_path("vol-2")).unwrap(), data);

    h.manager.delete_backup(&ctx, "bk-1", false).await.unwrap();
    assert!(!backups.path().join("backups").join("bk-1").exists());
    assert_eq!(
        h.repo.get_backup("bk-1", ReadDeleted::Yes).await.unwrap().status,
        BackupStatus::Deleted
    );
}

#[tokio::test]
async fn test_posix_second_backup_chains_to_first() {
    let dir = TempDir::new().unwrap();
    let backups = TempDir::new().unwrap();
    let h = host(&dir, &backups, "node-a");
    let ctx = RequestContext::admin();

    h.volumes
        .provision_volume(Volume::new("vol-1", 1), Some(2048))
        .await
        .unwrap();
    for id in ["bk-1", "bk-2"] {
        h.repo.create_backup(Backup::new(id, "vol-1")).await.unwrap();
        h.manager.create_backup(&ctx, id).await.unwrap();
    }

    let second = h.repo.get_backup("bk-2", ReadDeleted::No).await.unwrap();
    assert_eq!(second.parent_id.as_deref(), Some("bk-1"));
    let first = h.repo.get_backup("bk-1", ReadDeleted::No).await.unwrap();
    assert_eq!(first.num_dependent_backups, 1);
}

#[tokio::test]
async fn test_posix_directory_volume_round_trip() {
    let dir = TempDir::new().unwrap();
    let backups = TempDir::new().unwrap();
    let h = host(&dir, &backups, "node-a");
    let ctx = RequestContext::admin();

    h.volumes
        .provision_directory_volume(Volume::new("share", 1))
        .await
        .unwrap();
    let source = h.volumes.volume_path("share");
    std::fs::create_dir_all(source.join("nested")).unwrap();
    std::fs::write(source.join("top.txt"), b"top level").unwrap();
    std::fs::write(source.join("nested").join("deep.bin"), pattern(3000)).unwrap();

    h.volumes
        .provision_directory_volume(Volume::new("share-copy", 1))
        .await
        .unwrap();

    h.repo.create_backup(Backup::new("bk-1", "share")).await.unwrap();
    h.manager.create_backup(&ctx, "bk-1").await.unwrap();
    h.manager.restore_backup(&ctx, "bk-1", "share-copy").await.unwrap();

    let target = h.volumes.volume_path("share-copy");
    assert_eq!(std::fs::read(target.join("top.txt")).unwrap(), b"top level");
    assert_eq!(
        std::fs::read(target.join("nested").join("deep.bin")).unwrap(),
        pattern(3000)
    );
}

#[tokio::test]
async fn test_posix_backup_moves_between_hosts_sharing_storage() {
    let backups = TempDir::new().unwrap();
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let a = host(&dir_a, &backups, "node-a");
    let b = host(&dir_b, &backups, "node-b");
    let ctx = RequestContext::admin();
    let data = pattern(4096);

    a.volumes
        .provision_volume(Volume::new("vol-1", 1), Some(data.len() as u64))
        .await
        .unwrap();
    std::fs::write(a.volumes.volume_path("vol-1"), &data).unwrap();
    a.repo.create_backup(Backup::new("bk-1", "vol-1")).await.unwrap();
    a.manager.create_backup(&ctx, "bk-1").await.unwrap();
    let record = a.manager.export_record(&ctx, "bk-1").await.unwrap();

    b.repo.create_backup(Backup::new("bk-1", "")).await.unwrap();
    b.manager
        .import_record(&ctx, "bk-1", &record.backup_service, &record.backup_url, Vec::new())
        .await
        .unwrap();
    b.volumes
        .provision_volume(Volume::new("vol-restored", 1), Some(data.len() as u64))
        .await
        .unwrap();
    b.manager.restore_backup(&ctx, "bk-1", "vol-restored").await.unwrap();

    assert_eq!(std::fs::read(b.volumes.volume_path("vol-restored")).unwrap(), data);
}
