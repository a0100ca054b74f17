mod common;

use async_trait::async_trait;
use bolt_backup::api::{BackupDriverRegistry, BackupRpc, InProcessRouter, Repository};
use bolt_backup::manager::ExportedBackup;
use bolt_backup::repository::BackupUpdate;
use bolt_backup::{
    Backup, BackupError, BackupStatus, ImportOutcome, RequestContext, Result, RestoreOutcome,
};
use common::{FaultyDriver, Harness};
use pretty_assertions::assert_eq;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

/// Host-to-host transport that only records where imports were sent.
#[derive(Default)]
struct RecordingRpc {
    calls: Mutex<Vec<(String, Vec<String>)>>,
}

#[async_trait]
impl BackupRpc for RecordingRpc {
    async fn import_record(
        &self,
        _ctx: &RequestContext,
        host: &str,
        _backup_id: &str,
        _service: &str,
        _backup_url: &str,
        candidate_hosts: Vec<String>,
    ) -> Result<ImportOutcome> {
        self.calls
            .lock()
            .unwrap()
            .push((host.to_string(), candidate_hosts));
        Ok(ImportOutcome::Relayed {
            host: host.to_string(),
        })
    }
}

fn host(name: &'static str, driver: &'static str) -> impl FnOnce(&mut bolt_backup::BackupConfig) {
    move |config| {
        config.host = name.to_string();
        config.backup_driver = driver.to_string();
    }
}

async fn placeholder(h: &Harness, id: &str) {
    h.repo.create_backup(Backup::new(id, "")).await.unwrap();
}

#[tokio::test]
async fn test_export_then_import_on_another_host() {
    let origin = Harness::new();
    origin.volume_with("vol-1", 1, b"portable bytes").await;
    origin.available_backup("bk-1", "vol-1").await;

    let record = origin.manager.export_record(&origin.ctx, "bk-1").await.unwrap();
    assert_eq!(record.backup_service, common::DRIVER);
    assert_eq!(origin.backup("bk-1").await.status, BackupStatus::Available);

    let exported = ExportedBackup::decode(&record.backup_url).unwrap();
    assert_eq!(exported.id, "bk-1");
    assert_eq!(exported.volume_id, "vol-1");

    let target = Harness::with_config(host("node-b", common::DRIVER));
    placeholder(&target, "bk-1").await;
    let outcome = target
        .manager
        .import_record(&target.ctx, "bk-1", &record.backup_service, &record.backup_url, Vec::new())
        .await
        .unwrap();

    let ImportOutcome::Imported(imported) = outcome else {
        panic!("import was relayed instead of handled locally");
    };
    assert_eq!(imported.status, BackupStatus::Available);
    assert_eq!(imported.host.as_deref(), Some("node-b"));
    assert_eq!(imported.volume_id, "vol-1");
    assert_eq!(imported.size, 1);
    assert_eq!(target.driver.stored("bk-1").unwrap(), b"portable bytes");

    target.volume_with("vol-dst", 1, b"").await;
    let report = target
        .manager
        .restore_backup(&target.ctx, "bk-1", "vol-dst")
        .await
        .unwrap();
    assert_eq!(report.outcome, RestoreOutcome::Completed);
    assert_eq!(target.read_volume("vol-dst"), b"portable bytes");
}

#[tokio::test]
async fn test_import_relays_to_next_host_with_shorter_list() {
    let rpc = Arc::new(RecordingRpc::default());
    let h = Harness::build(|_| {}, true, {
        let rpc = rpc.clone();
        move |builder| builder.rpc(rpc)
    });
    placeholder(&h, "bk-1").await;

    let outcome = h
        .manager
        .import_record(
            &h.ctx,
            "bk-1",
            "tape",
            "00",
            vec!["node-a".into(), "node-b".into(), "node-c".into()],
        )
        .await
        .unwrap();

    assert_eq!(
        outcome,
        ImportOutcome::Relayed {
            host: "node-b".into()
        }
    );
    let calls = rpc.calls.lock().unwrap().clone();
    assert_eq!(calls, vec![("node-b".to_string(), vec!["node-c".to_string()])]);
    // the placeholder belongs to the host that ends up importing
    assert_eq!(h.backup("bk-1").await.status, BackupStatus::Creating);
}

#[tokio::test]
async fn test_import_never_relays_to_itself() {
    let rpc = Arc::new(RecordingRpc::default());
    let h = Harness::build(|_| {}, true, {
        let rpc = rpc.clone();
        move |builder| builder.rpc(rpc)
    });
    placeholder(&h, "bk-1").await;

    let err = h
        .manager
        .import_record(&h.ctx, "bk-1", "tape", "00", vec!["node-a".into()])
        .await
        .unwrap_err();

    assert!(matches!(err, BackupError::ServiceNotRegistered { .. }));
    assert!(rpc.calls.lock().unwrap().is_empty());
    let backup = h.backup("bk-1").await;
    assert_eq!(backup.status, BackupStatus::Error);
    assert!(backup.fail_reason.is_some());
}

#[tokio::test]
async fn test_import_relay_reaches_host_with_the_service() {
    let origin = Harness::with_config(host("node-z", "tape"));
    origin.volume_with("vol-1", 1, b"tape data").await;
    origin.available_backup("bk-1", "vol-1").await;
    let record = origin.manager.export_record(&origin.ctx, "bk-1").await.unwrap();
    assert_eq!(record.backup_service, "tape");

    let router = Arc::new(InProcessRouter::new());
    let with_router = |config: fn(&mut bolt_backup::BackupConfig)| {
        let router = router.clone();
        Harness::build(config, true, move |builder| builder.rpc(router))
    };
    let a = with_router(|_| {});
    let b = with_router(|config| {
        config.host = "node-b".into();
        config.backup_driver = "tape".into();
    });
    router.register(&a.manager);
    router.register(&b.manager);
    assert_eq!(router.hosts(), vec!["node-a".to_string(), "node-b".to_string()]);

    placeholder(&b, "bk-1").await;
    let outcome = a
        .manager
        .import_record(
            &a.ctx,
            "bk-1",
            &record.backup_service,
            &record.backup_url,
            vec!["node-a".into(), "node-b".into()],
        )
        .await
        .unwrap();

    assert_eq!(
        outcome,
        ImportOutcome::Relayed {
            host: "node-b".into()
        }
    );
    let imported = b.backup("bk-1").await;
    assert_eq!(imported.status, BackupStatus::Available);
    assert_eq!(imported.service.as_deref(), Some("tape"));
    assert_eq!(b.driver.stored("bk-1").unwrap(), b"tape data");
}

#[tokio::test]
async fn test_failed_relay_fails_the_placeholder() {
    let router = Arc::new(InProcessRouter::new());
    let h = Harness::build(|_| {}, true, move |builder| builder.rpc(router));
    placeholder(&h, "bk-1").await;

    let err = h
        .manager
        .import_record(&h.ctx, "bk-1", "tape", "00", vec!["node-gone".into()])
        .await
        .unwrap_err();

    assert!(matches!(err, BackupError::NotSupported { .. }));
    let backup = h.backup("bk-1").await;
    assert_eq!(backup.status, BackupStatus::Error);
    assert!(backup.fail_reason.unwrap().contains("node-gone"));
}

#[tokio::test]
async fn test_import_of_record_for_other_backup_fails_placeholder() {
    let origin = Harness::new();
    origin.volume_with("vol-1", 1, b"data").await;
    origin.available_backup("bk-1", "vol-1").await;
    let record = origin.manager.export_record(&origin.ctx, "bk-1").await.unwrap();

    let target = Harness::with_config(host("node-b", common::DRIVER));
    placeholder(&target, "bk-2").await;
    let err = target
        .manager
        .import_record(&target.ctx, "bk-2", &record.backup_service, &record.backup_url, Vec::new())
        .await
        .unwrap_err();

    assert!(matches!(err, BackupError::InvalidBackup { .. }));
    assert_eq!(target.backup("bk-2").await.status, BackupStatus::Error);
    assert_eq!(target.driver.stored("bk-2"), None);
}

#[tokio::test]
async fn test_import_of_garbage_url_fails_placeholder() {
    let h = Harness::new();
    placeholder(&h, "bk-1").await;

    let err = h
        .manager
        .import_record(&h.ctx, "bk-1", common::DRIVER, "definitely not hex", Vec::new())
        .await
        .unwrap_err();

    assert!(matches!(err, BackupError::InvalidBackup { .. }));
    assert_eq!(h.backup("bk-1").await.status, BackupStatus::Error);
}

#[tokio::test]
async fn test_export_requires_available_backup() {
    let h = Harness::new();
    h.repo
        .create_backup(
            Backup::new("bk-1", "vol-1")
                .with_service(common::DRIVER)
                .with_status(BackupStatus::Error),
        )
        .await
        .unwrap();

    let err = h.manager.export_record(&h.ctx, "bk-1").await.unwrap_err();
    assert!(matches!(err, BackupError::InvalidBackup { .. }));
}

#[tokio::test]
async fn test_export_requires_the_active_service() {
    let h = Harness::build(|_| {}, true, |builder| {
        let mut drivers = BackupDriverRegistry::new();
        drivers.register(Arc::new(FaultyDriver::new(common::DRIVER, true)));
        drivers.register(Arc::new(FaultyDriver::new("other", true)));
        builder.drivers(drivers)
    });
    h.repo
        .create_backup(
            Backup::new("bk-1", "vol-1")
                .with_host("node-a")
                .with_service("other")
                .with_status(BackupStatus::Available),
        )
        .await
        .unwrap();

    let err = h.manager.export_record(&h.ctx, "bk-1").await.unwrap_err();

    assert!(matches!(err, BackupError::InvalidBackup { .. }));
    assert_eq!(h.backup("bk-1").await.status, BackupStatus::Available);
}

#[tokio::test]
async fn test_reset_status_to_available_clears_failure() {
    let h = Harness::new();
    h.volume_with("vol-1", 1, b"data").await;
    h.driver.fail_backup.store(true, Ordering::SeqCst);
    h.pending_backup("bk-1", "vol-1").await;
    h.manager.create_backup(&h.ctx, "bk-1").await.unwrap_err();
    assert!(h.backup("bk-1").await.fail_reason.is_some());

    let backup = h
        .manager
        .reset_status(&h.ctx, "bk-1", BackupStatus::Available)
        .await
        .unwrap();

    assert_eq!(backup.status, BackupStatus::Available);
    assert_eq!(backup.fail_reason, None);
    let events = h.notifier.events();
    assert!(events.contains(&"backup.reset_status.start".to_string()));
    assert!(events.contains(&"backup.reset_status.end".to_string()));
}

#[tokio::test]
async fn test_reset_status_only_accepts_available_or_error() {
    let h = Harness::new();
    h.volume_with("vol-1", 1, b"data").await;
    h.available_backup("bk-1", "vol-1").await;

    for status in [BackupStatus::Creating, BackupStatus::Deleting, BackupStatus::Restoring] {
        let err = h
            .manager
            .reset_status(&h.ctx, "bk-1", status)
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::InvalidBackup { .. }));
    }
    assert_eq!(h.backup("bk-1").await.status, BackupStatus::Available);

    h.repo
        .update_backup("bk-1", &BackupUpdate::status(BackupStatus::Restoring))
        .await
        .unwrap();
    let backup = h
        .manager
        .reset_status(&h.ctx, "bk-1", BackupStatus::Error)
        .await
        .unwrap();
    assert_eq!(backup.status, BackupStatus::Error);
}
