mod cli;

use anyhow::{Context, Result, anyhow, bail};
use bolt_backup::api::{InMemoryKeyManager, LocalVolumeApi, MemoryRepository, Repository, VolumeApi};
use bolt_backup::ledger::StatusLedger;
use bolt_backup::repository::{BackupFilter, ReadDeleted, SnapshotUpdate};
use bolt_backup::{Backup, BackupConfig, BackupManager, BackupStatus, ImportOutcome, RequestContext, Volume};
use clap::Parser;
use cli::{Cli, Commands, VolumeCommands};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = BackupConfig::load_or_default(cli.config.as_deref())?;
    if cli.verbose {
        config.logging.log_level = "debug".to_string();
    }
    let _log_guard = config.logging.init_tracing()?;

    info!("🚀 Bolt backup starting on {}", config.host);

    let repo = Arc::new(
        MemoryRepository::open(&config.state_file)
            .await
            .with_context(|| format!("opening state file {:?}", config.state_file))?,
    );
    let volumes = Arc::new(LocalVolumeApi::new(
        repo.clone(),
        &config.volumes_dir,
        &config.host,
    ));
    let keys = Arc::new(InMemoryKeyManager::new());
    let manager = BackupManager::builder(config.clone(), repo.clone(), volumes.clone(), keys).build()?;
    let ctx = RequestContext::admin();

    match cli.command {
        Commands::InitHost => {
            let report = manager.init_host(&ctx).await?;
            if cli.json {
                print_json(&report)?;
            } else if report.skipped {
                println!("Worker {} is not the primary worker, nothing to do", config.process_number);
            } else {
                println!("Volumes reset:        {}", report.volumes_reset);
                println!("Backups examined:     {}", report.backups_examined);
                println!("Backups reset:        {}", report.backups_reset);
                println!("Deletes retried:      {}", report.deletes_retried);
                println!("Temp cleanups:        {}", report.temp_cleanups_attempted);
                println!("Failures:             {}", report.failures);
            }
        }

        Commands::Create {
            volume,
            id,
            snapshot,
            name,
        } => {
            let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
            let mut backup = Backup::new(&id, &volume);
            backup.display_name = name;
            backup.project_id = ctx.project_id.clone();

            if let Some(snapshot_id) = snapshot {
                let current = repo.get_snapshot(&snapshot_id).await?;
                let marked = StatusLedger::snapshot_on_start(current.status).ok_or_else(|| {
                    anyhow!("snapshot {} is '{}' and cannot be backed up", snapshot_id, current.status)
                })?;
                repo.update_snapshot(&snapshot_id, &SnapshotUpdate::status(marked))
                    .await?;
                backup = backup.with_snapshot(snapshot_id);
            }

            repo.create_backup(backup).await?;
            let backup = manager.create_backup(&ctx, &id).await?;
            print_backup(&backup, cli.json)?;
        }

        Commands::Restore { backup, volume } => {
            let report = manager.restore_backup(&ctx, &backup, &volume).await?;
            if cli.json {
                print_json(&report)?;
            } else {
                println!(
                    "Restore of {} onto {}: {:?} (volume now '{}')",
                    report.backup.id, report.volume.id, report.outcome, report.volume.status
                );
                for warning in &report.warnings {
                    println!("  warning: {}", warning);
                }
            }
        }

        Commands::Delete { backup, force } => {
            manager.delete_backup(&ctx, &backup, force).await?;
            info!("✅ Backup '{}' deleted", backup);
        }

        Commands::Export { backup } => {
            let record = manager.export_record(&ctx, &backup).await?;
            if cli.json {
                print_json(&record)?;
            } else {
                println!("service: {}", record.backup_service);
                println!("url:     {}", record.backup_url);
            }
        }

        Commands::Import {
            backup,
            service,
            payload,
            hosts,
        } => {
            // the import placeholder the API layer would have created
            match repo.get_backup(&backup, ReadDeleted::No).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    let mut placeholder = Backup::new(&backup, "");
                    placeholder.project_id = ctx.project_id.clone();
                    repo.create_backup(placeholder).await?;
                }
                Err(e) => return Err(e.into()),
            }

            match manager
                .import_record(&ctx, &backup, &service, &payload, hosts)
                .await?
            {
                ImportOutcome::Imported(imported) => print_backup(&imported, cli.json)?,
                ImportOutcome::Relayed { host } => println!("Import of {} relayed to {}", backup, host),
            }
        }

        Commands::ResetStatus { backup, status } => {
            let status = BackupStatus::parse(&status)
                .ok_or_else(|| anyhow!("unknown backup status '{}'", status))?;
            let backup = manager.reset_status(&ctx, &backup, status).await?;
            print_backup(&backup, cli.json)?;
        }

        Commands::List { all } => {
            let filter = BackupFilter {
                read_deleted: if all { ReadDeleted::Yes } else { ReadDeleted::No },
                ..Default::default()
            };
            let backups = repo.list_backups(&filter).await?;
            let volumes = repo.list_volumes_by_host(&config.host).await?;

            if cli.json {
                print_json(&serde_json::json!({ "backups": backups, "volumes": volumes }))?;
                return Ok(());
            }

            println!(
                "{:<38} {:<38} {:<16} {:<8} {:<8} {:<10}",
                "BACKUP ID", "VOLUME", "STATUS", "SIZE", "OBJECTS", "SERVICE"
            );
            println!("{}", "─".repeat(122));
            for backup in &backups {
                println!(
                    "{:<38} {:<38} {:<16} {:<8} {:<8} {:<10}",
                    backup.id,
                    backup.volume_id,
                    backup.status,
                    format!("{}G", backup.size),
                    backup.object_count,
                    backup.service.as_deref().unwrap_or("-")
                );
            }

            println!();
            println!("{:<38} {:<18} {:<8} {:<38}", "VOLUME ID", "STATUS", "SIZE", "RESTORED FROM");
            println!("{}", "─".repeat(104));
            for volume in &volumes {
                println!(
                    "{:<38} {:<18} {:<8} {:<38}",
                    volume.id,
                    volume.status,
                    format!("{}G", volume.size),
                    volume.src_backup_id().unwrap_or("-")
                );
            }
        }

        Commands::Volume { command } => match command {
            VolumeCommands::Create {
                id,
                size,
                directory,
                bytes,
            } => {
                let mut volume = Volume::new(&id, size);
                volume.project_id = ctx.project_id.clone();
                let volume = if directory {
                    volumes.provision_directory_volume(volume).await?
                } else {
                    volumes.provision_volume(volume, bytes).await?
                };
                info!("✅ Volume '{}' created", volume.id);
                if cli.json {
                    print_json(&volume)?;
                }
            }

            VolumeCommands::Snapshot { volume } => {
                let snapshot = volumes.create_temp_snapshot(&ctx, &volume).await?;
                if cli.json {
                    print_json(&snapshot)?;
                } else {
                    println!("{}", snapshot.id);
                }
            }
        },

        Commands::Health => {
            let driver_ready = manager.drivers().contains(&config.backup_driver);
            let health = serde_json::json!({
                "host": config.host,
                "driver": config.backup_driver,
                "driver_ready": driver_ready,
                "drivers": manager.drivers().names(),
                "operation_slots": manager.limiter().available(),
                "native_threads": manager.limiter().pool().size(),
            });
            if cli.json {
                print_json(&health)?;
            } else {
                println!("Host:           {}", config.host);
                println!(
                    "Driver:         {} ({})",
                    config.backup_driver,
                    if driver_ready { "ready" } else { "missing" }
                );
                println!("Native threads: {}", manager.limiter().pool().size());
            }
            if !driver_ready {
                bail!("backup driver '{}' is not available", config.backup_driver);
            }
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_backup(backup: &Backup, json: bool) -> Result<()> {
    if json {
        return print_json(backup);
    }
    println!("Backup {}", backup.id);
    println!("  Volume:  {}", backup.volume_id);
    println!("  Status:  {}", backup.status);
    println!("  Size:    {} GiB ({} objects)", backup.size, backup.object_count);
    if let Some(ref parent) = backup.parent_id {
        println!("  Parent:  {}", parent);
    }
    if let Some(ref reason) = backup.fail_reason {
        println!("  Reason:  {}", reason);
    }
    Ok(())
}
