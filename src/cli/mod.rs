use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "bolt-backup")]
#[command(about = "Backup orchestration for Bolt volumes")]
#[command(version, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long, env = "BOLT_BACKUP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Emit results as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Repair backups and volumes left mid-operation by a previous run
    InitHost,

    /// Back up a volume
    Create {
        /// Volume to back up
        volume: String,

        /// Backup id (generated when omitted)
        #[arg(long)]
        id: Option<String>,

        /// Back up this snapshot of the volume instead of the volume itself
        #[arg(long)]
        snapshot: Option<String>,

        /// Display name
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Restore a backup onto a volume
    Restore {
        /// Backup id
        backup: String,

        /// Destination volume id
        volume: String,
    },

    /// Delete a backup
    Delete {
        /// Backup id
        backup: String,

        /// Delete even when the normal checks refuse (driver must support it)
        #[arg(short, long)]
        force: bool,
    },

    /// Print the portable record of a backup
    Export {
        /// Backup id
        backup: String,
    },

    /// Import an exported backup record
    Import {
        /// Backup id carried by the record
        backup: String,

        /// Service name from the exported record
        service: String,

        /// Encoded record (backup_url)
        payload: String,

        /// Hosts to relay to when the service is not available here
        #[arg(long = "host")]
        hosts: Vec<String>,
    },

    /// Force the status of a backup
    ResetStatus {
        /// Backup id
        backup: String,

        /// Target status: available or error
        status: String,
    },

    /// List backups and volumes
    List {
        /// Include deleted backups
        #[arg(short, long)]
        all: bool,
    },

    /// Volume management for the local volume backend
    Volume {
        #[command(subcommand)]
        command: VolumeCommands,
    },

    /// Check that the backup service can serve requests
    Health,
}

#[derive(Subcommand)]
pub enum VolumeCommands {
    /// Provision a volume
    Create {
        /// Volume id
        id: String,

        /// Size in GiB
        #[arg(short, long, default_value_t = 1)]
        size: u64,

        /// Directory-backed volume instead of an image file
        #[arg(long)]
        directory: bool,

        /// Image length in bytes, overriding the size
        #[arg(long)]
        bytes: Option<u64>,
    },

    /// Take a snapshot of a volume for backing up
    Snapshot {
        /// Volume id
        volume: String,
    },
}
