use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{ConfigError, Result};
use crate::monitoring::TracingConfig;

/// Backup service configuration, loaded from TOML. Every field has a
/// default, so an empty file is a valid configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Host name backups and volumes are owned by.
    pub host: String,
    /// Service name of the driver new backups are created with.
    pub backup_driver: String,
    /// Index of this worker when several backup processes share a host.
    /// Only worker 1 runs startup cleanup.
    pub process_number: u32,
    pub backup_use_same_host: bool,
    pub backup_use_temp_snapshot: bool,
    /// Concurrent creates and restores; 0 leaves them unbounded.
    pub max_concurrent_operations: usize,
    /// OS threads available to blocking driver I/O.
    pub native_thread_pool_size: usize,
    /// Run deleting-backup cleanup on the worker pool instead of inline.
    pub service_inithost_offload: bool,
    pub state_file: PathBuf,
    pub volumes_dir: PathBuf,
    pub posix: PosixConfig,
    pub logging: TracingConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PosixConfig {
    pub path: PathBuf,
    /// Bytes per stored object.
    pub chunk_size: usize,
    pub compression_level: i32,
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("bolt-backup")
}

fn default_host() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

impl Default for BackupConfig {
    fn default() -> Self {
        let data = data_dir();
        Self {
            host: default_host(),
            backup_driver: crate::drivers::posix::DRIVER_NAME.to_string(),
            process_number: 1,
            backup_use_same_host: false,
            backup_use_temp_snapshot: false,
            max_concurrent_operations: 0,
            native_thread_pool_size: 60,
            service_inithost_offload: true,
            state_file: data.join("state.json"),
            volumes_dir: data.join("volumes"),
            posix: PosixConfig::default(),
            logging: TracingConfig::default(),
        }
    }
}

impl Default for PosixConfig {
    fn default() -> Self {
        Self {
            path: data_dir().join("backups"),
            chunk_size: 32 * 1024 * 1024,
            compression_level: 3,
        }
    }
}

impl BackupConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;

        let config: BackupConfig = toml::from_str(&content)?;
        config.validate()?;

        info!("⚙️ Loaded backup configuration from {:?}", path);
        Ok(config)
    }

    /// Load `path` when given, otherwise fall back to defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        debug!("Validating backup configuration");

        if self.host.trim().is_empty() {
            return Err(invalid("host", "cannot be empty"));
        }
        if self.backup_driver.trim().is_empty() {
            return Err(invalid("backup_driver", "cannot be empty"));
        }
        if self.native_thread_pool_size == 0 {
            return Err(invalid("native_thread_pool_size", "must be at least 1"));
        }
        if self.process_number == 0 {
            return Err(invalid("process_number", "workers are numbered from 1"));
        }
        if self.posix.chunk_size == 0 {
            return Err(invalid("posix.chunk_size", "must be positive"));
        }
        if !(1..=22).contains(&self.posix.compression_level) {
            return Err(invalid("posix.compression_level", "must be between 1 and 22"));
        }

        Ok(())
    }

    /// Startup cleanup belongs to the first worker only.
    pub fn is_primary_worker(&self) -> bool {
        self.process_number == 1
    }
}

fn invalid(field: &str, reason: &str) -> crate::error::BackupError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
    .into()
}
