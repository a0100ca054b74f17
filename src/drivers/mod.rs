//! Backup drivers: the pluggable byte movers behind each `service` name.
//!
//! Drivers are plain blocking code. The orchestrator runs every driver call
//! on the limiter's blocking pool, so implementations can do synchronous
//! file and network I/O freely.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

use crate::attach::DeviceIo;
use crate::config::BackupConfig;
use crate::error::{BackupError, ConfigError, Result};
use crate::models::Backup;

pub mod posix;

pub use posix::PosixBackupDriver;

/// What a driver reports after storing a backup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupOutcome {
    /// Size in GiB.
    pub size: u64,
    pub object_count: u64,
    /// Backup this one is incremental to, if any.
    pub parent_id: Option<String>,
    pub container: Option<String>,
}

/// Shared with a running restore so it can be cancelled from outside.
#[derive(Debug, Clone, Default)]
pub struct RestoreContext {
    cancelled: Arc<AtomicBool>,
}

impl RestoreContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Fails with `RestoreCancelled` once `cancel` was called.
    pub fn check(&self, backup_id: &str) -> Result<()> {
        if self.is_cancelled() {
            return Err(BackupError::RestoreCancelled {
                backup_id: backup_id.to_string(),
            });
        }
        Ok(())
    }
}

/// Metadata a driver wants recorded on the restored volume, e.g. the
/// encryption key id of a backup taken before key ids were tracked.
pub type RestoredMetadata = BTreeMap<String, String>;

pub trait BackupDriver: Send + Sync {
    /// The `service` name backups created by this driver carry.
    fn name(&self) -> &str;

    fn check_for_setup_error(&self) -> Result<()> {
        Ok(())
    }

    fn backup(&self, backup: &Backup, device: &mut DeviceIo) -> Result<BackupOutcome>;

    /// Restore `backup` onto `volume_id`. Must return
    /// [`BackupError::RestoreCancelled`] when `ctx` is cancelled midway.
    fn restore(
        &self,
        backup: &Backup,
        volume_id: &str,
        device: &mut DeviceIo,
        ctx: &RestoreContext,
    ) -> Result<RestoredMetadata>;

    fn delete(&self, backup: &Backup) -> Result<()>;

    /// Driver-specific part of an exported backup record.
    fn export_record(&self, backup: &Backup) -> Result<serde_json::Value> {
        let _ = backup;
        Ok(serde_json::Value::Null)
    }

    /// Make an imported record usable by this driver.
    fn import_record(&self, backup: &Backup, driver_info: &serde_json::Value) -> Result<()> {
        let _ = (backup, driver_info);
        Ok(())
    }

    fn supports_force_delete(&self) -> bool {
        false
    }
}

pub type DriverFactory = fn(&BackupConfig) -> Result<Arc<dyn BackupDriver>>;

struct RegisteredDriver {
    driver: Arc<dyn BackupDriver>,
    force_delete: bool,
}

/// Drivers available on this host, keyed by service name.
///
/// Factories are registered up front; [`BackupDriverRegistry::build`]
/// constructs and checks every driver once at startup, so a broken driver
/// fails the process instead of the first request.
#[derive(Default)]
pub struct BackupDriverRegistry {
    factories: HashMap<String, DriverFactory>,
    drivers: HashMap<String, RegisteredDriver>,
}

impl BackupDriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register_factory(posix::DRIVER_NAME, posix::create);
        registry
    }

    pub fn register_factory(&mut self, name: &str, factory: DriverFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    /// Register an already constructed driver under its own name.
    pub fn register(&mut self, driver: Arc<dyn BackupDriver>) {
        let force_delete = driver.supports_force_delete();
        debug!(
            "Registered backup driver {} (force delete: {})",
            driver.name(),
            force_delete
        );
        self.drivers.insert(
            driver.name().to_string(),
            RegisteredDriver {
                driver,
                force_delete,
            },
        );
    }

    /// Construct every registered factory and validate the configured
    /// active driver.
    pub fn build(mut self, config: &BackupConfig) -> Result<Self> {
        let mut names: Vec<_> = self.factories.keys().cloned().collect();
        names.sort();
        for name in names {
            if self.drivers.contains_key(&name) {
                continue;
            }
            let factory = self.factories[&name];
            let driver = factory(config)?;
            driver.check_for_setup_error()?;
            self.register(driver);
        }

        if !self.drivers.contains_key(&config.backup_driver) {
            return Err(ConfigError::UnknownDriver {
                name: config.backup_driver.clone(),
            }
            .into());
        }

        info!(
            "🔌 Backup drivers ready: {}",
            self.names().join(", ")
        );
        Ok(self)
    }

    pub fn get(&self, service: &str) -> Result<Arc<dyn BackupDriver>> {
        self.drivers
            .get(service)
            .map(|d| Arc::clone(&d.driver))
            .ok_or_else(|| BackupError::ServiceNotRegistered {
                service: service.to_string(),
            })
    }

    pub fn contains(&self, service: &str) -> bool {
        self.drivers.contains_key(service)
    }

    /// Cached at registration; drivers are not asked again.
    pub fn supports_force_delete(&self, service: &str) -> bool {
        self.drivers.get(service).is_some_and(|d| d.force_delete)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.drivers.keys().cloned().collect();
        names.sort();
        names
    }
}
