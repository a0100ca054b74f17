//! Host-side half of a volume connection: turns the connection info the
//! volume service hands out into a local device path.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{BackupError, Result};

pub const LOCAL_PROTOCOL: &str = "local";

/// Description of this host sent to the volume service when connecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorProperties {
    pub host: String,
    pub initiator: Option<String>,
    pub multipath: bool,
    pub platform: String,
    pub os_type: String,
}

impl ConnectorProperties {
    pub fn for_host(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            initiator: None,
            multipath: false,
            platform: std::env::consts::ARCH.to_string(),
            os_type: std::env::consts::OS.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub driver_volume_type: String,
    pub data: BTreeMap<String, serde_json::Value>,
}

impl ConnectionInfo {
    pub fn local(device_path: &Path) -> Self {
        let mut data = BTreeMap::new();
        data.insert(
            "device_path".to_string(),
            serde_json::Value::String(device_path.to_string_lossy().into_owned()),
        );
        Self {
            driver_volume_type: LOCAL_PROTOCOL.to_string(),
            data,
        }
    }

    pub fn device_path(&self) -> Option<PathBuf> {
        self.data
            .get("device_path")
            .and_then(|v| v.as_str())
            .map(PathBuf::from)
    }
}

#[async_trait]
pub trait DeviceConnector: Send + Sync {
    /// `driver_volume_type` this connector understands.
    fn protocol(&self) -> &str;

    async fn connect_volume(&self, info: &ConnectionInfo) -> Result<PathBuf>;

    async fn disconnect_volume(
        &self,
        info: &ConnectionInfo,
        device_path: &Path,
        force: bool,
        ignore_errors: bool,
    ) -> Result<()>;
}

/// Connector for devices that are already visible on this host as a file,
/// block node or directory.
#[derive(Debug, Clone, Default)]
pub struct LocalConnector;

#[async_trait]
impl DeviceConnector for LocalConnector {
    fn protocol(&self) -> &str {
        LOCAL_PROTOCOL
    }

    async fn connect_volume(&self, info: &ConnectionInfo) -> Result<PathBuf> {
        let path = info
            .device_path()
            .ok_or_else(|| BackupError::attach("connection info carries no device_path"))?;

        if !tokio::fs::try_exists(&path).await? {
            return Err(BackupError::attach(format!(
                "device path {} does not exist",
                path.display()
            )));
        }

        debug!("Connected local device {}", path.display());
        Ok(path)
    }

    async fn disconnect_volume(
        &self,
        _info: &ConnectionInfo,
        device_path: &Path,
        force: bool,
        ignore_errors: bool,
    ) -> Result<()> {
        if !tokio::fs::try_exists(device_path).await.unwrap_or(false) {
            let err = BackupError::attach(format!(
                "device path {} vanished before disconnect",
                device_path.display()
            ));
            if ignore_errors || force {
                warn!("{}", err);
                return Ok(());
            }
            return Err(err);
        }

        debug!("Disconnected local device {}", device_path.display());
        Ok(())
    }
}
