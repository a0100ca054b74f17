//! Attaching volumes and snapshots to this host for direct I/O.
//!
//! `attach` hands back an [`AttachedDevice`]. Callers release it explicitly
//! with [`AttachedDevice::release`]; if the owning future is dropped first
//! (cancellation or panic) the guard schedules a forced detach on the
//! runtime so the device is never left connected.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::connector::{ConnectionInfo, ConnectorProperties, DeviceConnector, LocalConnector};
use crate::context::RequestContext;
use crate::error::{BackupError, Result};
use crate::volume_api::VolumeApi;

/// Which kind of resource is being attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachTarget {
    Volume(String),
    Snapshot(String),
}

impl AttachTarget {
    pub fn id(&self) -> &str {
        match self {
            AttachTarget::Volume(id) | AttachTarget::Snapshot(id) => id,
        }
    }

    pub fn is_snapshot(&self) -> bool {
        matches!(self, AttachTarget::Snapshot(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttachInfo {
    pub target: AttachTarget,
    pub device_path: PathBuf,
    pub connection_info: ConnectionInfo,
    pub connector: ConnectorProperties,
    /// Owner to hand the device node back to on detach.
    pub original_owner: Option<u32>,
}

impl AttachInfo {
    pub fn is_directory(&self) -> bool {
        self.device_path.is_dir()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMode {
    Read,
    Write,
}

/// What a backup driver reads from or writes to.
#[derive(Debug)]
pub enum DeviceIo {
    /// Raw device or image file opened for the operation.
    File { file: File, path: PathBuf },
    /// Directory-backed device; drivers walk it instead of streaming bytes.
    Directory(PathBuf),
}

impl DeviceIo {
    pub fn open(path: &Path, mode: DeviceMode) -> Result<Self> {
        if path.is_dir() {
            return Ok(DeviceIo::Directory(path.to_path_buf()));
        }
        let file = match mode {
            DeviceMode::Read => File::open(path)?,
            DeviceMode::Write => OpenOptions::new().write(true).open(path)?,
        };
        Ok(DeviceIo::File {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        match self {
            DeviceIo::File { path, .. } => path,
            DeviceIo::Directory(path) => path,
        }
    }
}

pub struct DeviceAttachmentCoordinator {
    volume_api: Arc<dyn VolumeApi>,
    connectors: HashMap<String, Arc<dyn DeviceConnector>>,
    host: String,
}

impl DeviceAttachmentCoordinator {
    pub fn new(volume_api: Arc<dyn VolumeApi>, host: impl Into<String>) -> Self {
        let mut coordinator = Self {
            volume_api,
            connectors: HashMap::new(),
            host: host.into(),
        };
        coordinator.register_connector(Arc::new(LocalConnector));
        coordinator
    }

    pub fn register_connector(&mut self, connector: Arc<dyn DeviceConnector>) {
        self.connectors
            .insert(connector.protocol().to_string(), connector);
    }

    pub fn connector_properties(&self) -> ConnectorProperties {
        ConnectorProperties::for_host(&self.host)
    }

    fn connector_for(&self, info: &ConnectionInfo) -> Result<Arc<dyn DeviceConnector>> {
        self.connectors
            .get(&info.driver_volume_type)
            .cloned()
            .ok_or_else(|| {
                BackupError::attach(format!(
                    "no connector for protocol '{}'",
                    info.driver_volume_type
                ))
            })
    }

    /// Export `target` to this host and connect it. A connection that was
    /// initialized but could not be connected is terminated before the
    /// error is returned.
    pub async fn attach(
        self: &Arc<Self>,
        ctx: &RequestContext,
        target: AttachTarget,
        secure_enabled: bool,
    ) -> Result<AttachedDevice> {
        let connector = self.connector_properties();
        info!("🔗 Attaching {:?} to {}", target, self.host);

        let connection_info = match &target {
            AttachTarget::Volume(id) => {
                self.volume_api
                    .initialize_connection(ctx, id, &connector)
                    .await?
            }
            AttachTarget::Snapshot(id) => {
                self.volume_api
                    .initialize_connection_snapshot(ctx, id, &connector)
                    .await?
            }
        };

        let connected = async {
            let device = self.connector_for(&connection_info)?;
            device.connect_volume(&connection_info).await
        };

        let device_path = match connected.await {
            Ok(path) => path,
            Err(e) => {
                warn!("Connecting {:?} failed, terminating export: {}", target, e);
                if let Err(term) = self.terminate(ctx, &target, &connector, true).await {
                    warn!("Terminating export of {:?} failed: {}", target, term);
                }
                return Err(e);
            }
        };

        let original_owner = if secure_enabled || device_path.is_dir() {
            None
        } else {
            match take_ownership(&device_path) {
                Ok(owner) => owner,
                Err(e) => {
                    let info = AttachInfo {
                        target,
                        device_path,
                        connection_info,
                        connector,
                        original_owner: None,
                    };
                    if let Err(detach) = self.detach(ctx, &info, true, true).await {
                        warn!("Detach after failed chown also failed: {}", detach);
                    }
                    return Err(e);
                }
            }
        };

        debug!("Attached {:?} at {}", target, device_path.display());
        Ok(AttachedDevice {
            info: Some(AttachInfo {
                target,
                device_path,
                connection_info,
                connector,
                original_owner,
            }),
            coordinator: Arc::clone(self),
            ctx: ctx.clone(),
        })
    }

    /// Disconnect and unexport. With `ignore_errors` a failing disconnect is
    /// logged and the export is still terminated.
    pub async fn detach(
        &self,
        ctx: &RequestContext,
        info: &AttachInfo,
        force: bool,
        ignore_errors: bool,
    ) -> Result<()> {
        info!("🔗 Detaching {:?} from {}", info.target, self.host);

        if let Some(owner) = info.original_owner {
            if let Err(e) = restore_ownership(&info.device_path, owner) {
                warn!(
                    "Could not hand {} back to uid {}: {}",
                    info.device_path.display(),
                    owner,
                    e
                );
            }
        }

        let disconnected = async {
            let device = self.connector_for(&info.connection_info)?;
            device
                .disconnect_volume(&info.connection_info, &info.device_path, force, ignore_errors)
                .await
        };
        if let Err(e) = disconnected.await {
            if !ignore_errors {
                return Err(e);
            }
            warn!("Ignoring disconnect failure for {:?}: {}", info.target, e);
        }

        if let Err(e) = self.terminate(ctx, &info.target, &info.connector, force).await {
            if !ignore_errors {
                return Err(e);
            }
            warn!("Ignoring terminate failure for {:?}: {}", info.target, e);
        }

        if let AttachTarget::Snapshot(ref id) = info.target {
            if let Err(e) = self.volume_api.remove_export_snapshot(ctx, id).await {
                if !ignore_errors {
                    return Err(e);
                }
                warn!("Ignoring export removal failure for snapshot {}: {}", id, e);
            }
        }

        Ok(())
    }

    async fn terminate(
        &self,
        ctx: &RequestContext,
        target: &AttachTarget,
        connector: &ConnectorProperties,
        force: bool,
    ) -> Result<()> {
        match target {
            AttachTarget::Volume(id) => {
                self.volume_api
                    .terminate_connection(ctx, id, connector, force)
                    .await
            }
            AttachTarget::Snapshot(id) => {
                self.volume_api
                    .terminate_connection_snapshot(ctx, id, connector, force)
                    .await
            }
        }
    }
}

/// An attached device that must be released.
pub struct AttachedDevice {
    info: Option<AttachInfo>,
    coordinator: Arc<DeviceAttachmentCoordinator>,
    ctx: RequestContext,
}

impl AttachedDevice {
    pub fn info(&self) -> &AttachInfo {
        // only `release` and `drop` take the info out, both consume the guard
        self.info
            .as_ref()
            .unwrap_or_else(|| unreachable!("attach info taken before release"))
    }

    pub fn device_path(&self) -> &Path {
        &self.info().device_path
    }

    pub fn open(&self, mode: DeviceMode) -> Result<DeviceIo> {
        DeviceIo::open(self.device_path(), mode)
    }

    pub async fn release(mut self, force: bool, ignore_errors: bool) -> Result<()> {
        match self.info.take() {
            Some(info) => {
                self.coordinator
                    .detach(&self.ctx, &info, force, ignore_errors)
                    .await
            }
            None => Ok(()),
        }
    }
}

impl Drop for AttachedDevice {
    fn drop(&mut self) {
        let Some(info) = self.info.take() else {
            return;
        };

        warn!(
            "Attached device {} dropped without release, forcing detach",
            info.device_path.display()
        );
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let coordinator = Arc::clone(&self.coordinator);
                let ctx = self.ctx.clone();
                handle.spawn(async move {
                    if let Err(e) = coordinator.detach(&ctx, &info, true, true).await {
                        error!("Forced detach of {:?} failed: {}", info.target, e);
                    }
                });
            }
            Err(_) => error!(
                "No runtime to detach {:?}; device left connected",
                info.target
            ),
        }
    }
}

/// Chown the device node to this process when it is owned by someone else.
/// Returns the previous owner to restore on detach.
#[cfg(unix)]
fn take_ownership(path: &Path) -> Result<Option<u32>> {
    use nix::unistd::{Uid, chown, getuid};
    use std::os::unix::fs::MetadataExt;

    let owner = std::fs::metadata(path)?.uid();
    let me = getuid();
    if owner == me.as_raw() {
        return Ok(None);
    }

    chown(path, Some(me), None).map_err(|e| {
        BackupError::attach(format!("chown of {} failed: {}", path.display(), e))
    })?;
    debug!(
        "Took ownership of {} from uid {}",
        path.display(),
        Uid::from_raw(owner)
    );
    Ok(Some(owner))
}

#[cfg(not(unix))]
fn take_ownership(_path: &Path) -> Result<Option<u32>> {
    Ok(None)
}

#[cfg(unix)]
fn restore_ownership(path: &Path, owner: u32) -> Result<()> {
    use nix::unistd::{Uid, chown};

    chown(path, Some(Uid::from_raw(owner)), None).map_err(|e| {
        BackupError::attach(format!("chown of {} failed: {}", path.display(), e))
    })
}

#[cfg(not(unix))]
fn restore_ownership(_path: &Path, _owner: u32) -> Result<()> {
    Ok(())
}
