//! Facade over the volume service: connections, exports and the temporary
//! resources the backup subsystem asks it for.

use async_trait::async_trait;

use crate::connector::{ConnectionInfo, ConnectorProperties};
use crate::context::RequestContext;
use crate::error::Result;
use crate::models::{Snapshot, Volume};

pub mod local;

pub use local::LocalVolumeApi;

/// What the volume backend can offer when backing up a volume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackupDeviceSupport {
    /// Backend can take a cheap temporary snapshot of an in-use volume.
    pub temp_snapshot: bool,
}

#[async_trait]
pub trait VolumeApi: Send + Sync {
    async fn get_backup_device(
        &self,
        ctx: &RequestContext,
        volume_id: &str,
    ) -> Result<BackupDeviceSupport>;

    /// When false the device node must be handed to this process by
    /// changing its owner for the duration of the I/O.
    async fn secure_file_operations_enabled(
        &self,
        ctx: &RequestContext,
        volume_id: &str,
    ) -> Result<bool>;

    async fn initialize_connection(
        &self,
        ctx: &RequestContext,
        volume_id: &str,
        connector: &ConnectorProperties,
    ) -> Result<ConnectionInfo>;

    async fn terminate_connection(
        &self,
        ctx: &RequestContext,
        volume_id: &str,
        connector: &ConnectorProperties,
        force: bool,
    ) -> Result<()>;

    async fn initialize_connection_snapshot(
        &self,
        ctx: &RequestContext,
        snapshot_id: &str,
        connector: &ConnectorProperties,
    ) -> Result<ConnectionInfo>;

    async fn terminate_connection_snapshot(
        &self,
        ctx: &RequestContext,
        snapshot_id: &str,
        connector: &ConnectorProperties,
        force: bool,
    ) -> Result<()>;

    async fn remove_export_snapshot(&self, ctx: &RequestContext, snapshot_id: &str) -> Result<()>;

    async fn create_temp_snapshot(&self, ctx: &RequestContext, volume_id: &str) -> Result<Snapshot>;

    async fn create_temp_cloned_volume(
        &self,
        ctx: &RequestContext,
        volume_id: &str,
        same_host: bool,
    ) -> Result<Volume>;

    /// Returns a `NotFound` error when the volume is already gone.
    async fn delete_volume(&self, ctx: &RequestContext, volume_id: &str) -> Result<()>;

    /// Returns a `NotFound` error when the snapshot is already gone.
    async fn delete_snapshot(&self, ctx: &RequestContext, snapshot_id: &str) -> Result<()>;
}
