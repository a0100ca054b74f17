//! Backup driver storing backups as compressed chunk files on a POSIX
//! filesystem (local disk or an NFS mount shared between hosts).
//!
//! Layout: `<path>/<container>/<backup_id>/` holds `chunk-NNNNNNNN.zst`
//! objects plus `metadata.json`, written last. A backup directory without
//! metadata is an unfinished backup and is ignored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::{BackupDriver, BackupOutcome, RestoreContext, RestoredMetadata};
use crate::attach::DeviceIo;
use crate::config::{BackupConfig, PosixConfig};
use crate::error::{BackupError, Result};
use crate::models::{Backup, ENCRYPTION_KEY_ID_KEY};

pub const DRIVER_NAME: &str = "posix";

const DEFAULT_CONTAINER: &str = "backups";
const METADATA_FILE: &str = "metadata.json";
const METADATA_VERSION: u32 = 1;
const GIB: u64 = 1024 * 1024 * 1024;

pub fn create(config: &BackupConfig) -> Result<Arc<dyn BackupDriver>> {
    Ok(Arc::new(PosixBackupDriver::new(config.posix.clone())))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum DeviceKind {
    Block,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ChunkRecord {
    object: String,
    /// Relative file path for directory devices.
    file: Option<String>,
    offset: u64,
    length: u64,
    sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct BackupMetadata {
    version: u32,
    backup_id: String,
    volume_id: String,
    container: String,
    parent_id: Option<String>,
    encryption_key_id: Option<String>,
    kind: DeviceKind,
    size_bytes: u64,
    created_at: DateTime<Utc>,
    #[serde(default)]
    directories: Vec<String>,
    #[serde(default)]
    files: Vec<String>,
    chunks: Vec<ChunkRecord>,
}

#[derive(Debug, Clone)]
pub struct PosixBackupDriver {
    config: PosixConfig,
}

impl PosixBackupDriver {
    pub fn new(config: PosixConfig) -> Self {
        Self { config }
    }

    fn container(backup: &Backup) -> &str {
        backup.container.as_deref().unwrap_or(DEFAULT_CONTAINER)
    }

    fn backup_dir(&self, container: &str, backup_id: &str) -> PathBuf {
        self.config.path.join(container).join(backup_id)
    }

    fn read_metadata(dir: &Path) -> Result<BackupMetadata> {
        let content = fs::read_to_string(dir.join(METADATA_FILE))?;
        Ok(serde_json::from_str(&content)?)
    }

    fn write_metadata(dir: &Path, metadata: &BackupMetadata) -> Result<()> {
        let tmp = dir.join(format!("{}.tmp", METADATA_FILE));
        fs::write(&tmp, serde_json::to_vec_pretty(metadata)?)?;
        fs::rename(&tmp, dir.join(METADATA_FILE))?;
        Ok(())
    }

    /// Newest finished backup of the same volume in the same container.
    fn find_parent(&self, container: &str, backup: &Backup) -> Option<String> {
        let root = self.config.path.join(container);
        let entries = fs::read_dir(&root).ok()?;

        entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy() != backup.id)
            .filter_map(|entry| Self::read_metadata(&entry.path()).ok())
            .filter(|m| m.volume_id == backup.volume_id)
            .max_by_key(|m| m.created_at)
            .map(|m| m.backup_id)
    }

    fn write_chunk(&self, dir: &Path, index: usize, data: &[u8]) -> Result<(String, String)> {
        let object = format!("chunk-{:08}.zst", index);
        let compressed = zstd::encode_all(data, self.config.compression_level)?;
        fs::write(dir.join(&object), compressed)?;
        Ok((object, hex::encode(Sha256::digest(data))))
    }

    fn read_chunk(dir: &Path, chunk: &ChunkRecord) -> Result<Vec<u8>> {
        let compressed = fs::read(dir.join(&chunk.object))?;
        let data = zstd::decode_all(compressed.as_slice())?;
        if hex::encode(Sha256::digest(&data)) != chunk.sha256 {
            return Err(BackupError::driver(
                DRIVER_NAME,
                format!("checksum mismatch in object {}", chunk.object),
            ));
        }
        Ok(data)
    }

    /// Chunk one stream into `dir`, appending records for it.
    fn store_stream(
        &self,
        dir: &Path,
        reader: &mut impl Read,
        file: Option<String>,
        chunks: &mut Vec<ChunkRecord>,
    ) -> Result<u64> {
        let mut buf = vec![0u8; self.config.chunk_size];
        let mut offset = 0u64;

        loop {
            let read = read_full(reader, &mut buf)?;
            if read == 0 {
                break;
            }
            let (object, sha256) = self.write_chunk(dir, chunks.len(), &buf[..read])?;
            chunks.push(ChunkRecord {
                object,
                file: file.clone(),
                offset,
                length: read as u64,
                sha256,
            });
            offset += read as u64;
        }
        Ok(offset)
    }

    fn store_directory(
        &self,
        dir: &Path,
        source: &Path,
        metadata: &mut BackupMetadata,
    ) -> Result<u64> {
        let mut total = 0;
        for entry in WalkDir::new(source).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(io::Error::other)?;
            let relative = entry
                .path()
                .strip_prefix(source)
                .map_err(io::Error::other)?
                .to_string_lossy()
                .into_owned();

            if entry.file_type().is_dir() {
                metadata.directories.push(relative);
            } else if entry.file_type().is_file() {
                let mut file = File::open(entry.path())?;
                total += self.store_stream(dir, &mut file, Some(relative.clone()), &mut metadata.chunks)?;
                metadata.files.push(relative);
            } else {
                debug!("Skipping special file {}", entry.path().display());
            }
        }
        Ok(total)
    }

    fn restore_block(
        dir: &Path,
        metadata: &BackupMetadata,
        file: &mut File,
        ctx: &RestoreContext,
    ) -> Result<()> {
        for chunk in &metadata.chunks {
            ctx.check(&metadata.backup_id)?;
            let data = Self::read_chunk(dir, chunk)?;
            file.seek(SeekFrom::Start(chunk.offset))?;
            file.write_all(&data)?;
        }
        file.flush()?;
        file.sync_all()?;
        Ok(())
    }

    fn restore_directory(
        dir: &Path,
        metadata: &BackupMetadata,
        target: &Path,
        ctx: &RestoreContext,
    ) -> Result<()> {
        for directory in &metadata.directories {
            fs::create_dir_all(target.join(directory))?;
        }
        for file in &metadata.files {
            let path = target.join(file);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            File::create(path)?;
        }

        for chunk in &metadata.chunks {
            ctx.check(&metadata.backup_id)?;
            let Some(ref relative) = chunk.file else {
                return Err(BackupError::driver(
                    DRIVER_NAME,
                    format!("object {} has no file in a directory backup", chunk.object),
                ));
            };
            let data = Self::read_chunk(dir, chunk)?;
            let mut out = OpenOptions::new().write(true).open(target.join(relative))?;
            out.seek(SeekFrom::Start(chunk.offset))?;
            out.write_all(&data)?;
        }
        Ok(())
    }
}

/// Read until `buf` is full or the stream ends.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

impl BackupDriver for PosixBackupDriver {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    fn check_for_setup_error(&self) -> Result<()> {
        if self.config.chunk_size == 0 {
            return Err(BackupError::driver(DRIVER_NAME, "chunk_size must be positive"));
        }
        fs::create_dir_all(&self.config.path).map_err(|e| {
            BackupError::driver(
                DRIVER_NAME,
                format!("backup path {} unusable: {}", self.config.path.display(), e),
            )
        })?;
        Ok(())
    }

    fn backup(&self, backup: &Backup, device: &mut DeviceIo) -> Result<BackupOutcome> {
        let container = Self::container(backup).to_string();
        let parent_id = self.find_parent(&container, backup);
        let dir = self.backup_dir(&container, &backup.id);
        if dir.exists() {
            warn!("Removing leftovers of an earlier attempt at {}", dir.display());
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;

        let mut metadata = BackupMetadata {
            version: METADATA_VERSION,
            backup_id: backup.id.clone(),
            volume_id: backup.volume_id.clone(),
            container: container.clone(),
            parent_id: parent_id.clone(),
            encryption_key_id: backup.encryption_key_id.clone(),
            kind: DeviceKind::Block,
            size_bytes: 0,
            created_at: Utc::now(),
            directories: Vec::new(),
            files: Vec::new(),
            chunks: Vec::new(),
        };

        let size_bytes = match device {
            DeviceIo::File { file, .. } => {
                file.seek(SeekFrom::Start(0))?;
                self.store_stream(&dir, file, None, &mut metadata.chunks)?
            }
            DeviceIo::Directory(source) => {
                metadata.kind = DeviceKind::Directory;
                let source = source.clone();
                self.store_directory(&dir, &source, &mut metadata)?
            }
        };
        metadata.size_bytes = size_bytes;
        Self::write_metadata(&dir, &metadata)?;

        info!(
            "💾 Stored backup {} in {} ({} bytes, {} objects)",
            backup.id,
            dir.display(),
            metadata.size_bytes,
            metadata.chunks.len()
        );

        Ok(BackupOutcome {
            size: metadata.size_bytes.div_ceil(GIB),
            object_count: metadata.chunks.len() as u64,
            parent_id,
            container: Some(container),
        })
    }

    fn restore(
        &self,
        backup: &Backup,
        volume_id: &str,
        device: &mut DeviceIo,
        ctx: &RestoreContext,
    ) -> Result<RestoredMetadata> {
        let dir = self.backup_dir(Self::container(backup), &backup.id);
        let metadata = Self::read_metadata(&dir)?;

        match (metadata.kind, device) {
            (DeviceKind::Block, DeviceIo::File { file, .. }) => {
                Self::restore_block(&dir, &metadata, file, ctx)?;
            }
            (DeviceKind::Directory, DeviceIo::Directory(target)) => {
                let target = target.clone();
                Self::restore_directory(&dir, &metadata, &target, ctx)?;
            }
            (kind, device) => {
                return Err(BackupError::invalid_volume(format!(
                    "backup {} holds a {:?} device, volume {} is attached as {}",
                    backup.id,
                    kind,
                    volume_id,
                    device.path().display()
                )));
            }
        }

        info!("♻️ Restored backup {} onto volume {}", backup.id, volume_id);

        let mut restored = RestoredMetadata::new();
        if let Some(key) = metadata.encryption_key_id {
            restored.insert(ENCRYPTION_KEY_ID_KEY.to_string(), key);
        }
        Ok(restored)
    }

    fn delete(&self, backup: &Backup) -> Result<()> {
        let dir = self.backup_dir(Self::container(backup), &backup.id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                info!("🗑️ Deleted backup objects in {}", dir.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("Backup {} has no objects at {}", backup.id, dir.display());
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn export_record(&self, backup: &Backup) -> Result<serde_json::Value> {
        let dir = self.backup_dir(Self::container(backup), &backup.id);
        Ok(serde_json::to_value(Self::read_metadata(&dir)?)?)
    }

    fn import_record(&self, backup: &Backup, driver_info: &serde_json::Value) -> Result<()> {
        let metadata: BackupMetadata = serde_json::from_value(driver_info.clone())?;
        if metadata.backup_id != backup.id {
            return Err(BackupError::invalid_backup(format!(
                "driver info describes backup {}, not {}",
                metadata.backup_id, backup.id
            )));
        }

        let dir = self.backup_dir(&metadata.container, &backup.id);
        for chunk in &metadata.chunks {
            if !dir.join(&chunk.object).exists() {
                return Err(BackupError::driver(
                    DRIVER_NAME,
                    format!("object {} missing from {}", chunk.object, dir.display()),
                ));
            }
        }
        if !dir.join(METADATA_FILE).exists() {
            Self::write_metadata(&dir, &metadata)?;
        }
        Ok(())
    }

    fn supports_force_delete(&self) -> bool {
        true
    }
}
