use std::fmt;
use thiserror::Error;

/// Kinds of records and backend objects an error can point at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Backup,
    Volume,
    Snapshot,
    Attachment,
    EncryptionKey,
    Reservation,
    BackupObject,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Backup => "backup",
            ResourceKind::Volume => "volume",
            ResourceKind::Snapshot => "snapshot",
            ResourceKind::Attachment => "attachment",
            ResourceKind::EncryptionKey => "encryption key",
            ResourceKind::Reservation => "quota reservation",
            ResourceKind::BackupObject => "backup object",
        };
        f.write_str(name)
    }
}

/// Backup orchestration error types
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Invalid backup: {reason}")]
    InvalidBackup { reason: String },

    #[error("Invalid volume: {reason}")]
    InvalidVolume { reason: String },

    #[error("Invalid snapshot: {reason}")]
    InvalidSnapshot { reason: String },

    /// Control-flow signal raised by a driver when a restore was cancelled.
    #[error("Restore of backup {backup_id} was cancelled")]
    RestoreCancelled { backup_id: String },

    #[error("{kind} {id} could not be found")]
    NotFound { kind: ResourceKind, id: String },

    #[error("Backup driver '{service}' failed: {message}")]
    Driver { service: String, message: String },

    #[error("Device attach error: {reason}")]
    DeviceAttach { reason: String },

    #[error("Quota error: {reason}")]
    Quota { reason: String },

    #[error("Backup service '{service}' is not registered on this host")]
    ServiceNotRegistered { service: String },

    #[error("Operation not supported: {reason}")]
    NotSupported { reason: String },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Generic error: {0}")]
    Other(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found at path: {path}")]
    FileNotFound { path: String },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Unknown backup driver: {name}")]
    UnknownDriver { name: String },
}

impl BackupError {
    pub fn invalid_backup(reason: impl Into<String>) -> Self {
        BackupError::InvalidBackup {
            reason: reason.into(),
        }
    }

    pub fn invalid_volume(reason: impl Into<String>) -> Self {
        BackupError::InvalidVolume {
            reason: reason.into(),
        }
    }

    pub fn invalid_snapshot(reason: impl Into<String>) -> Self {
        BackupError::InvalidSnapshot {
            reason: reason.into(),
        }
    }

    pub fn not_found(kind: ResourceKind, id: impl Into<String>) -> Self {
        BackupError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn driver(service: impl Into<String>, message: impl Into<String>) -> Self {
        BackupError::Driver {
            service: service.into(),
            message: message.into(),
        }
    }

    pub fn attach(reason: impl Into<String>) -> Self {
        BackupError::DeviceAttach {
            reason: reason.into(),
        }
    }

    /// "Already gone" outcome; cleanup paths treat it as success.
    pub fn is_not_found(&self) -> bool {
        match self {
            BackupError::NotFound { .. } => true,
            BackupError::Io(err) => err.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, BackupError::RestoreCancelled { .. })
    }

    /// Precondition violations are never retried.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            BackupError::InvalidBackup { .. }
                | BackupError::InvalidVolume { .. }
                | BackupError::InvalidSnapshot { .. }
        )
    }
}

/// Convenience type alias for backup results
pub type Result<T, E = BackupError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_recognised_without_message_matching() {
        let err = BackupError::not_found(ResourceKind::Volume, "vol-1");
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "volume vol-1 could not be found");

        let io = BackupError::from(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(io.is_not_found());

        let other = BackupError::driver("posix", "volume vol-1 could not be found");
        assert!(!other.is_not_found());
    }

    #[test]
    fn precondition_errors_are_classified() {
        assert!(BackupError::invalid_backup("x").is_precondition());
        assert!(BackupError::invalid_snapshot("x").is_precondition());
        assert!(!BackupError::attach("x").is_precondition());
        assert!(
            BackupError::RestoreCancelled {
                backup_id: "b".into()
            }
            .is_cancelled()
        );
    }
}
