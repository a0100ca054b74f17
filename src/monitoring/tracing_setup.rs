use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::{Layered, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::error::{BackupError, Result};

type Filtered = Layered<EnvFilter, Registry>;
type BoxedLayer = Box<dyn Layer<Filtered> + Send + Sync>;

/// Logging configuration, the `[logging]` section of the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TracingConfig {
    /// Used when `RUST_LOG` is not set.
    pub log_level: String,
    pub enable_json_logs: bool,
    /// Daily rolling log file; console only when unset.
    pub log_file: Option<PathBuf>,
    pub structured_logging: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            enable_json_logs: false,
            log_file: None,
            structured_logging: false,
        }
    }
}

impl TracingConfig {
    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.log_level))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    }

    /// Install the global subscriber. Keep the returned guard alive for the
    /// lifetime of the process, dropping it flushes and stops file logging.
    pub fn init_tracing(&self) -> Result<Option<WorkerGuard>> {
        let console: BoxedLayer = if self.enable_json_logs {
            fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_writer(io::stderr)
                .boxed()
        } else if self.structured_logging {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_writer(io::stderr)
                .boxed()
        } else {
            fmt::layer()
                .with_target(false)
                .compact()
                .with_writer(io::stderr)
                .boxed()
        };

        let mut layers = vec![console];
        let guard = match self.log_file {
            Some(ref path) => {
                let (layer, guard) = self.file_layer(path)?;
                layers.push(layer);
                Some(guard)
            }
            None => None,
        };

        Registry::default()
            .with(self.env_filter())
            .with(layers)
            .try_init()
            .map_err(|e| BackupError::Other(anyhow::anyhow!("tracing already initialised: {}", e)))?;

        tracing::debug!("🔍 Tracing initialised at level {}", self.log_level);
        Ok(guard)
    }

    fn file_layer(&self, path: &Path) -> Result<(BoxedLayer, WorkerGuard)> {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        std::fs::create_dir_all(dir)?;

        let file_name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "bolt-backup.log".into());
        let appender = tracing_appender::rolling::daily(dir, file_name);
        let (writer, guard) = tracing_appender::non_blocking(appender);

        let layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .json()
            .boxed();
        Ok((layer, guard))
    }
}
