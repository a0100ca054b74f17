//! Host-to-host calls the orchestrator makes itself.
//!
//! Only import relaying crosses hosts. `InProcessRouter` dispatches to
//! managers living in the same process, which is how a single binary serving
//! several backup hosts (and the integration tests) wires them together.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use tracing::debug;

use super::{BackupManager, ImportOutcome};
use crate::context::RequestContext;
use crate::error::{BackupError, Result};

#[async_trait]
pub trait BackupRpc: Send + Sync {
    /// Ask `host` to import the record, with `candidate_hosts` as its own
    /// relay list.
    async fn import_record(
        &self,
        ctx: &RequestContext,
        host: &str,
        backup_id: &str,
        service: &str,
        backup_url: &str,
        candidate_hosts: Vec<String>,
    ) -> Result<ImportOutcome>;
}

/// Managers are held weakly: each manager also holds the router.
#[derive(Default)]
pub struct InProcessRouter {
    hosts: RwLock<HashMap<String, Weak<BackupManager>>>,
}

impl InProcessRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, manager: &Arc<BackupManager>) {
        let mut hosts = self.hosts.write().unwrap_or_else(|p| p.into_inner());
        hosts.insert(manager.host().to_string(), Arc::downgrade(manager));
    }

    pub fn hosts(&self) -> Vec<String> {
        let hosts = self.hosts.read().unwrap_or_else(|p| p.into_inner());
        let mut names: Vec<String> = hosts.keys().cloned().collect();
        names.sort();
        names
    }

    fn lookup(&self, host: &str) -> Result<Arc<BackupManager>> {
        let hosts = self.hosts.read().unwrap_or_else(|p| p.into_inner());
        hosts
            .get(host)
            .and_then(Weak::upgrade)
            .ok_or_else(|| BackupError::NotSupported {
                reason: format!("no backup host named {} is reachable", host),
            })
    }
}

#[async_trait]
impl BackupRpc for InProcessRouter {
    async fn import_record(
        &self,
        ctx: &RequestContext,
        host: &str,
        backup_id: &str,
        service: &str,
        backup_url: &str,
        candidate_hosts: Vec<String>,
    ) -> Result<ImportOutcome> {
        let manager = self.lookup(host)?;
        debug!("Dispatching import of {} to {}", backup_id, host);
        manager
            .import_record(ctx, backup_id, service, backup_url, candidate_hosts)
            .await
    }
}
