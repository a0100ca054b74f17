//! Quota reservation collaborator.
//!
//! The orchestrator only reserves, commits and rolls back; the arithmetic
//! behind a reservation belongs to the implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::context::RequestContext;
use crate::error::{BackupError, ResourceKind, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaDeltas {
    pub backups: i64,
    pub backup_gigabytes: i64,
}

impl QuotaDeltas {
    pub fn for_backup(size_gb: u64) -> Self {
        Self {
            backups: 1,
            backup_gigabytes: size_gb as i64,
        }
    }

    pub fn negate(self) -> Self {
        Self {
            backups: -self.backups,
            backup_gigabytes: -self.backup_gigabytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub id: String,
    pub project_id: String,
    pub deltas: QuotaDeltas,
}

#[async_trait]
pub trait QuotaService: Send + Sync {
    async fn reserve(&self, ctx: &RequestContext, deltas: QuotaDeltas) -> Result<Reservation>;
    async fn commit(&self, ctx: &RequestContext, reservation: &Reservation) -> Result<()>;
    async fn rollback(&self, ctx: &RequestContext, reservation: &Reservation) -> Result<()>;
}

/// Accepts every reservation.
#[derive(Debug, Clone, Default)]
pub struct UnlimitedQuota;

#[async_trait]
impl QuotaService for UnlimitedQuota {
    async fn reserve(&self, ctx: &RequestContext, deltas: QuotaDeltas) -> Result<Reservation> {
        Ok(Reservation {
            id: Uuid::new_v4().to_string(),
            project_id: ctx.project_id.clone(),
            deltas,
        })
    }

    async fn commit(&self, _ctx: &RequestContext, _reservation: &Reservation) -> Result<()> {
        Ok(())
    }

    async fn rollback(&self, _ctx: &RequestContext, _reservation: &Reservation) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Ledger {
    usage: HashMap<String, QuotaDeltas>,
    pending: HashMap<String, Reservation>,
}

/// Per-project limits tracked in memory. Pending reservations count
/// against the limit until committed or rolled back.
#[derive(Debug)]
pub struct InMemoryQuota {
    limits: QuotaDeltas,
    ledger: Mutex<Ledger>,
}

impl InMemoryQuota {
    pub fn new(limits: QuotaDeltas) -> Self {
        Self {
            limits,
            ledger: Mutex::new(Ledger::default()),
        }
    }

    pub fn usage(&self, project_id: &str) -> QuotaDeltas {
        self.lock().usage.get(project_id).copied().unwrap_or_default()
    }

    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl QuotaService for InMemoryQuota {
    async fn reserve(&self, ctx: &RequestContext, deltas: QuotaDeltas) -> Result<Reservation> {
        let mut ledger = self.lock();
        let mut projected = ledger.usage.get(&ctx.project_id).copied().unwrap_or_default();
        for pending in ledger.pending.values().filter(|r| r.project_id == ctx.project_id) {
            projected.backups += pending.deltas.backups.max(0);
            projected.backup_gigabytes += pending.deltas.backup_gigabytes.max(0);
        }

        if deltas.backups > 0 && projected.backups + deltas.backups > self.limits.backups {
            return Err(BackupError::Quota {
                reason: format!("backup count limit of {} exceeded", self.limits.backups),
            });
        }
        if deltas.backup_gigabytes > 0
            && projected.backup_gigabytes + deltas.backup_gigabytes > self.limits.backup_gigabytes
        {
            return Err(BackupError::Quota {
                reason: format!(
                    "backup gigabytes limit of {} exceeded",
                    self.limits.backup_gigabytes
                ),
            });
        }

        let reservation = Reservation {
            id: Uuid::new_v4().to_string(),
            project_id: ctx.project_id.clone(),
            deltas,
        };
        ledger
            .pending
            .insert(reservation.id.clone(), reservation.clone());
        debug!("Reserved {:?} as {}", deltas, reservation.id);
        Ok(reservation)
    }

    async fn commit(&self, _ctx: &RequestContext, reservation: &Reservation) -> Result<()> {
        let mut ledger = self.lock();
        let reservation = ledger
            .pending
            .remove(&reservation.id)
            .ok_or_else(|| BackupError::not_found(ResourceKind::Reservation, &reservation.id))?;
        let usage = ledger.usage.entry(reservation.project_id).or_default();
        usage.backups = (usage.backups + reservation.deltas.backups).max(0);
        usage.backup_gigabytes =
            (usage.backup_gigabytes + reservation.deltas.backup_gigabytes).max(0);
        Ok(())
    }

    async fn rollback(&self, _ctx: &RequestContext, reservation: &Reservation) -> Result<()> {
        self.lock()
            .pending
            .remove(&reservation.id)
            .map(|_| ())
            .ok_or_else(|| BackupError::not_found(ResourceKind::Reservation, &reservation.id))
    }
}
