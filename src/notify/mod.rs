use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::context::RequestContext;
use crate::error::Result;
use crate::models::Backup;

/// Usage notification emitted around orchestrated operations
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageEvent {
    pub entity_type: String,
    pub entity_id: String,
    /// e.g. `backup.create.start`
    pub event_type: String,
    pub extra: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl UsageEvent {
    pub fn for_backup(backup: &Backup, suffix: &str) -> Self {
        let mut extra = BTreeMap::new();
        extra.insert("volume_id".to_string(), backup.volume_id.clone());
        extra.insert("status".to_string(), backup.status.to_string());
        extra.insert("size".to_string(), backup.size.to_string());
        if let Some(ref snapshot_id) = backup.snapshot_id {
            extra.insert("snapshot_id".to_string(), snapshot_id.clone());
        }
        if let Some(ref reason) = backup.fail_reason {
            extra.insert("fail_reason".to_string(), reason.clone());
        }

        Self {
            entity_type: "backup".to_string(),
            entity_id: backup.id.clone(),
            event_type: format!("backup.{}", suffix),
            extra,
            timestamp: Utc::now(),
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

pub trait NotificationSink: Send + Sync {
    fn notify_usage(&self, ctx: &RequestContext, event: &UsageEvent) -> Result<()>;
}

/// Writes usage events to the log.
#[derive(Debug, Clone, Default)]
pub struct TracingNotifier;

impl NotificationSink for TracingNotifier {
    fn notify_usage(&self, ctx: &RequestContext, event: &UsageEvent) -> Result<()> {
        info!(
            target: "bolt_backup::usage",
            request_id = %ctx.request_id,
            entity = %event.entity_id,
            extra = %serde_json::to_string(&event.extra)?,
            "{}",
            event.event_type
        );
        Ok(())
    }
}

/// Fire-and-forget delivery: a failing sink never affects the operation.
pub fn emit(sink: &dyn NotificationSink, ctx: &RequestContext, event: UsageEvent) {
    if let Err(e) = sink.notify_usage(ctx, &event) {
        warn!(
            "Failed to send {} notification for {}: {}",
            event.event_type, event.entity_id, e
        );
    }
}
