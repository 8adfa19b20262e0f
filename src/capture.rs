//! Change capture: one audit record per mutation.
//!
//! Capture runs synchronously inside the unit of work that performs the
//! mutation. A storage failure here is fatal to that mutation; a skipped
//! capture (no-op update, unresolvable tenant) is data, not an error, and
//! the only cases in which a real mutation produces no record.

use crate::context::ActorContext;
use crate::error::{Result, RewindError};
use crate::registry::{EntityDescriptor, EntityRegistry, KeyKind, TenantSource};
use crate::session::SessionTracker;
use crate::store::{AuditAction, AuditRecord, AuditStore};
use crate::types::{Document, EntityHandle, EntityId, TenantId};
use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Why capture intentionally produced no record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Update with no differing fields.
    NoChange,
    /// No tenant column and no ambient tenant: system-level operation.
    NoTenant,
}

/// Result of a capture call.
#[derive(Debug, Clone)]
pub enum CaptureOutcome {
    /// A record was appended.
    Recorded(AuditRecord),
    /// Capture was intentionally skipped.
    Skipped(SkipReason),
}

impl CaptureOutcome {
    /// The appended record, if any.
    pub fn record(&self) -> Option<&AuditRecord> {
        match self {
            CaptureOutcome::Recorded(r) => Some(r),
            CaptureOutcome::Skipped(_) => None,
        }
    }
}

/// Capture statistics.
#[derive(Default)]
pub struct CaptureStats {
    /// Records appended.
    pub records_written: AtomicU64,
    /// Updates skipped because nothing changed.
    pub skipped_no_change: AtomicU64,
    /// Mutations skipped because no tenant resolved.
    pub skipped_no_tenant: AtomicU64,
}

/// Snapshot of capture statistics.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CaptureStatsSnapshot {
    pub records_written: u64,
    pub skipped_no_change: u64,
    pub skipped_no_tenant: u64,
}

/// The change capture engine.
pub struct ChangeCapture {
    registry: EntityRegistry,
    store: Arc<dyn AuditStore>,
    sessions: SessionTracker,
    stats: Arc<CaptureStats>,
}

impl ChangeCapture {
    /// Creates a capture engine.
    pub fn new(registry: EntityRegistry, store: Arc<dyn AuditStore>, sessions: SessionTracker) -> Self {
        Self {
            registry,
            store,
            sessions,
            stats: Arc::new(CaptureStats::default()),
        }
    }

    /// Captures an insert.
    pub async fn capture_insert(
        &self,
        entity_type: &str,
        new_row: &Document,
        ctx: &ActorContext,
    ) -> Result<CaptureOutcome> {
        self.capture(entity_type, AuditAction::Insert, None, Some(new_row), ctx)
            .await
    }

    /// Captures an update.
    pub async fn capture_update(
        &self,
        entity_type: &str,
        old_row: &Document,
        new_row: &Document,
        ctx: &ActorContext,
    ) -> Result<CaptureOutcome> {
        self.capture(
            entity_type,
            AuditAction::Update,
            Some(old_row),
            Some(new_row),
            ctx,
        )
        .await
    }

    /// Captures a delete.
    pub async fn capture_delete(
        &self,
        entity_type: &str,
        old_row: &Document,
        ctx: &ActorContext,
    ) -> Result<CaptureOutcome> {
        self.capture(entity_type, AuditAction::Delete, Some(old_row), None, ctx)
            .await
    }

    /// Captures a restore overwrite of a known target. Restores are never
    /// suppressed or skipped, even when the restored state equals the
    /// current state or both row images are absent: the handle already
    /// names the tenant and key, and a completed restore must always leave
    /// a record.
    pub async fn capture_restore(
        &self,
        handle: &EntityHandle,
        old_row: Option<&Document>,
        new_row: Option<&Document>,
        ctx: &ActorContext,
    ) -> Result<CaptureOutcome> {
        self.registry.get(&handle.entity_type).await?;

        let record = AuditRecord {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: handle.tenant_id.clone(),
            entity_type: handle.entity_type.clone(),
            entity_id: handle.entity_id.clone(),
            action: AuditAction::Restore,
            actor_id: ctx.actor_id.clone(),
            actor_email: ctx.actor_email.clone(),
            session_id: ctx.session_id.clone(),
            old_state: old_row.cloned(),
            new_state: new_row.cloned(),
            changed_fields: changed_fields(AuditAction::Restore, old_row, new_row),
            ip: ctx.ip.clone(),
            user_agent: ctx.user_agent.clone(),
            app_context: ctx.app_context.clone(),
            created_at: Utc::now(),
            seq: 0,
        };

        let stored = self
            .store
            .append(record)
            .await
            .map_err(|e| RewindError::CaptureFailed(e.to_string()))?;

        if let Some(session_id) = &ctx.session_id {
            self.sessions.record_change(session_id, &handle.entity_type).await;
        }

        self.stats.records_written.fetch_add(1, Ordering::Relaxed);
        Ok(CaptureOutcome::Recorded(stored))
    }

    /// Core capture path.
    async fn capture(
        &self,
        entity_type: &str,
        action: AuditAction,
        old_row: Option<&Document>,
        new_row: Option<&Document>,
        ctx: &ActorContext,
    ) -> Result<CaptureOutcome> {
        let descriptor = self.registry.get(entity_type).await?;

        let changed_fields = changed_fields(action, old_row, new_row);
        if action == AuditAction::Update && changed_fields.is_empty() {
            self.stats.skipped_no_change.fetch_add(1, Ordering::Relaxed);
            debug!(entity_type, "Skipped no-op update");
            return Ok(CaptureOutcome::Skipped(SkipReason::NoChange));
        }

        let tenant_id = match resolve_tenant(&descriptor, old_row, new_row, ctx) {
            Some(t) => t,
            None => {
                self.stats.skipped_no_tenant.fetch_add(1, Ordering::Relaxed);
                debug!(entity_type, "Skipped capture without tenant");
                return Ok(CaptureOutcome::Skipped(SkipReason::NoTenant));
            }
        };

        let entity_id = extract_key(&descriptor, old_row, new_row)?;

        let record = AuditRecord {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id,
            entity_type: entity_type.to_string(),
            entity_id,
            action,
            actor_id: ctx.actor_id.clone(),
            actor_email: ctx.actor_email.clone(),
            session_id: ctx.session_id.clone(),
            old_state: old_row.cloned(),
            new_state: new_row.cloned(),
            changed_fields,
            ip: ctx.ip.clone(),
            user_agent: ctx.user_agent.clone(),
            app_context: ctx.app_context.clone(),
            created_at: Utc::now(),
            seq: 0,
        };

        // An append failure propagates and aborts the enclosing mutation
        let stored = self
            .store
            .append(record)
            .await
            .map_err(|e| RewindError::CaptureFailed(e.to_string()))?;

        if let Some(session_id) = &ctx.session_id {
            self.sessions.record_change(session_id, entity_type).await;
        }

        self.stats.records_written.fetch_add(1, Ordering::Relaxed);
        Ok(CaptureOutcome::Recorded(stored))
    }

    /// Snapshot of capture statistics.
    pub fn stats(&self) -> CaptureStatsSnapshot {
        CaptureStatsSnapshot {
            records_written: self.stats.records_written.load(Ordering::Relaxed),
            skipped_no_change: self.stats.skipped_no_change.load(Ordering::Relaxed),
            skipped_no_tenant: self.stats.skipped_no_tenant.load(Ordering::Relaxed),
        }
    }
}

/// Computes `changed_fields` for an action.
///
/// Insert: all new keys. Delete: all old keys. Update/Restore: keys present
/// in either image whose values differ. Sorted for stable output.
fn changed_fields(
    action: AuditAction,
    old_row: Option<&Document>,
    new_row: Option<&Document>,
) -> Vec<String> {
    match action {
        AuditAction::Insert => new_row
            .map(|d| d.keys().cloned().collect::<Vec<_>>())
            .unwrap_or_default(),
        AuditAction::Delete => old_row
            .map(|d| d.keys().cloned().collect::<Vec<_>>())
            .unwrap_or_default(),
        AuditAction::Update | AuditAction::Restore => {
            let empty = Document::new();
            let old = old_row.unwrap_or(&empty);
            let new = new_row.unwrap_or(&empty);
            let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
            keys.into_iter()
                .filter(|k| old.get(*k) != new.get(*k))
                .cloned()
                .collect()
        }
    }
}

/// Resolves the tenant for a mutation: entity tenant column first, then the
/// ambient session tenant. A malformed tenant value in the row cannot mint a
/// tenant scope; it falls back to the ambient tenant.
pub(crate) fn resolve_tenant(
    descriptor: &EntityDescriptor,
    old_row: Option<&Document>,
    new_row: Option<&Document>,
    ctx: &ActorContext,
) -> Option<TenantId> {
    if let TenantSource::Column(column) = &descriptor.tenant_source {
        let from_row = new_row
            .and_then(|d| d.get(column))
            .or_else(|| old_row.and_then(|d| d.get(column)))
            .and_then(Value::as_str)
            .and_then(|s| TenantId::try_new(s).ok());
        if from_row.is_some() {
            return from_row;
        }
    }
    ctx.tenant_id.clone()
}

/// Extracts the primary key from whichever row image is present.
pub(crate) fn extract_key(
    descriptor: &EntityDescriptor,
    old_row: Option<&Document>,
    new_row: Option<&Document>,
) -> Result<EntityId> {
    let value = new_row
        .and_then(|d| d.get(&descriptor.key_column))
        .or_else(|| old_row.and_then(|d| d.get(&descriptor.key_column)))
        .ok_or_else(|| {
            RewindError::Validation(format!(
                "Row of type {} is missing key column {}",
                descriptor.entity_type, descriptor.key_column
            ))
        })?;

    match descriptor.key_kind {
        KeyKind::Text => value.as_str().map(EntityId::text).ok_or_else(|| {
            RewindError::Validation(format!(
                "Key column {} of {} is not a string",
                descriptor.key_column, descriptor.entity_type
            ))
        }),
        KeyKind::Int => value.as_i64().map(EntityId::int).ok_or_else(|| {
            RewindError::Validation(format!(
                "Key column {} of {} is not an integer",
                descriptor.key_column, descriptor.entity_type
            ))
        }),
    }
}
