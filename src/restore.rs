//! Administrative restores: applying historical state back onto live data.
//!
//! A restore is itself audited: every applied target writes a `Restore`
//! audit record whose old state is the rollback payload and whose new state
//! is the restored document. The operation moves through an explicit state
//! machine; approval always resolves fully before any exclusive section is
//! entered, and per-entity locks span snapshot, apply, and audit so the
//! rollback payload is accurate against concurrent live mutations.
//!
//! Multi-target restores report per-target success and failure. A partial
//! failure marks the operation `Failed` while keeping already-restored
//! targets restored: automatically reversing a partially applied restore
//! risks cascading errors, so undoing one takes a further explicit restore.

use crate::backup::{payload_checksum, BackupCoordinator, BackupKind, BackupScope};
use crate::capture::ChangeCapture;
use crate::config::RewindConfig;
use crate::context::ActorContext;
use crate::entity::EntityStore;
use crate::error::{Result, RewindError};
use crate::reconstruct::{Reconstruction, Reconstructor};
use crate::registry::EntityRegistry;
use crate::session::SessionTracker;
use crate::store::{AuditQuery, AuditStore};
use crate::types::{Document, EntityHandle, EntityId, TenantId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

/// What a restore targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "scope")]
pub enum RestoreScope {
    /// Named fields of one entity.
    Field {
        entity_type: String,
        entity_id: EntityId,
        fields: Vec<String>,
    },
    /// One full entity.
    Record {
        entity_type: String,
        entity_id: EntityId,
    },
    /// Every entity touched by one session, restored to the session start.
    Session { session_id: String },
    /// Every entity of one type, restored to the restore point.
    TimePoint { entity_type: String },
    /// Every entity of the named types, or an explicit id list for a
    /// single type.
    Bulk {
        entity_types: Vec<String>,
        entity_ids: Vec<EntityId>,
    },
}

impl RestoreScope {
    /// Short name for summaries and approval rules.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Field { .. } => "field",
            Self::Record { .. } => "record",
            Self::Session { .. } => "session",
            Self::TimePoint { .. } => "time_point",
            Self::Bulk { .. } => "bulk",
        }
    }

    /// Whether this scope always needs an approver, regardless of config.
    pub fn always_needs_approval(&self) -> bool {
        matches!(
            self,
            Self::Session { .. } | Self::TimePoint { .. } | Self::Bulk { .. }
        )
    }
}

/// Restore operation lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStatus {
    Requested,
    PendingApproval,
    Approved,
    Executing,
    Completed,
    Failed,
    Rejected,
}

impl RestoreStatus {
    /// Legal transitions; everything else is unrepresentable.
    pub fn can_transition(self, to: RestoreStatus) -> bool {
        use RestoreStatus::*;
        matches!(
            (self, to),
            (Requested, PendingApproval)
                | (Requested, Approved)
                | (PendingApproval, Approved)
                | (PendingApproval, Rejected)
                | (Approved, Executing)
                | (Executing, Completed)
                | (Executing, Failed)
        )
    }

    /// Whether this state is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Rejected)
    }
}

impl std::fmt::Display for RestoreStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Requested => "requested",
            Self::PendingApproval => "pending_approval",
            Self::Approved => "approved",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
        };
        write!(f, "{}", s)
    }
}

/// How one target was changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetOutcome {
    /// Full record replaced with the historical state.
    Replaced,
    /// Live record deleted (did not exist at the restore point).
    Deleted,
    /// Only the named fields overwritten.
    FieldsRestored,
}

/// Per-target result of a restore execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetResult {
    /// The target entity.
    pub handle: EntityHandle,
    /// How it was changed, when the target succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<TargetOutcome>,
    /// Failure message, when it did not.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Target was never attempted (cancelled run).
    pub skipped: bool,
    /// The Restore audit record written for this target.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_record_id: Option<String>,
    /// When this target finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TargetResult {
    fn succeeded(&self) -> bool {
        self.outcome.is_some()
    }
}

/// One restore operation record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreOperation {
    /// Unique operation ID.
    pub id: String,
    /// Tenant the restore operates in.
    pub tenant_id: TenantId,
    /// Requesting actor.
    pub restored_by: String,
    /// Requesting actor's email.
    pub restored_by_email: String,
    /// What is being restored.
    pub scope: RestoreScope,
    /// Instant to restore to. For session scope this is resolved to the
    /// session's start at execution.
    pub restore_point: DateTime<Utc>,
    /// Entity type, for single-type scopes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affected_entity_type: Option<String>,
    /// Entity IDs actually targeted, resolved at execution.
    pub affected_entity_ids: Vec<EntityId>,
    /// Fields targeted by a field-scope restore.
    pub affected_fields: Vec<String>,
    /// Operator-supplied reason.
    pub reason: String,
    /// Approver, once approved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    /// Approval instant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    /// Human-readable outcome summary.
    pub changes_summary: String,
    /// Lifecycle state.
    pub status: RestoreStatus,
    /// Per-target results, persisted as each target lands.
    pub target_results: Vec<TargetResult>,
    /// Pre-restore backup snapshot, once taken.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    /// Request instant.
    pub requested_at: DateTime<Utc>,
    /// Completion instant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Top-level restore orchestrator.
pub struct RestoreOrchestrator {
    config: RewindConfig,
    store: Arc<dyn AuditStore>,
    entities: Arc<dyn EntityStore>,
    capture: Arc<ChangeCapture>,
    reconstructor: Reconstructor,
    sessions: SessionTracker,
    backups: BackupCoordinator,
    registry: EntityRegistry,
    operations: Arc<RwLock<HashMap<String, RestoreOperation>>>,
    entity_locks: Arc<Mutex<HashMap<EntityHandle, Arc<Mutex<()>>>>>,
    cancel_flags: Arc<RwLock<HashMap<String, Arc<AtomicBool>>>>,
}

impl RestoreOrchestrator {
    /// Creates an orchestrator.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RewindConfig,
        store: Arc<dyn AuditStore>,
        entities: Arc<dyn EntityStore>,
        capture: Arc<ChangeCapture>,
        sessions: SessionTracker,
        backups: BackupCoordinator,
        registry: EntityRegistry,
    ) -> Self {
        let reconstructor = Reconstructor::new(store.clone());
        Self {
            config,
            store,
            entities,
            capture,
            reconstructor,
            sessions,
            backups,
            registry,
            operations: Arc::new(RwLock::new(HashMap::new())),
            entity_locks: Arc::new(Mutex::new(HashMap::new())),
            cancel_flags: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Requests a restore. Validation happens here, before any mutation;
    /// scopes that do not require approval are auto-approved with the
    /// requester recorded as approver.
    pub async fn request_restore(
        &self,
        scope: RestoreScope,
        restore_point: DateTime<Utc>,
        reason: impl Into<String>,
        ctx: &ActorContext,
    ) -> Result<RestoreOperation> {
        let tenant_id = ctx
            .tenant_id
            .clone()
            .ok_or_else(|| RewindError::Validation("restore requires a tenant context".into()))?;

        self.validate_scope(&scope, &tenant_id).await?;

        let needs_approval = scope.always_needs_approval()
            || match scope {
                RestoreScope::Field { .. } => self.config.approval_required_for_field,
                RestoreScope::Record { .. } => self.config.approval_required_for_record,
                _ => true,
            };

        let (affected_entity_type, affected_entity_ids, affected_fields) = match &scope {
            RestoreScope::Field {
                entity_type,
                entity_id,
                fields,
            } => (
                Some(entity_type.clone()),
                vec![entity_id.clone()],
                fields.clone(),
            ),
            RestoreScope::Record {
                entity_type,
                entity_id,
            } => (Some(entity_type.clone()), vec![entity_id.clone()], vec![]),
            RestoreScope::TimePoint { entity_type } => {
                (Some(entity_type.clone()), vec![], vec![])
            }
            RestoreScope::Session { .. } | RestoreScope::Bulk { .. } => (None, vec![], vec![]),
        };

        let mut op = RestoreOperation {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id,
            restored_by: ctx.actor_id.clone(),
            restored_by_email: ctx.actor_email.clone(),
            scope,
            restore_point,
            affected_entity_type,
            affected_entity_ids,
            affected_fields,
            reason: reason.into(),
            approved_by: None,
            approved_at: None,
            changes_summary: String::new(),
            status: RestoreStatus::Requested,
            target_results: Vec::new(),
            snapshot_id: None,
            requested_at: Utc::now(),
            completed_at: None,
        };

        if needs_approval {
            op.status = RestoreStatus::PendingApproval;
        } else {
            // Auto-approval still names an approver in the trail
            op.status = RestoreStatus::Approved;
            op.approved_by = Some(ctx.actor_id.clone());
            op.approved_at = Some(Utc::now());
        }

        info!(
            op_id = %op.id,
            scope = op.scope.kind(),
            status = %op.status,
            "Restore requested"
        );

        self.cancel_flags
            .write()
            .await
            .insert(op.id.clone(), Arc::new(AtomicBool::new(false)));
        self.operations
            .write()
            .await
            .insert(op.id.clone(), op.clone());
        Ok(op)
    }

    /// Approves a pending restore.
    pub async fn approve_restore(
        &self,
        op_id: &str,
        approved_by: impl Into<String>,
    ) -> Result<RestoreOperation> {
        let mut ops = self.operations.write().await;
        let op = ops
            .get_mut(op_id)
            .ok_or_else(|| RewindError::NotFound(format!("restore {}", op_id)))?;

        Self::transition(op, RestoreStatus::Approved)?;
        op.approved_by = Some(approved_by.into());
        op.approved_at = Some(Utc::now());
        info!(op_id, approver = op.approved_by.as_deref(), "Restore approved");
        Ok(op.clone())
    }

    /// Rejects a pending restore.
    pub async fn reject_restore(
        &self,
        op_id: &str,
        rejected_by: impl Into<String>,
        reason: impl Into<String>,
    ) -> Result<RestoreOperation> {
        let op = {
            let mut ops = self.operations.write().await;
            let op = ops
                .get_mut(op_id)
                .ok_or_else(|| RewindError::NotFound(format!("restore {}", op_id)))?;

            Self::transition(op, RestoreStatus::Rejected)?;
            op.changes_summary = format!("rejected by {}: {}", rejected_by.into(), reason.into());
            op.completed_at = Some(Utc::now());
            warn!(op_id, "Restore rejected");
            op.clone()
        };

        self.cancel_flags.write().await.remove(op_id);
        Ok(op)
    }

    /// Requests cancellation. Takes effect between targets, never
    /// mid-target.
    pub async fn cancel_restore(&self, op_id: &str) -> Result<()> {
        if let Some(flag) = self.cancel_flags.read().await.get(op_id) {
            flag.store(true, Ordering::SeqCst);
            info!(op_id, "Restore cancellation requested");
            return Ok(());
        }

        // The flag is reclaimed once the operation reaches a terminal state
        let op = self.get_restore(op_id).await?;
        Err(RewindError::InvalidState(format!(
            "Restore {} is already {}",
            op_id, op.status
        )))
    }

    /// Looks up an operation.
    pub async fn get_restore(&self, op_id: &str) -> Result<RestoreOperation> {
        self.operations
            .read()
            .await
            .get(op_id)
            .cloned()
            .ok_or_else(|| RewindError::NotFound(format!("restore {}", op_id)))
    }

    /// Lists a tenant's operations, newest first.
    pub async fn list_restores(&self, tenant_id: &TenantId) -> Vec<RestoreOperation> {
        let mut ops: Vec<RestoreOperation> = self
            .operations
            .read()
            .await
            .values()
            .filter(|op| &op.tenant_id == tenant_id)
            .cloned()
            .collect();
        ops.sort_by(|a, b| b.requested_at.cmp(&a.requested_at));
        ops
    }

    /// Executes an approved restore.
    ///
    /// Approval has fully resolved before this is called; no exclusive
    /// section spans an approval wait. An operation never stays in
    /// `Executing`: any error during execution lands it in `Failed` with
    /// the error recorded in `changes_summary`.
    pub async fn execute_restore(&self, op_id: &str) -> Result<RestoreOperation> {
        let (scope, tenant_id, restore_point, actor) = {
            let mut ops = self.operations.write().await;
            let op = ops
                .get_mut(op_id)
                .ok_or_else(|| RewindError::NotFound(format!("restore {}", op_id)))?;
            Self::transition(op, RestoreStatus::Executing)?;

            let actor = ActorContext::new(op.restored_by.clone(), op.restored_by_email.clone())
                .with_tenant(op.tenant_id.clone())
                .with_app_context(format!("restore:{}", op.id));
            (op.scope.clone(), op.tenant_id.clone(), op.restore_point, actor)
        };

        match self
            .run_execution(op_id, scope, tenant_id, restore_point, actor)
            .await
        {
            Ok(op) => Ok(op),
            Err(e) => {
                warn!(op_id, error = %e, "Restore execution failed");
                if let Ok(op) = self.get_restore(op_id).await {
                    if let Some(snapshot_id) = op.snapshot_id {
                        let _ = self.backups.fail(&snapshot_id, e.to_string()).await;
                    }
                }
                self.finish(
                    op_id,
                    RestoreStatus::Failed,
                    format!("execution error: {}", e),
                )
                .await
            }
        }
    }

    async fn run_execution(
        &self,
        op_id: &str,
        scope: RestoreScope,
        tenant_id: TenantId,
        mut restore_point: DateTime<Utc>,
        actor: ActorContext,
    ) -> Result<RestoreOperation> {
        // Session scope restores to the session's own start time
        if let RestoreScope::Session { session_id } = &scope {
            let session = self.sessions.get(session_id).await?;
            restore_point = session.started_at;
            let mut ops = self.operations.write().await;
            if let Some(op) = ops.get_mut(op_id) {
                op.restore_point = restore_point;
            }
        }

        let targets = self.resolve_targets(&scope, &tenant_id).await?;
        let fields = match &scope {
            RestoreScope::Field { fields, .. } => Some(fields.clone()),
            _ => None,
        };

        {
            let mut ops = self.operations.write().await;
            if let Some(op) = ops.get_mut(op_id) {
                op.affected_entity_ids = targets.iter().map(|h| h.entity_id.clone()).collect();
            }
        }

        if targets.is_empty() {
            return self
                .finish(op_id, RestoreStatus::Failed, "no targets resolved".into())
                .await;
        }

        // One pre-restore snapshot covers the whole operation; the
        // authoritative per-target rollback payload is the old_state on
        // each Restore audit record, captured inside the target's lock.
        let entity_types: Vec<String> = targets
            .iter()
            .map(|h| h.entity_type.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let snapshot_scope = if targets.len() == 1 {
            BackupScope::Record
        } else {
            BackupScope::Table
        };
        let snapshot = self
            .backups
            .begin(
                tenant_id.clone(),
                BackupKind::PreRestore,
                snapshot_scope,
                entity_types,
            )
            .await;
        {
            let mut ops = self.operations.write().await;
            if let Some(op) = ops.get_mut(op_id) {
                op.snapshot_id = Some(snapshot.id.clone());
            }
        }

        let cancel_flag = self
            .cancel_flags
            .read()
            .await
            .get(op_id)
            .cloned()
            .unwrap_or_else(|| Arc::new(AtomicBool::new(false)));

        let mut rollback_payload: Vec<(EntityHandle, Option<Document>)> = Vec::new();
        let mut cancelled = false;

        for handle in &targets {
            if cancel_flag.load(Ordering::SeqCst) {
                cancelled = true;
                let result = TargetResult {
                    handle: handle.clone(),
                    outcome: None,
                    error: Some("cancelled before this target".to_string()),
                    skipped: true,
                    audit_record_id: None,
                    completed_at: None,
                };
                self.push_target_result(op_id, result).await;
                continue;
            }

            let result = self
                .restore_target(handle, restore_point, fields.as_deref(), &actor)
                .await;
            if let Ok((_, ref payload)) = result {
                rollback_payload.push((handle.clone(), payload.clone()));
            }

            let target_result = match result {
                Ok((result, _)) => result,
                Err(e) => TargetResult {
                    handle: handle.clone(),
                    outcome: None,
                    error: Some(e.to_string()),
                    skipped: false,
                    audit_record_id: None,
                    completed_at: Some(Utc::now()),
                },
            };
            self.push_target_result(op_id, target_result).await;
        }

        // Close out the snapshot metadata with the collected payload
        let payload_bytes = serde_json::to_vec(&rollback_payload)?;
        self.backups
            .complete(
                &snapshot.id,
                rollback_payload.len() as u64,
                payload_bytes.len() as u64,
                Some(payload_checksum(&payload_bytes)),
            )
            .await?;

        let op = self.get_restore(op_id).await?;
        let succeeded = op.target_results.iter().filter(|r| r.succeeded()).count();
        let failed = op
            .target_results
            .iter()
            .filter(|r| !r.succeeded() && !r.skipped)
            .count();
        let skipped = op.target_results.iter().filter(|r| r.skipped).count();

        let summary = if cancelled {
            format!(
                "cancelled: {}/{} targets restored to {}, {} skipped",
                succeeded,
                op.target_results.len(),
                restore_point.to_rfc3339(),
                skipped
            )
        } else {
            format!(
                "{}/{} targets restored to {}{}",
                succeeded,
                op.target_results.len(),
                restore_point.to_rfc3339(),
                if failed > 0 {
                    format!(", {} failed", failed)
                } else {
                    String::new()
                }
            )
        };

        let status = if failed == 0 && skipped == 0 && succeeded > 0 {
            RestoreStatus::Completed
        } else {
            RestoreStatus::Failed
        };
        self.finish(op_id, status, summary).await
    }

    async fn finish(
        &self,
        op_id: &str,
        status: RestoreStatus,
        summary: String,
    ) -> Result<RestoreOperation> {
        let op = {
            let mut ops = self.operations.write().await;
            let op = ops
                .get_mut(op_id)
                .ok_or_else(|| RewindError::NotFound(format!("restore {}", op_id)))?;
            Self::transition(op, status)?;
            op.changes_summary = summary;
            op.completed_at = Some(Utc::now());
            info!(op_id, status = %op.status, summary = %op.changes_summary, "Restore finished");
            op.clone()
        };

        // Terminal: the cancel flag and any idle entity locks can go
        self.cancel_flags.write().await.remove(op_id);
        self.reclaim_locks().await;
        Ok(op)
    }

    /// Drops lock entries nobody currently holds or awaits. Waiters clone
    /// the `Arc` under the map lock before blocking, so a strong count of
    /// one proves the entry is idle.
    async fn reclaim_locks(&self) {
        let mut locks = self.entity_locks.lock().await;
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    async fn push_target_result(&self, op_id: &str, result: TargetResult) {
        let mut ops = self.operations.write().await;
        if let Some(op) = ops.get_mut(op_id) {
            op.target_results.push(result);
        }
    }

    fn transition(op: &mut RestoreOperation, to: RestoreStatus) -> Result<()> {
        if !op.status.can_transition(to) {
            return Err(RewindError::InvalidTransition {
                from: op.status.to_string(),
                to: to.to_string(),
            });
        }
        op.status = to;
        Ok(())
    }

    async fn validate_scope(&self, scope: &RestoreScope, tenant_id: &TenantId) -> Result<()> {
        match scope {
            RestoreScope::Field {
                entity_type, fields, ..
            } => {
                self.registry.get(entity_type).await?;
                if fields.is_empty() {
                    return Err(RewindError::Validation(
                        "Field restore requires at least one field".into(),
                    ));
                }
            }
            RestoreScope::Record { entity_type, .. }
            | RestoreScope::TimePoint { entity_type } => {
                self.registry.get(entity_type).await?;
            }
            RestoreScope::Session { session_id } => {
                let session = self.sessions.get(session_id).await?;
                if &session.tenant_id != tenant_id {
                    return Err(RewindError::Validation(format!(
                        "Session {} belongs to another tenant",
                        session_id
                    )));
                }
            }
            RestoreScope::Bulk {
                entity_types,
                entity_ids,
            } => {
                if entity_types.is_empty() {
                    return Err(RewindError::Validation(
                        "Bulk restore requires at least one entity type".into(),
                    ));
                }
                if !entity_ids.is_empty() && entity_types.len() != 1 {
                    return Err(RewindError::Validation(
                        "Explicit entity IDs require exactly one entity type".into(),
                    ));
                }
                for entity_type in entity_types {
                    self.registry.get(entity_type).await?;
                }
            }
        }
        Ok(())
    }

    /// Resolves the concrete target set for a scope, filtered to the
    /// operation's tenant.
    async fn resolve_targets(
        &self,
        scope: &RestoreScope,
        tenant_id: &TenantId,
    ) -> Result<Vec<EntityHandle>> {
        let mut targets = match scope {
            RestoreScope::Field {
                entity_type,
                entity_id,
                ..
            }
            | RestoreScope::Record {
                entity_type,
                entity_id,
            } => vec![EntityHandle::new(
                tenant_id.clone(),
                entity_type.clone(),
                entity_id.clone(),
            )],
            RestoreScope::Session { session_id } => {
                let query = AuditQuery::tenant(tenant_id.clone()).session(session_id.clone());
                self.store.handles_matching(&query).await?
            }
            RestoreScope::TimePoint { entity_type } => {
                self.type_targets(tenant_id, entity_type).await?
            }
            RestoreScope::Bulk {
                entity_types,
                entity_ids,
            } => {
                if !entity_ids.is_empty() {
                    entity_ids
                        .iter()
                        .map(|id| {
                            EntityHandle::new(
                                tenant_id.clone(),
                                entity_types[0].clone(),
                                id.clone(),
                            )
                        })
                        .collect()
                } else {
                    let mut all = Vec::new();
                    for entity_type in entity_types {
                        all.extend(self.type_targets(tenant_id, entity_type).await?);
                    }
                    all
                }
            }
        };

        targets.sort_by_key(|h| h.to_string());
        targets.dedup();
        Ok(targets)
    }

    /// Every entity of a type that is live now or appears in audit
    /// history: deleted rows must be restorable too.
    async fn type_targets(
        &self,
        tenant_id: &TenantId,
        entity_type: &str,
    ) -> Result<Vec<EntityHandle>> {
        let mut handles: Vec<EntityHandle> = self
            .entities
            .list_ids(tenant_id, entity_type)
            .await?
            .into_iter()
            .map(|id| EntityHandle::new(tenant_id.clone(), entity_type, id))
            .collect();

        let query = AuditQuery::tenant(tenant_id.clone()).entity_type(entity_type);
        handles.extend(self.store.handles_matching(&query).await?);
        Ok(handles)
    }

    /// Restores one target under its exclusive lock: snapshot current
    /// state, reconstruct, apply, audit. Returns the target result and the
    /// rollback payload.
    async fn restore_target(
        &self,
        handle: &EntityHandle,
        restore_point: DateTime<Utc>,
        fields: Option<&[String]>,
        actor: &ActorContext,
    ) -> Result<(TargetResult, Option<Document>)> {
        let lock = self.lock_for(handle).await;
        let _guard = lock.lock().await;

        // Rollback payload: the live state immediately before this restore
        let current = self.entities.get(handle).await?;

        let reconstruction = self
            .reconstructor
            .reconstruct(handle, restore_point)
            .await?;

        let (applied, outcome) = match (reconstruction, fields) {
            (Reconstruction::Unknown, _) => {
                return Err(RewindError::InvalidState(format!(
                    "history unavailable for {} before {}",
                    handle,
                    restore_point.to_rfc3339()
                )));
            }
            (Reconstruction::NotExisted, Some(_)) => {
                return Err(RewindError::InvalidState(format!(
                    "{} did not exist at {}; cannot restore fields",
                    handle,
                    restore_point.to_rfc3339()
                )));
            }
            (Reconstruction::Document(historical), Some(fields)) => {
                let mut live = current.clone().ok_or_else(|| {
                    RewindError::InvalidState(format!(
                        "{} has no live record; cannot restore fields",
                        handle
                    ))
                })?;
                for field in fields {
                    match historical.get(field) {
                        Some(value) => {
                            live.insert(field.clone(), value.clone());
                        }
                        None => {
                            live.remove(field);
                        }
                    }
                }
                self.entities.put(handle, live.clone()).await?;
                (Some(live), TargetOutcome::FieldsRestored)
            }
            (Reconstruction::Document(historical), None) => {
                self.entities.put(handle, historical.clone()).await?;
                (Some(historical), TargetOutcome::Replaced)
            }
            (Reconstruction::NotExisted, None) => {
                self.entities.remove(handle).await?;
                (None, TargetOutcome::Deleted)
            }
        };

        // The restore is itself audited, inside the same exclusive section.
        // This happens even for an already-absent target restored to
        // non-existence: a completed operation always leaves restore records.
        let captured = self
            .capture
            .capture_restore(handle, current.as_ref(), applied.as_ref(), actor)
            .await?;

        let result = TargetResult {
            handle: handle.clone(),
            outcome: Some(outcome),
            error: None,
            skipped: false,
            audit_record_id: captured.record().map(|r| r.id.clone()),
            completed_at: Some(Utc::now()),
        };
        Ok((result, current))
    }

    async fn lock_for(&self, handle: &EntityHandle) -> Arc<Mutex<()>> {
        let mut locks = self.entity_locks.lock().await;
        locks
            .entry(handle.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::MemoryEntityStore;
    use crate::registry::EntityDescriptor;
    use crate::store::MemoryAuditStore;
    use crate::types::document;
    use serde_json::json;

    async fn orchestrator(entities: Arc<dyn EntityStore>) -> RestoreOrchestrator {
        let registry = EntityRegistry::new();
        registry
            .register(EntityDescriptor::new("requirements", "organization_id"))
            .await;
        let store: Arc<dyn AuditStore> = Arc::new(MemoryAuditStore::new());
        let sessions = SessionTracker::new(chrono::Duration::minutes(30));
        let capture = Arc::new(ChangeCapture::new(
            registry.clone(),
            store.clone(),
            sessions.clone(),
        ));
        RestoreOrchestrator::new(
            RewindConfig::default(),
            store,
            entities,
            capture,
            sessions,
            BackupCoordinator::new(),
            registry,
        )
    }

    fn ctx() -> ActorContext {
        ActorContext::new("u1", "u1@acme.test").with_tenant(TenantId::new("acme"))
    }

    struct FailingEntityStore;

    #[async_trait::async_trait]
    impl EntityStore for FailingEntityStore {
        async fn get(&self, _: &EntityHandle) -> Result<Option<Document>> {
            Err(RewindError::Storage("disk offline".into()))
        }
        async fn put(&self, _: &EntityHandle, _: Document) -> Result<()> {
            Err(RewindError::Storage("disk offline".into()))
        }
        async fn remove(&self, _: &EntityHandle) -> Result<Option<Document>> {
            Err(RewindError::Storage("disk offline".into()))
        }
        async fn list_ids(&self, _: &TenantId, _: &str) -> Result<Vec<EntityId>> {
            Err(RewindError::Storage("disk offline".into()))
        }
    }

    #[tokio::test]
    async fn test_execution_error_lands_in_failed() {
        // Target resolution fails outright; the operation must still reach
        // a terminal state with the error recorded, never stay Executing.
        let orch = orchestrator(Arc::new(FailingEntityStore)).await;
        let op = orch
            .request_restore(
                RestoreScope::TimePoint {
                    entity_type: "requirements".into(),
                },
                Utc::now(),
                "rewind everything",
                &ctx(),
            )
            .await
            .unwrap();
        orch.approve_restore(&op.id, "admin").await.unwrap();

        let done = orch.execute_restore(&op.id).await.unwrap();
        assert_eq!(done.status, RestoreStatus::Failed);
        assert!(done.changes_summary.contains("execution error"));
        assert!(done.completed_at.is_some());

        // Terminal, so a retry is an illegal transition
        assert!(orch.execute_restore(&op.id).await.is_err());
    }

    #[tokio::test]
    async fn test_terminal_operation_releases_lock_state() {
        let entities: Arc<dyn EntityStore> = Arc::new(MemoryEntityStore::new());
        let orch = orchestrator(entities.clone()).await;

        let row = document(&[
            ("id", json!("r1")),
            ("organization_id", json!("acme")),
            ("name", json!("Acme")),
        ]);
        let handle = EntityHandle::new(TenantId::new("acme"), "requirements", "r1".into());
        entities.put(&handle, row.clone()).await.unwrap();
        orch.capture
            .capture_insert("requirements", &row, &ctx())
            .await
            .unwrap();

        let op = orch
            .request_restore(
                RestoreScope::Record {
                    entity_type: "requirements".into(),
                    entity_id: "r1".into(),
                },
                Utc::now(),
                "rewind",
                &ctx(),
            )
            .await
            .unwrap();
        let done = orch.execute_restore(&op.id).await.unwrap();
        assert_eq!(done.status, RestoreStatus::Completed);

        // Per-operation bookkeeping is reclaimed once terminal
        assert!(orch.entity_locks.lock().await.is_empty());
        assert!(orch.cancel_flags.read().await.is_empty());

        // Cancelling a finished operation is rejected, not silently queued
        assert!(matches!(
            orch.cancel_restore(&op.id).await,
            Err(RewindError::InvalidState(_))
        ));
    }

    #[test]
    fn test_transition_table() {
        use RestoreStatus::*;
        assert!(Requested.can_transition(PendingApproval));
        assert!(Requested.can_transition(Approved));
        assert!(PendingApproval.can_transition(Approved));
        assert!(PendingApproval.can_transition(Rejected));
        assert!(Approved.can_transition(Executing));
        assert!(Executing.can_transition(Completed));
        assert!(Executing.can_transition(Failed));

        // Illegal moves
        assert!(!Executing.can_transition(PendingApproval));
        assert!(!Completed.can_transition(Executing));
        assert!(!Rejected.can_transition(Approved));
        assert!(!Approved.can_transition(Completed));
    }

    #[test]
    fn test_terminal_states() {
        use RestoreStatus::*;
        assert!(Completed.is_terminal());
        assert!(Failed.is_terminal());
        assert!(Rejected.is_terminal());
        assert!(!Executing.is_terminal());
        assert!(!PendingApproval.is_terminal());
    }

    #[test]
    fn test_scope_approval_rules() {
        assert!(RestoreScope::Session {
            session_id: "s1".into()
        }
        .always_needs_approval());
        assert!(RestoreScope::TimePoint {
            entity_type: "req".into()
        }
        .always_needs_approval());
        assert!(RestoreScope::Bulk {
            entity_types: vec!["req".into()],
            entity_ids: vec![]
        }
        .always_needs_approval());
        assert!(!RestoreScope::Record {
            entity_type: "req".into(),
            entity_id: "r1".into()
        }
        .always_needs_approval());
    }

    #[test]
    fn test_scope_kind_names() {
        assert_eq!(
            RestoreScope::Field {
                entity_type: "req".into(),
                entity_id: "r1".into(),
                fields: vec!["name".into()]
            }
            .kind(),
            "field"
        );
        assert_eq!(
            RestoreScope::Bulk {
                entity_types: vec![],
                entity_ids: vec![]
            }
            .kind(),
            "bulk"
        );
    }
}
