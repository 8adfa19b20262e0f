//! The Rewind engine facade.
//!
//! Wires the registry, audit store, session tracker, capture engine,
//! reconstructor, backup coordinator and restore orchestrator into one
//! handle. Collaborator subsystems register their entity types here, route
//! mutations through [`Rewind::data`], and operators drive history,
//! time-travel and restore through the same handle.

use crate::backup::BackupCoordinator;
use crate::capture::{CaptureStatsSnapshot, ChangeCapture};
use crate::config::RewindConfig;
use crate::context::ActorContext;
use crate::entity::{AuditedStore, EntityStore, MemoryEntityStore};
use crate::error::Result;
use crate::reconstruct::{Reconstruction, Reconstructor};
use crate::registry::{EntityDescriptor, EntityRegistry};
use crate::restore::{RestoreOperation, RestoreOrchestrator, RestoreScope, RestoreStatus};
use crate::session::{SessionTracker, UserSession};
use crate::store::{AuditQuery, AuditStore, HistoryPage, MemoryAuditStore};
use crate::types::{EntityHandle, TenantId};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::info;

/// The audit, time-travel and restore engine.
pub struct Rewind {
    config: RewindConfig,
    registry: EntityRegistry,
    store: Arc<dyn AuditStore>,
    sessions: SessionTracker,
    capture: Arc<ChangeCapture>,
    reconstructor: Reconstructor,
    backups: BackupCoordinator,
    restores: RestoreOrchestrator,
    data: AuditedStore,
}

impl Rewind {
    /// Creates an engine with in-memory stores.
    pub fn new(config: RewindConfig) -> Result<Self> {
        Self::with_stores(
            config,
            Arc::new(MemoryAuditStore::new()),
            Arc::new(MemoryEntityStore::new()),
        )
    }

    /// Creates an engine over caller-provided stores.
    pub fn with_stores(
        config: RewindConfig,
        store: Arc<dyn AuditStore>,
        entities: Arc<dyn EntityStore>,
    ) -> Result<Self> {
        config.validate()?;

        let registry = EntityRegistry::new();
        let sessions = SessionTracker::new(Duration::minutes(
            config.session_idle_timeout_minutes as i64,
        ));
        let capture = Arc::new(ChangeCapture::new(
            registry.clone(),
            store.clone(),
            sessions.clone(),
        ));
        let reconstructor = Reconstructor::new(store.clone());
        let backups = BackupCoordinator::new();
        let restores = RestoreOrchestrator::new(
            config.clone(),
            store.clone(),
            entities.clone(),
            capture.clone(),
            sessions.clone(),
            backups.clone(),
            registry.clone(),
        );
        let data = AuditedStore::new(entities, capture.clone(), registry.clone());

        info!(
            retention_days = config.retention_days,
            "Rewind engine initialized"
        );
        Ok(Self {
            config,
            registry,
            store,
            sessions,
            capture,
            reconstructor,
            backups,
            restores,
            data,
        })
    }

    /// The engine configuration.
    pub fn config(&self) -> &RewindConfig {
        &self.config
    }

    /// Registers an entity type for auditing.
    pub async fn register_entity(&self, descriptor: EntityDescriptor) {
        self.registry.register(descriptor).await;
    }

    /// Registered entity type names.
    pub async fn registered_entities(&self) -> Vec<String> {
        self.registry.list().await
    }

    /// The audited mutation entry point.
    pub fn data(&self) -> &AuditedStore {
        &self.data
    }

    /// The backup coordinator.
    pub fn backups(&self) -> &BackupCoordinator {
        &self.backups
    }

    /// Capture statistics.
    pub fn capture_stats(&self) -> CaptureStatsSnapshot {
        self.capture.stats()
    }

    // --- history and time travel ---

    /// Ordered history of one entity, paginated at the configured page
    /// size. Read-only: repeating the query never writes anything.
    pub async fn get_history(
        &self,
        handle: &EntityHandle,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        offset: usize,
    ) -> Result<HistoryPage> {
        self.reconstructor
            .history(handle, from, to, offset, self.config.history_page_size)
            .await
    }

    /// Arbitrary audit log query, tenant-scoped.
    pub async fn query_audit(&self, query: &AuditQuery, offset: usize) -> Result<HistoryPage> {
        self.store
            .query(query, offset, self.config.history_page_size)
            .await
    }

    /// The entity's state at an instant.
    pub async fn reconstruct(
        &self,
        handle: &EntityHandle,
        at: DateTime<Utc>,
    ) -> Result<Reconstruction> {
        self.reconstructor.reconstruct(handle, at).await
    }

    /// Prunes audit history older than the configured retention period.
    /// Returns the number of records removed.
    pub async fn prune_history(&self) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(self.config.retention_days as i64);
        self.store.prune(cutoff).await
    }

    // --- sessions ---

    /// Starts a session from the actor context.
    pub async fn start_session(&self, ctx: &ActorContext) -> Result<UserSession> {
        self.sessions.start_session(ctx).await
    }

    /// Ends a session.
    pub async fn end_session(&self, session_id: &str) -> Result<UserSession> {
        self.sessions.end_session(session_id).await
    }

    /// Looks up a session.
    pub async fn get_session(&self, session_id: &str) -> Result<UserSession> {
        self.sessions.get(session_id).await
    }

    /// Lists a tenant's sessions.
    pub async fn list_sessions(&self, tenant_id: &TenantId) -> Vec<UserSession> {
        self.sessions.list_for_tenant(tenant_id).await
    }

    /// Closes sessions idle past the configured timeout.
    pub async fn sweep_idle_sessions(&self) -> u64 {
        self.sessions.sweep_idle().await
    }

    // --- restore ---

    /// Requests a restore. Scopes that need no approval execute
    /// immediately; the rest wait in `PendingApproval`.
    pub async fn request_restore(
        &self,
        scope: RestoreScope,
        restore_point: DateTime<Utc>,
        reason: impl Into<String>,
        ctx: &ActorContext,
    ) -> Result<RestoreOperation> {
        let op = self
            .restores
            .request_restore(scope, restore_point, reason, ctx)
            .await?;

        if op.status == RestoreStatus::Approved {
            return self.restores.execute_restore(&op.id).await;
        }
        Ok(op)
    }

    /// Approves a pending restore and executes it.
    pub async fn approve_restore(
        &self,
        op_id: &str,
        approved_by: impl Into<String>,
    ) -> Result<RestoreOperation> {
        self.restores.approve_restore(op_id, approved_by).await?;
        self.restores.execute_restore(op_id).await
    }

    /// Executes an already-approved restore.
    pub async fn execute_restore(&self, op_id: &str) -> Result<RestoreOperation> {
        self.restores.execute_restore(op_id).await
    }

    /// Rejects a pending restore.
    pub async fn reject_restore(
        &self,
        op_id: &str,
        rejected_by: impl Into<String>,
        reason: impl Into<String>,
    ) -> Result<RestoreOperation> {
        self.restores.reject_restore(op_id, rejected_by, reason).await
    }

    /// Requests cancellation of a running restore.
    pub async fn cancel_restore(&self, op_id: &str) -> Result<()> {
        self.restores.cancel_restore(op_id).await
    }

    /// Looks up a restore operation.
    pub async fn get_restore(&self, op_id: &str) -> Result<RestoreOperation> {
        self.restores.get_restore(op_id).await
    }

    /// Lists a tenant's restore operations.
    pub async fn list_restores(&self, tenant_id: &TenantId) -> Vec<RestoreOperation> {
        self.restores.list_restores(tenant_id).await
    }

    /// The restore orchestrator, for callers that drive approval and
    /// execution as separate steps.
    pub fn restores(&self) -> &RestoreOrchestrator {
        &self.restores
    }
}
