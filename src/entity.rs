//! Live entity data and the audited mutation path.
//!
//! The engine does not own collaborator schemas; it sees live rows through
//! the [`EntityStore`] seam. [`AuditedStore`] is the mutation entry point
//! collaborators call: it applies the row change and captures its audit
//! record as one atomic unit — if capture fails, the row change is rolled
//! back and the error propagates, so an audited mutation never commits
//! without its record.

use crate::capture::{ChangeCapture, CaptureOutcome};
use crate::context::ActorContext;
use crate::error::{Result, RewindError};
use crate::registry::EntityRegistry;
use crate::types::{Document, EntityHandle, EntityId, TenantId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Storage seam for live entity rows.
#[async_trait::async_trait]
pub trait EntityStore: Send + Sync {
    /// Current row for a handle.
    async fn get(&self, handle: &EntityHandle) -> Result<Option<Document>>;

    /// Writes (inserts or replaces) a row.
    async fn put(&self, handle: &EntityHandle, doc: Document) -> Result<()>;

    /// Removes a row, returning its last value.
    async fn remove(&self, handle: &EntityHandle) -> Result<Option<Document>>;

    /// IDs of all live rows of one type in one tenant.
    async fn list_ids(&self, tenant_id: &TenantId, entity_type: &str) -> Result<Vec<EntityId>>;
}

/// In-memory live entity store.
#[derive(Default)]
pub struct MemoryEntityStore {
    rows: RwLock<HashMap<EntityHandle, Document>>,
}

impl MemoryEntityStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl EntityStore for MemoryEntityStore {
    async fn get(&self, handle: &EntityHandle) -> Result<Option<Document>> {
        Ok(self.rows.read().await.get(handle).cloned())
    }

    async fn put(&self, handle: &EntityHandle, doc: Document) -> Result<()> {
        self.rows.write().await.insert(handle.clone(), doc);
        Ok(())
    }

    async fn remove(&self, handle: &EntityHandle) -> Result<Option<Document>> {
        Ok(self.rows.write().await.remove(handle))
    }

    async fn list_ids(&self, tenant_id: &TenantId, entity_type: &str) -> Result<Vec<EntityId>> {
        let rows = self.rows.read().await;
        let mut ids: Vec<EntityId> = rows
            .keys()
            .filter(|h| &h.tenant_id == tenant_id && h.entity_type == entity_type)
            .map(|h| h.entity_id.clone())
            .collect();
        ids.sort_by_key(|id| id.to_string());
        Ok(ids)
    }
}

/// Mutation entry point: live row change + audit capture, atomically.
#[derive(Clone)]
pub struct AuditedStore {
    entities: Arc<dyn EntityStore>,
    capture: Arc<ChangeCapture>,
    registry: EntityRegistry,
}

impl AuditedStore {
    /// Creates an audited store over a live entity store.
    pub fn new(
        entities: Arc<dyn EntityStore>,
        capture: Arc<ChangeCapture>,
        registry: EntityRegistry,
    ) -> Self {
        Self {
            entities,
            capture,
            registry,
        }
    }

    /// The underlying live store.
    pub fn entities(&self) -> &Arc<dyn EntityStore> {
        &self.entities
    }

    async fn handle_for(
        &self,
        entity_type: &str,
        row: &Document,
        ctx: &ActorContext,
    ) -> Result<EntityHandle> {
        let descriptor = self.registry.get(entity_type).await?;
        let entity_id = crate::capture::extract_key(&descriptor, Some(row), None)?;
        let tenant_id = crate::capture::resolve_tenant(&descriptor, Some(row), None, ctx)
            .ok_or_else(|| {
                RewindError::Validation(format!(
                    "Cannot resolve tenant for {} mutation",
                    entity_type
                ))
            })?;
        Ok(EntityHandle::new(tenant_id, entity_type, entity_id))
    }

    /// Inserts a row and captures it.
    pub async fn insert(
        &self,
        entity_type: &str,
        row: Document,
        ctx: &ActorContext,
    ) -> Result<CaptureOutcome> {
        let handle = self.handle_for(entity_type, &row, ctx).await?;

        if self.entities.get(&handle).await?.is_some() {
            return Err(RewindError::Conflict(format!(
                "Entity {} already exists",
                handle
            )));
        }

        self.entities.put(&handle, row.clone()).await?;
        match self.capture.capture_insert(entity_type, &row, ctx).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                // Abort the unit of work: undo the live write
                self.entities.remove(&handle).await?;
                Err(e)
            }
        }
    }

    /// Updates a row and captures the diff.
    pub async fn update(
        &self,
        entity_type: &str,
        row: Document,
        ctx: &ActorContext,
    ) -> Result<CaptureOutcome> {
        let handle = self.handle_for(entity_type, &row, ctx).await?;

        let old = self
            .entities
            .get(&handle)
            .await?
            .ok_or_else(|| RewindError::NotFound(handle.to_string()))?;

        self.entities.put(&handle, row.clone()).await?;
        match self.capture.capture_update(entity_type, &old, &row, ctx).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.entities.put(&handle, old).await?;
                Err(e)
            }
        }
    }

    /// Deletes a row and captures its last state.
    pub async fn delete(
        &self,
        entity_type: &str,
        entity_id: EntityId,
        ctx: &ActorContext,
    ) -> Result<CaptureOutcome> {
        let tenant_id = ctx
            .tenant_id
            .clone()
            .ok_or_else(|| RewindError::Validation("delete requires a tenant context".into()))?;
        let handle = EntityHandle::new(tenant_id, entity_type, entity_id);

        let old = self
            .entities
            .remove(&handle)
            .await?
            .ok_or_else(|| RewindError::NotFound(handle.to_string()))?;

        match self.capture.capture_delete(entity_type, &old, ctx).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.entities.put(&handle, old).await?;
                Err(e)
            }
        }
    }

    /// Reads the live row for a handle.
    pub async fn get(&self, handle: &EntityHandle) -> Result<Option<Document>> {
        self.entities.get(handle).await
    }
}
