//! Append-only audit log store.
//!
//! Every mutation of a registered entity lands here as exactly one
//! [`AuditRecord`]. Records are immutable once appended and ordered per
//! entity handle by `created_at` with the store-assigned insertion sequence
//! as tiebreak. The store exposes no update or delete API; the only way
//! history shrinks is operational pruning, which records a retention
//! horizon so readers can tell pruned history apart from history that
//! never existed.

use crate::error::{Result, RewindError};
use crate::types::{Document, EntityHandle, EntityId, TenantId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Kind of mutation an audit record captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Row created.
    Insert,
    /// Row updated.
    Update,
    /// Row deleted.
    Delete,
    /// Row overwritten by an administrative restore.
    Restore,
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Insert => write!(f, "insert"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
            Self::Restore => write!(f, "restore"),
        }
    }
}

/// One immutable audit log entry: a single mutation's pre/post state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Unique record ID.
    pub id: String,
    /// Tenant the mutated entity belongs to.
    pub tenant_id: TenantId,
    /// Registered entity type.
    pub entity_type: String,
    /// Primary key of the mutated row.
    pub entity_id: EntityId,
    /// Kind of mutation.
    pub action: AuditAction,
    /// Acting user or service account.
    pub actor_id: String,
    /// Actor email for display.
    pub actor_email: String,
    /// Actor session, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Full row image before the mutation (None for inserts).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_state: Option<Document>,
    /// Full row image after the mutation (None for deletes).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_state: Option<Document>,
    /// Exactly the keys whose value differs between old and new state.
    pub changed_fields: Vec<String>,
    /// Source IP.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// Client user agent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Free-form application context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_context: Option<String>,
    /// Mutation timestamp.
    pub created_at: DateTime<Utc>,
    /// Store-assigned insertion sequence; ordering tiebreak within a timestamp.
    pub seq: u64,
}

impl AuditRecord {
    /// Handle of the entity this record belongs to.
    pub fn handle(&self) -> EntityHandle {
        EntityHandle::new(
            self.tenant_id.clone(),
            self.entity_type.clone(),
            self.entity_id.clone(),
        )
    }

    /// Ordering key: timestamp, then insertion sequence.
    pub fn order_key(&self) -> (DateTime<Utc>, u64) {
        (self.created_at, self.seq)
    }
}

/// Filter for audit log range queries.
///
/// Queries are keyed by the index patterns the engine needs:
/// (tenant, type, id, time), (tenant, actor, time), (tenant, session),
/// (tenant, action, time).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditQuery {
    /// Tenant scope; every query is tenant-bound.
    pub tenant_id: TenantId,
    /// Entity type filter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    /// Entity ID filter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<EntityId>,
    /// Actor filter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    /// Session filter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Action filter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<AuditAction>,
    /// Inclusive start of the time range.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    /// Inclusive end of the time range.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

impl AuditQuery {
    /// Creates a query scoped to a tenant.
    pub fn tenant(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            entity_type: None,
            entity_id: None,
            actor_id: None,
            session_id: None,
            action: None,
            start_time: None,
            end_time: None,
        }
    }

    /// Filters by entity type.
    pub fn entity_type(mut self, entity_type: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self
    }

    /// Filters by entity ID.
    pub fn entity_id(mut self, entity_id: EntityId) -> Self {
        self.entity_id = Some(entity_id);
        self
    }

    /// Filters by actor.
    pub fn actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    /// Filters by session.
    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Filters by action.
    pub fn action(mut self, action: AuditAction) -> Self {
        self.action = Some(action);
        self
    }

    /// Filters by time range.
    pub fn time_range(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self.end_time = Some(end);
        self
    }

    /// Checks whether a record matches this query.
    pub fn matches(&self, record: &AuditRecord) -> bool {
        if record.tenant_id != self.tenant_id {
            return false;
        }
        if let Some(ref t) = self.entity_type {
            if &record.entity_type != t {
                return false;
            }
        }
        if let Some(ref id) = self.entity_id {
            if &record.entity_id != id {
                return false;
            }
        }
        if let Some(ref actor) = self.actor_id {
            if &record.actor_id != actor {
                return false;
            }
        }
        if let Some(ref session) = self.session_id {
            if record.session_id.as_ref() != Some(session) {
                return false;
            }
        }
        if let Some(action) = self.action {
            if record.action != action {
                return false;
            }
        }
        if let Some(start) = self.start_time {
            if record.created_at < start {
                return false;
            }
        }
        if let Some(end) = self.end_time {
            if record.created_at > end {
                return false;
            }
        }
        true
    }
}

/// One page of history results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPage {
    /// Records in ascending (created_at, seq) order.
    pub records: Vec<AuditRecord>,
    /// Offset of the next page, if more records exist.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_offset: Option<usize>,
    /// Total records matching the query.
    pub total: usize,
}

/// Storage trait for the append-only audit log.
#[async_trait::async_trait]
pub trait AuditStore: Send + Sync {
    /// Appends a record, assigning its insertion sequence.
    /// Returns the record as stored.
    async fn append(&self, record: AuditRecord) -> Result<AuditRecord>;

    /// All records for one entity handle, ascending.
    async fn records_for(&self, handle: &EntityHandle) -> Result<Vec<AuditRecord>>;

    /// Latest record for a handle with `created_at <= at`.
    async fn latest_at(
        &self,
        handle: &EntityHandle,
        at: DateTime<Utc>,
    ) -> Result<Option<AuditRecord>>;

    /// Earliest retained record for a handle.
    async fn earliest(&self, handle: &EntityHandle) -> Result<Option<AuditRecord>>;

    /// Records matching a query, ascending, paginated.
    async fn query(&self, query: &AuditQuery, offset: usize, limit: usize) -> Result<HistoryPage>;

    /// Distinct entity handles a query's records touch.
    async fn handles_matching(&self, query: &AuditQuery) -> Result<Vec<EntityHandle>>;

    /// Prunes records older than `before`, advancing the retention horizon.
    /// Returns the number of records removed.
    async fn prune(&self, before: DateTime<Utc>) -> Result<u64>;

    /// The retention horizon: history strictly before this instant may have
    /// been pruned. `None` means the log has never been pruned.
    async fn retention_horizon(&self) -> Result<Option<DateTime<Utc>>>;
}

#[derive(Default)]
struct MemoryStoreInner {
    by_handle: BTreeMap<String, Vec<AuditRecord>>,
    pruned_before: Option<DateTime<Utc>>,
}

/// In-memory audit store.
///
/// Per-handle vectors are kept in ascending (created_at, seq) order with
/// sorted insertion, so late-arriving timestamps still land in order.
pub struct MemoryAuditStore {
    inner: RwLock<MemoryStoreInner>,
    sequence: AtomicU64,
}

impl MemoryAuditStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryStoreInner::default()),
            sequence: AtomicU64::new(0),
        }
    }

    fn handle_key(handle: &EntityHandle) -> String {
        handle.to_string()
    }

    fn collect_matching(inner: &MemoryStoreInner, query: &AuditQuery) -> Vec<AuditRecord> {
        let mut matched: Vec<AuditRecord> = inner
            .by_handle
            .values()
            .flatten()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        matched.sort_by_key(|r| r.order_key());
        matched
    }
}

impl Default for MemoryAuditStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl AuditStore for MemoryAuditStore {
    async fn append(&self, mut record: AuditRecord) -> Result<AuditRecord> {
        record.seq = self.sequence.fetch_add(1, Ordering::SeqCst);

        let mut inner = self.inner.write().await;
        let key = Self::handle_key(&record.handle());
        let records = inner.by_handle.entry(key).or_default();

        // Sorted insert keeps ascending order even for backdated timestamps
        let pos = records
            .iter()
            .position(|r| r.order_key() > record.order_key())
            .unwrap_or(records.len());
        records.insert(pos, record.clone());

        debug!(
            record_id = %record.id,
            entity = %record.handle(),
            action = %record.action,
            "Appended audit record"
        );
        Ok(record)
    }

    async fn records_for(&self, handle: &EntityHandle) -> Result<Vec<AuditRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_handle
            .get(&Self::handle_key(handle))
            .cloned()
            .unwrap_or_default())
    }

    async fn latest_at(
        &self,
        handle: &EntityHandle,
        at: DateTime<Utc>,
    ) -> Result<Option<AuditRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_handle
            .get(&Self::handle_key(handle))
            .and_then(|records| records.iter().rev().find(|r| r.created_at <= at).cloned()))
    }

    async fn earliest(&self, handle: &EntityHandle) -> Result<Option<AuditRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_handle
            .get(&Self::handle_key(handle))
            .and_then(|records| records.first().cloned()))
    }

    async fn query(&self, query: &AuditQuery, offset: usize, limit: usize) -> Result<HistoryPage> {
        if limit == 0 {
            return Err(RewindError::Validation("limit must be non-zero".into()));
        }

        let inner = self.inner.read().await;
        let matched = Self::collect_matching(&inner, query);
        let total = matched.len();

        let records: Vec<AuditRecord> = matched.into_iter().skip(offset).take(limit).collect();
        let consumed = offset + records.len();
        let next_offset = (consumed < total).then_some(consumed);

        Ok(HistoryPage {
            records,
            next_offset,
            total,
        })
    }

    async fn handles_matching(&self, query: &AuditQuery) -> Result<Vec<EntityHandle>> {
        let inner = self.inner.read().await;
        let mut handles = Vec::new();
        for records in inner.by_handle.values() {
            if let Some(first) = records.iter().find(|r| query.matches(r)) {
                handles.push(first.handle());
            }
        }
        Ok(handles)
    }

    async fn prune(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let mut pruned = 0u64;

        for records in inner.by_handle.values_mut() {
            let original = records.len();
            records.retain(|r| r.created_at >= before);
            pruned += (original - records.len()) as u64;
        }
        inner.by_handle.retain(|_, records| !records.is_empty());

        // The horizon only ever advances
        inner.pruned_before = Some(match inner.pruned_before {
            Some(existing) if existing > before => existing,
            _ => before,
        });

        info!(pruned, %before, "Pruned audit records");
        Ok(pruned)
    }

    async fn retention_horizon(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.inner.read().await.pruned_before)
    }
}
