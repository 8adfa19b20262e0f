//! Point-in-time reconstruction from the audit log.
//!
//! State at time T is the post-image stored on the nearest audit record at
//! or before T: one indexed lookup, no replay of diffs from the live row.
//! Each record already carries a full post-mutation snapshot, so a later
//! delete or a missing intermediate record cannot corrupt the answer.
//! `changed_fields` and pre-images exist for display and field-level
//! restore, never for reconstruction correctness.

use crate::error::Result;
use crate::store::{AuditAction, AuditQuery, AuditStore, HistoryPage};
use crate::types::{Document, EntityHandle};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Outcome of a point-in-time query. Always data, never an error: a
/// time-travel query yields a document, "did not exist", or "history
/// unavailable" — it does not crash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "state")]
pub enum Reconstruction {
    /// The entity existed; this is its full state at the requested instant.
    Document(Document),
    /// The entity provably did not exist at the requested instant.
    NotExisted,
    /// History before the requested instant is unavailable (pruned or never
    /// captured); non-existence cannot be proven.
    Unknown,
}

impl Reconstruction {
    /// The document, if the entity existed.
    pub fn document(&self) -> Option<&Document> {
        match self {
            Reconstruction::Document(doc) => Some(doc),
            _ => None,
        }
    }

    /// Whether the entity existed at the queried instant.
    pub fn existed(&self) -> bool {
        matches!(self, Reconstruction::Document(_))
    }
}

/// Read-only reconstructor over the audit log.
#[derive(Clone)]
pub struct Reconstructor {
    store: Arc<dyn AuditStore>,
}

impl Reconstructor {
    /// Creates a reconstructor.
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }

    /// Returns the entity's state at `at`.
    pub async fn reconstruct(
        &self,
        handle: &EntityHandle,
        at: DateTime<Utc>,
    ) -> Result<Reconstruction> {
        if let Some(record) = self.store.latest_at(handle, at).await? {
            // A delete, or a restore that removed the row, has no post-image
            return Ok(match (record.action, record.new_state) {
                (AuditAction::Delete, _) => Reconstruction::NotExisted,
                (_, Some(doc)) => Reconstruction::Document(doc),
                (_, None) => Reconstruction::NotExisted,
            });
        }

        // No record at or before `at`. If history up to `at` may have been
        // pruned, non-existence is unprovable.
        if let Some(horizon) = self.store.retention_horizon().await? {
            if at < horizon {
                return Ok(Reconstruction::Unknown);
            }
        }

        match self.store.earliest(handle).await? {
            // The retained history starts with the row's creation, which is
            // after `at`: the entity did not exist yet.
            Some(earliest) if earliest.action == AuditAction::Insert => {
                Ok(Reconstruction::NotExisted)
            }
            // History starts mid-stream: records before it were lost.
            Some(_) => Ok(Reconstruction::Unknown),
            // No records at all: cannot distinguish "never existed" from
            // "history fully pruned".
            None => Ok(Reconstruction::Unknown),
        }
    }

    /// Ordered, paginated history of one entity.
    pub async fn history(
        &self,
        handle: &EntityHandle,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        offset: usize,
        limit: usize,
    ) -> Result<HistoryPage> {
        let mut query = AuditQuery::tenant(handle.tenant_id.clone())
            .entity_type(handle.entity_type.clone())
            .entity_id(handle.entity_id.clone());
        query.start_time = from;
        query.end_time = to;

        self.store.query(&query, offset, limit).await
    }
}
