//! Backup snapshot metadata.
//!
//! The coordinator tracks what snapshots exist and their lifecycle; actual
//! execution of scheduled automatic and manual backups lives outside the
//! engine. Pre-restore snapshots are the exception: the restore
//! orchestrator must record one before touching any target, carrying the
//! checksum of the rollback payload it captured.

use crate::error::{Result, RewindError};
use crate::types::TenantId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// What triggered a backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    /// Scheduled by the external backup runner.
    Automatic,
    /// Requested by an operator.
    Manual,
    /// Taken by the restore orchestrator before applying a restore.
    PreRestore,
}

/// How much a backup covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupScope {
    /// Everything in the tenant.
    Full,
    /// Changes since the last full backup.
    Incremental,
    /// One entity type.
    Table,
    /// One or more individual records.
    Record,
}

/// Backup lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    InProgress,
    Completed,
    Failed,
}

/// Metadata of one backup snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSnapshot {
    /// Unique snapshot ID.
    pub id: String,
    /// Tenant the snapshot belongs to.
    pub tenant_id: TenantId,
    /// What triggered it.
    pub kind: BackupKind,
    /// What it covers.
    pub scope: BackupScope,
    /// Entity types included.
    pub entity_types: Vec<String>,
    /// Records included.
    pub record_count: u64,
    /// Payload size in bytes.
    pub size_bytes: u64,
    /// SHA-256 of the serialized payload, once completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Lifecycle state.
    pub status: BackupStatus,
    /// Failure message, if failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the snapshot started.
    pub created_at: DateTime<Utc>,
    /// When it completed or failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Tracks backup snapshot metadata through its lifecycle.
#[derive(Clone, Default)]
pub struct BackupCoordinator {
    snapshots: Arc<RwLock<HashMap<String, BackupSnapshot>>>,
}

impl BackupCoordinator {
    /// Creates a coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new snapshot in `InProgress`.
    pub async fn begin(
        &self,
        tenant_id: TenantId,
        kind: BackupKind,
        scope: BackupScope,
        entity_types: Vec<String>,
    ) -> BackupSnapshot {
        let snapshot = BackupSnapshot {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id,
            kind,
            scope,
            entity_types,
            record_count: 0,
            size_bytes: 0,
            checksum: None,
            status: BackupStatus::InProgress,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        };

        info!(snapshot_id = %snapshot.id, ?kind, ?scope, "Began backup snapshot");
        self.snapshots
            .write()
            .await
            .insert(snapshot.id.clone(), snapshot.clone());
        snapshot
    }

    /// Marks a snapshot completed.
    pub async fn complete(
        &self,
        snapshot_id: &str,
        record_count: u64,
        size_bytes: u64,
        checksum: Option<String>,
    ) -> Result<BackupSnapshot> {
        let mut snapshots = self.snapshots.write().await;
        let snapshot = snapshots
            .get_mut(snapshot_id)
            .ok_or_else(|| RewindError::NotFound(format!("backup {}", snapshot_id)))?;

        if snapshot.status != BackupStatus::InProgress {
            return Err(RewindError::InvalidState(format!(
                "Backup {} is not in progress",
                snapshot_id
            )));
        }

        snapshot.status = BackupStatus::Completed;
        snapshot.record_count = record_count;
        snapshot.size_bytes = size_bytes;
        snapshot.checksum = checksum;
        snapshot.completed_at = Some(Utc::now());

        info!(snapshot_id, record_count, size_bytes, "Completed backup snapshot");
        Ok(snapshot.clone())
    }

    /// Marks a snapshot failed.
    pub async fn fail(&self, snapshot_id: &str, error: impl Into<String>) -> Result<BackupSnapshot> {
        let mut snapshots = self.snapshots.write().await;
        let snapshot = snapshots
            .get_mut(snapshot_id)
            .ok_or_else(|| RewindError::NotFound(format!("backup {}", snapshot_id)))?;

        if snapshot.status != BackupStatus::InProgress {
            return Err(RewindError::InvalidState(format!(
                "Backup {} is not in progress",
                snapshot_id
            )));
        }

        let error = error.into();
        warn!(snapshot_id, %error, "Backup snapshot failed");
        snapshot.status = BackupStatus::Failed;
        snapshot.error = Some(error);
        snapshot.completed_at = Some(Utc::now());
        Ok(snapshot.clone())
    }

    /// Looks up a snapshot.
    pub async fn get(&self, snapshot_id: &str) -> Result<BackupSnapshot> {
        self.snapshots
            .read()
            .await
            .get(snapshot_id)
            .cloned()
            .ok_or_else(|| RewindError::NotFound(format!("backup {}", snapshot_id)))
    }

    /// Lists a tenant's snapshots, newest first.
    pub async fn list_for_tenant(&self, tenant_id: &TenantId) -> Vec<BackupSnapshot> {
        let mut snapshots: Vec<BackupSnapshot> = self
            .snapshots
            .read()
            .await
            .values()
            .filter(|s| &s.tenant_id == tenant_id)
            .cloned()
            .collect();
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        snapshots
    }
}

/// SHA-256 checksum of a payload, hex-encoded.
pub fn payload_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
