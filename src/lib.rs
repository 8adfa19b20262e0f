//! Rewind: tenant-scoped audit trail, time travel and restore.
//!
//! Rewind records every mutation of registered entity types as an immutable
//! audit record carrying full before/after row images, reconstructs any
//! entity's state at any past instant from those records, and drives
//! approval-gated restores that write history back onto live data. Restores
//! are themselves audited, so the trail never has gaps.
//!
//! # Example
//!
//! ```no_run
//! use rewind::{
//!     ActorContext, EntityDescriptor, EntityHandle, Rewind, RewindConfig, TenantId,
//! };
//! use serde_json::json;
//!
//! # async fn example() -> rewind::Result<()> {
//! let engine = Rewind::new(RewindConfig::default())?;
//! engine
//!     .register_entity(EntityDescriptor::new("requirements", "organization_id"))
//!     .await;
//!
//! let ctx = ActorContext::new("u1", "alice@acme.test").with_tenant(TenantId::new("acme"));
//! let row = rewind::document(&[
//!     ("id", json!("r1")),
//!     ("organization_id", json!("acme")),
//!     ("name", json!("Access control policy")),
//! ]);
//! engine.data().insert("requirements", row, &ctx).await?;
//!
//! let handle = EntityHandle::new(TenantId::new("acme"), "requirements", "r1".into());
//! let state = engine.reconstruct(&handle, chrono::Utc::now()).await?;
//! assert!(state.existed());
//! # Ok(())
//! # }
//! ```

pub mod backup;
pub mod capture;
pub mod config;
pub mod context;
pub mod engine;
pub mod entity;
pub mod error;
pub mod reconstruct;
pub mod registry;
pub mod restore;
pub mod session;
pub mod store;
pub mod types;

pub use backup::{BackupCoordinator, BackupKind, BackupScope, BackupSnapshot, BackupStatus};
pub use capture::{CaptureOutcome, CaptureStatsSnapshot, ChangeCapture, SkipReason};
pub use config::RewindConfig;
pub use context::ActorContext;
pub use engine::Rewind;
pub use entity::{AuditedStore, EntityStore, MemoryEntityStore};
pub use error::{Result, RewindError};
pub use reconstruct::{Reconstruction, Reconstructor};
pub use registry::{EntityDescriptor, EntityRegistry, KeyKind, TenantSource};
pub use restore::{
    RestoreOperation, RestoreOrchestrator, RestoreScope, RestoreStatus, TargetOutcome,
    TargetResult,
};
pub use session::{SessionTracker, UserSession};
pub use store::{
    AuditAction, AuditQuery, AuditRecord, AuditStore, HistoryPage, MemoryAuditStore,
};
pub use types::{document, Document, EntityHandle, EntityId, TenantId};
