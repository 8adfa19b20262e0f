//! Registry of tracked entity types.
//!
//! Collaborator subsystems register each table they want audited as an
//! explicit [`EntityDescriptor`]: the type name, where its tenant comes
//! from, and what its primary key looks like. Change capture refuses rows
//! of unregistered types, so the set of audited schemas is always explicit.

use crate::error::{Result, RewindError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Where a registered entity's tenant ID comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantSource {
    /// Read the tenant from the named column of the row.
    Column(String),
    /// The schema carries no tenant column; use the ambient session tenant.
    Ambient,
}

/// Shape of a registered entity's primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    /// UUID or other opaque text key.
    Text,
    /// Integer key.
    Int,
}

/// Descriptor of one tracked entity type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityDescriptor {
    /// Entity type name (table name in the collaborator schema).
    pub entity_type: String,
    /// Tenant resolution for rows of this type.
    pub tenant_source: TenantSource,
    /// Primary key column name.
    pub key_column: String,
    /// Primary key shape.
    pub key_kind: KeyKind,
}

impl EntityDescriptor {
    /// Creates a descriptor for a tenant-column entity with a text key.
    pub fn new(entity_type: impl Into<String>, tenant_column: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            tenant_source: TenantSource::Column(tenant_column.into()),
            key_column: "id".to_string(),
            key_kind: KeyKind::Text,
        }
    }

    /// Creates a descriptor for an entity without a tenant column.
    pub fn ambient_tenant(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            tenant_source: TenantSource::Ambient,
            key_column: "id".to_string(),
            key_kind: KeyKind::Text,
        }
    }

    /// Sets the key column.
    pub fn with_key_column(mut self, column: impl Into<String>) -> Self {
        self.key_column = column.into();
        self
    }

    /// Sets the key kind.
    pub fn with_key_kind(mut self, kind: KeyKind) -> Self {
        self.key_kind = kind;
        self
    }
}

/// Registry of entity descriptors.
#[derive(Clone, Default)]
pub struct EntityRegistry {
    descriptors: Arc<RwLock<HashMap<String, EntityDescriptor>>>,
}

impl EntityRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an entity type. Re-registering replaces the descriptor.
    pub async fn register(&self, descriptor: EntityDescriptor) {
        info!(entity_type = %descriptor.entity_type, "Registered entity type");
        self.descriptors
            .write()
            .await
            .insert(descriptor.entity_type.clone(), descriptor);
    }

    /// Looks up a descriptor by type name.
    pub async fn get(&self, entity_type: &str) -> Result<EntityDescriptor> {
        self.descriptors
            .read()
            .await
            .get(entity_type)
            .cloned()
            .ok_or_else(|| RewindError::EntityNotRegistered(entity_type.to_string()))
    }

    /// Checks whether a type is registered.
    pub async fn contains(&self, entity_type: &str) -> bool {
        self.descriptors.read().await.contains_key(entity_type)
    }

    /// Lists all registered type names.
    pub async fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.descriptors.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Removes an entity type from the registry.
    pub async fn unregister(&self, entity_type: &str) -> bool {
        let removed = self.descriptors.write().await.remove(entity_type).is_some();
        if removed {
            debug!(entity_type, "Unregistered entity type");
        }
        removed
    }
}
