//! Core identifier and document types shared across the engine.

use crate::error::{Result, RewindError};
use serde::{Deserialize, Serialize};

/// Minimum length for tenant ID.
pub const TENANT_ID_MIN_LENGTH: usize = 1;

/// Maximum length for tenant ID (DNS subdomain label limit).
pub const TENANT_ID_MAX_LENGTH: usize = 63;

/// Reserved tenant ID prefix for system use.
const SYSTEM_PREFIX: &str = "__";

/// Unique tenant identifier.
///
/// Tenant IDs must:
/// - Be 1-63 characters long
/// - Contain only lowercase alphanumeric characters and hyphens
/// - Not start or end with a hyphen
/// - Not contain consecutive hyphens
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantId(pub String);

impl TenantId {
    /// Creates a new tenant ID without validation.
    ///
    /// # Warning
    /// This method does not validate the tenant ID format.
    /// Use `try_new` for user-provided input.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Creates a new tenant ID with validation.
    pub fn try_new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        Self::validate_format(&id)?;
        Ok(Self(id))
    }

    /// Validates a tenant ID format.
    pub fn validate_format(id: &str) -> Result<()> {
        if id.len() < TENANT_ID_MIN_LENGTH {
            return Err(RewindError::Validation(
                "Tenant ID cannot be empty".to_string(),
            ));
        }

        if id.len() > TENANT_ID_MAX_LENGTH {
            return Err(RewindError::Validation(format!(
                "Tenant ID exceeds maximum length of {} characters",
                TENANT_ID_MAX_LENGTH
            )));
        }

        // System prefixed IDs are internal use only
        if id.starts_with(SYSTEM_PREFIX) {
            return Ok(());
        }

        if !id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(RewindError::Validation(
                "Tenant ID must contain only lowercase letters, numbers, and hyphens".to_string(),
            ));
        }

        if id.starts_with('-') || id.ends_with('-') {
            return Err(RewindError::Validation(
                "Tenant ID cannot start or end with a hyphen".to_string(),
            ));
        }

        if id.contains("--") {
            return Err(RewindError::Validation(
                "Tenant ID cannot contain consecutive hyphens".to_string(),
            ));
        }

        Ok(())
    }

    /// Checks if this tenant ID has a valid format.
    pub fn is_valid(&self) -> bool {
        Self::validate_format(&self.0).is_ok()
    }

    /// Returns the tenant ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Primary key of a tracked entity.
///
/// Collaborator schemas key their rows differently; the engine only needs a
/// stable, hashable identity per row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityId {
    /// UUID or other opaque string key.
    Text(String),
    /// Integer key.
    Int(i64),
}

impl EntityId {
    /// Creates a text entity ID.
    pub fn text(id: impl Into<String>) -> Self {
        Self::Text(id.into())
    }

    /// Creates an integer entity ID.
    pub fn int(id: i64) -> Self {
        Self::Int(id)
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityId::Text(s) => write!(f, "{}", s),
            EntityId::Int(i) => write!(f, "{}", i),
        }
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        EntityId::Text(s.to_string())
    }
}

impl From<i64> for EntityId {
    fn from(i: i64) -> Self {
        EntityId::Int(i)
    }
}

/// Fully qualified handle of one tenant-scoped entity row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityHandle {
    /// Tenant the entity belongs to.
    pub tenant_id: TenantId,
    /// Registered entity type name.
    pub entity_type: String,
    /// Primary key.
    pub entity_id: EntityId,
}

impl EntityHandle {
    /// Creates a new entity handle.
    pub fn new(tenant_id: TenantId, entity_type: impl Into<String>, entity_id: EntityId) -> Self {
        Self {
            tenant_id,
            entity_type: entity_type.into(),
            entity_id,
        }
    }
}

impl std::fmt::Display for EntityHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.tenant_id, self.entity_type, self.entity_id
        )
    }
}

/// A full row image: flat field map as stored by collaborator schemas.
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Builds a [`Document`] from key/value pairs. Test and fixture helper.
pub fn document(fields: &[(&str, serde_json::Value)]) -> Document {
    fields
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}
