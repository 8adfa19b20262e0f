//! Error types for the Rewind audit engine.
//!
//! This module provides a unified error type [`RewindError`] for all Rewind
//! operations, along with a convenient [`Result`] type alias.
//!
//! Note that reconstruction ambiguity is *not* an error: the reconstructor
//! returns [`crate::reconstruct::Reconstruction`] values, and a skipped
//! capture returns [`crate::capture::CaptureOutcome::Skipped`]. Only
//! conditions that must abort the caller surface here.

use thiserror::Error;

/// Main error type for Rewind operations.
#[derive(Error, Debug)]
pub enum RewindError {
    // Capture errors
    #[error("Audit capture failed: {0}")]
    CaptureFailed(String),

    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // Lookup errors
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Entity type not registered: {0}")]
    EntityNotRegistered(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    // Restore workflow errors
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Approval required for {0} restores")]
    ApprovalRequired(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RewindError {
    /// Check if the error is fatal to an enclosing mutation.
    ///
    /// A capture or storage failure must abort the unit of work that
    /// triggered it, since a mutation without its audit record violates
    /// the gapless-history invariant.
    pub fn aborts_mutation(&self) -> bool {
        matches!(
            self,
            RewindError::CaptureFailed(_) | RewindError::Storage(_)
        )
    }
}

impl From<serde_json::Error> for RewindError {
    fn from(e: serde_json::Error) -> Self {
        RewindError::Serialization(e.to_string())
    }
}

/// Result type alias for Rewind operations.
pub type Result<T> = std::result::Result<T, RewindError>;
