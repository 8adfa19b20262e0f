//! Configuration for the Rewind engine.

use crate::error::{Result, RewindError};
use serde::{Deserialize, Serialize};

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewindConfig {
    /// Whether field-scope restores need an approver.
    /// Session, time-point and bulk restores always do.
    pub approval_required_for_field: bool,
    /// Whether record-scope restores need an approver.
    pub approval_required_for_record: bool,
    /// Audit history retention period in days. Pruning itself is an
    /// operational action; this is the policy the operator applies.
    pub retention_days: u32,
    /// Minutes of inactivity before a session is closed by the sweep.
    pub session_idle_timeout_minutes: u32,
    /// Default page size for history queries.
    pub history_page_size: usize,
}

impl Default for RewindConfig {
    fn default() -> Self {
        Self {
            approval_required_for_field: false,
            approval_required_for_record: false,
            retention_days: 90,
            session_idle_timeout_minutes: 30,
            history_page_size: 100,
        }
    }
}

impl RewindConfig {
    /// Configuration for development (short retention, no approvals).
    pub fn development() -> Self {
        Self {
            approval_required_for_field: false,
            approval_required_for_record: false,
            retention_days: 30,
            session_idle_timeout_minutes: 120,
            history_page_size: 100,
        }
    }

    /// Configuration for compliance (long retention, approvals everywhere).
    pub fn compliance() -> Self {
        Self {
            approval_required_for_field: true,
            approval_required_for_record: true,
            retention_days: 2555, // 7 years
            session_idle_timeout_minutes: 15,
            history_page_size: 100,
        }
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.retention_days == 0 {
            return Err(RewindError::InvalidConfig {
                field: "retention_days".to_string(),
                reason: "Retention must be at least one day".to_string(),
            });
        }
        if self.history_page_size == 0 {
            return Err(RewindError::InvalidConfig {
                field: "history_page_size".to_string(),
                reason: "Page size must be non-zero".to_string(),
            });
        }
        if self.session_idle_timeout_minutes == 0 {
            return Err(RewindError::InvalidConfig {
                field: "session_idle_timeout_minutes".to_string(),
                reason: "Idle timeout must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        assert!(RewindConfig::default().validate().is_ok());
        assert!(RewindConfig::development().validate().is_ok());
        assert!(RewindConfig::compliance().validate().is_ok());
    }

    #[test]
    fn test_compliance_requires_approvals() {
        let config = RewindConfig::compliance();
        assert!(config.approval_required_for_field);
        assert!(config.approval_required_for_record);
        assert_eq!(config.retention_days, 2555);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = RewindConfig {
            retention_days: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RewindConfig {
            history_page_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
