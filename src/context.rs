//! Ambient actor context for write paths.
//!
//! The authentication layer resolves who is acting and hands the engine an
//! [`ActorContext`] for the duration of a unit of work. The engine reads it;
//! it never computes or mutates it. The context is threaded explicitly
//! through every write path rather than stashed in task-local or global
//! state, so each capture names its actor unambiguously.

use crate::types::TenantId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who is performing the current unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorContext {
    /// Actor (user or service account) ID.
    pub actor_id: String,
    /// Actor email, for display in audit trails.
    pub actor_email: String,
    /// Active session ID, if the actor has one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Tenant the actor is operating in, if resolvable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<TenantId>,
    /// Source IP address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// Client user agent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Free-form application context (page, feature, batch job name).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_context: Option<String>,
    /// When this context was established.
    pub established_at: DateTime<Utc>,
}

impl ActorContext {
    /// Creates a new actor context.
    pub fn new(actor_id: impl Into<String>, actor_email: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            actor_email: actor_email.into(),
            session_id: None,
            tenant_id: None,
            ip: None,
            user_agent: None,
            app_context: None,
            established_at: Utc::now(),
        }
    }

    /// Creates a system actor context for engine-internal writes.
    pub fn system() -> Self {
        Self::new("system", "system@internal")
    }

    /// Sets the tenant.
    pub fn with_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    /// Sets the session ID.
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Sets the source IP.
    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    /// Sets the user agent.
    pub fn with_user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }

    /// Sets the application context.
    pub fn with_app_context(mut self, ctx: impl Into<String>) -> Self {
        self.app_context = Some(ctx.into());
        self
    }
}
