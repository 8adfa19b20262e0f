//! Actor session tracking.
//!
//! A session is one bounded sequence of a single actor's actions. Change
//! capture reports every recorded mutation here; the tracker is the sole
//! mutator of the session's running counters and touched-entity set, which
//! later drive session-scoped restores.

use crate::context::ActorContext;
use crate::error::{Result, RewindError};
use crate::types::TenantId;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// One actor session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSession {
    /// Unique session ID.
    pub id: String,
    /// Tenant the session operates in.
    pub tenant_id: TenantId,
    /// Actor the session belongs to.
    pub user_id: String,
    /// Session start.
    pub started_at: DateTime<Utc>,
    /// Session end, once closed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Number of audited changes made in this session.
    pub total_changes: u64,
    /// Entity types this session has touched.
    pub touched_entity_types: BTreeSet<String>,
    /// Last time capture reported a change.
    pub last_activity: DateTime<Utc>,
}

impl UserSession {
    /// Whether the session is still open.
    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// Tracks active and closed sessions.
#[derive(Clone)]
pub struct SessionTracker {
    sessions: Arc<RwLock<HashMap<String, UserSession>>>,
    idle_timeout: Duration,
}

impl SessionTracker {
    /// Creates a tracker with the given idle timeout.
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            idle_timeout,
        }
    }

    /// Starts a session from the ambient actor context.
    ///
    /// The context must carry a resolved tenant; sessions are always
    /// tenant-bound.
    pub async fn start_session(&self, ctx: &ActorContext) -> Result<UserSession> {
        let tenant_id = ctx
            .tenant_id
            .clone()
            .ok_or_else(|| RewindError::Validation("session requires a tenant".into()))?;
        TenantId::validate_format(tenant_id.as_str())?;

        let now = Utc::now();
        let session = UserSession {
            id: ctx
                .session_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            tenant_id,
            user_id: ctx.actor_id.clone(),
            started_at: now,
            ended_at: None,
            total_changes: 0,
            touched_entity_types: BTreeSet::new(),
            last_activity: now,
        };

        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(&session.id) {
            if existing.is_active() {
                return Err(RewindError::Conflict(format!(
                    "Session {} is already active",
                    session.id
                )));
            }
        }

        info!(session_id = %session.id, user = %session.user_id, "Started session");
        sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    /// Closes a session.
    pub async fn end_session(&self, session_id: &str) -> Result<UserSession> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| RewindError::SessionNotFound(session_id.to_string()))?;

        if session.ended_at.is_none() {
            session.ended_at = Some(Utc::now());
            info!(
                session_id,
                total_changes = session.total_changes,
                "Ended session"
            );
        }
        Ok(session.clone())
    }

    /// Records one audited change against an active session.
    ///
    /// Unknown session IDs are tolerated: capture may observe a session the
    /// tracker never saw (actor authenticated elsewhere), and a missing
    /// counter must not abort the mutation.
    pub async fn record_change(&self, session_id: &str, entity_type: &str) {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(session_id) {
            Some(session) if session.is_active() => {
                session.total_changes += 1;
                session.touched_entity_types.insert(entity_type.to_string());
                session.last_activity = Utc::now();
            }
            Some(_) => {
                warn!(session_id, "Change reported against closed session");
            }
            None => {
                debug!(session_id, "Change reported against untracked session");
            }
        }
    }

    /// Looks up a session.
    pub async fn get(&self, session_id: &str) -> Result<UserSession> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| RewindError::SessionNotFound(session_id.to_string()))
    }

    /// Lists sessions for a tenant, active first, newest first within each.
    pub async fn list_for_tenant(&self, tenant_id: &TenantId) -> Vec<UserSession> {
        let mut sessions: Vec<UserSession> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| &s.tenant_id == tenant_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| {
            b.is_active()
                .cmp(&a.is_active())
                .then(b.started_at.cmp(&a.started_at))
        });
        sessions
    }

    /// Closes sessions idle past the timeout. Returns the number closed.
    pub async fn sweep_idle(&self) -> u64 {
        let cutoff = Utc::now() - self.idle_timeout;
        let mut sessions = self.sessions.write().await;
        let mut closed = 0u64;

        for session in sessions.values_mut() {
            if session.is_active() && session.last_activity < cutoff {
                session.ended_at = Some(Utc::now());
                closed += 1;
                debug!(session_id = %session.id, "Closed idle session");
            }
        }

        if closed > 0 {
            info!(closed, "Swept idle sessions");
        }
        closed
    }
}
