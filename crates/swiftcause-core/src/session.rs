use crate::error::SwiftCauseError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Fixed set of platform roles. Every session carries exactly one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    SuperAdmin,
    Admin,
    Manager,
    Operator,
    Viewer,
    Kiosk,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SuperAdmin => "super_admin",
            Self::Admin => "admin",
            Self::Manager => "manager",
            Self::Operator => "operator",
            Self::Viewer => "viewer",
            Self::Kiosk => "kiosk",
        }
    }

    pub fn parse(value: &str) -> Result<Self, SwiftCauseError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "super_admin" => Ok(Self::SuperAdmin),
            "admin" => Ok(Self::Admin),
            "manager" => Ok(Self::Manager),
            "operator" => Ok(Self::Operator),
            "viewer" => Ok(Self::Viewer),
            "kiosk" => Ok(Self::Kiosk),
            other => Err(SwiftCauseError::validation(format!(
                "unknown role '{}'",
                other
            ))),
        }
    }
}

/// Authorization context for one kiosk or admin login.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub session_id: String,
    pub principal_id: String,
    pub role: Role,
    pub organization_id: Option<String>,
    /// Campaigns a kiosk may collect for. Empty means every campaign of the organization.
    pub assigned_campaigns: Vec<String>,
    pub started_at: DateTime<Utc>,
}

impl Session {
    pub fn kiosk(
        kiosk_id: impl Into<String>,
        organization_id: Option<String>,
        assigned_campaigns: Vec<String>,
    ) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            principal_id: kiosk_id.into(),
            role: Role::Kiosk,
            organization_id,
            assigned_campaigns,
            started_at: Utc::now(),
        }
    }

    pub fn admin(user_id: impl Into<String>, role: Role, organization_id: Option<String>) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            principal_id: user_id.into(),
            role,
            organization_id,
            assigned_campaigns: Vec::new(),
            started_at: Utc::now(),
        }
    }

    pub fn is_kiosk(&self) -> bool {
        self.role == Role::Kiosk
    }

    pub fn kiosk_id(&self) -> Option<&str> {
        self.is_kiosk().then_some(self.principal_id.as_str())
    }
}

/// Verified bearer identity presented to backend handlers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Caller {
    pub uid: String,
    pub email: Option<String>,
    pub organization_id: Option<String>,
    pub role: Option<Role>,
}

impl Caller {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            email: None,
            organization_id: None,
            role: None,
        }
    }

    pub fn with_organization(mut self, organization_id: impl Into<String>) -> Self {
        self.organization_id = Some(organization_id.into());
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

/// Tracks live sessions between login and logout.
///
/// Sessions are handed to checkouts and handlers explicitly; this registry only
/// answers whether a session id is still live.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn open(&self, session: Session) -> Session {
        let mut sessions = self.sessions.write().await;
        sessions.insert(session.session_id.clone(), session.clone());
        tracing::debug!(
            session_id = %session.session_id,
            role = session.role.as_str(),
            "session opened"
        );
        session
    }

    pub async fn get(&self, session_id: &str) -> Result<Session, SwiftCauseError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| SwiftCauseError::Unauthorized(format!("session '{}' is not active", session_id)))
    }

    pub async fn close(&self, session_id: &str) -> bool {
        let removed = self.sessions.write().await.remove(session_id).is_some();
        if removed {
            tracing::debug!(session_id, "session closed");
        }
        removed
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
