use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// The identity currently recognised by the provider.
///
/// Values are produced by the provider and pushed through the session
/// observer; application code never edits one in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Opaque provider identifier
    pub uid: String,

    pub email: String,

    pub display_name: Option<String>,

    pub photo_url: Option<String>,

    /// Whether the address has been confirmed through the verification email
    pub email_verified: bool,
}

impl Session {
    pub fn new(uid: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            email: email.into(),
            display_name: None,
            photo_url: None,
            email_verified: false,
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    pub fn verified(mut self) -> Self {
        self.email_verified = true;
        self
    }
}

/// Where a signed-in session is kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PersistenceMode {
    /// Lives only as long as the current process
    #[default]
    SessionScoped,
    /// Survives restarts through the session store
    DurableLocal,
}

impl PersistenceMode {
    /// Mode for a "remember me" checkbox
    pub fn from_remember_me(remember_me: bool) -> Self {
        if remember_me {
            Self::DurableLocal
        } else {
            Self::SessionScoped
        }
    }

    pub fn is_durable(&self) -> bool {
        matches!(self, Self::DurableLocal)
    }
}

/// Profile fields to change; `None` leaves a field untouched
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileUpdate {
    pub display_name: Option<String>,
    pub photo_url: Option<String>,
}

impl ProfileUpdate {
    pub fn display_name(name: impl Into<String>) -> Self {
        Self {
            display_name: Some(name.into()),
            photo_url: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.display_name.is_none() && self.photo_url.is_none()
    }

    /// Apply the update to a session value
    pub fn apply_to(&self, mut session: Session) -> Session {
        if let Some(name) = &self.display_name {
            session.display_name = Some(name.clone());
        }
        if let Some(url) = &self.photo_url {
            session.photo_url = Some(url.clone());
        }
        session
    }
}

/// Bearer credentials the provider keeps for a signed-in session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCredentials {
    /// Short-lived bearer token presented to backends
    pub id_token: String,

    /// Long-lived token used to mint new id tokens
    pub refresh_token: String,

    /// When `id_token` stops being accepted
    pub expires_at: DateTime<Utc>,
}

impl SessionCredentials {
    pub fn new(id_token: String, refresh_token: String, expires_in_secs: i64) -> Self {
        Self {
            id_token,
            refresh_token,
            expires_at: Utc::now() + Duration::seconds(expires_in_secs),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    /// Check if the id token will expire within the given threshold
    pub fn expires_soon(&self, threshold_secs: i64) -> bool {
        (self.expires_at - Utc::now()).num_seconds() < threshold_secs
    }
}

/// A session together with its credentials, as persisted by the session store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSession {
    pub session: Session,
    pub credentials: SessionCredentials,
    /// When the user last proved their password
    pub signed_in_at: DateTime<Utc>,
}

impl StoredSession {
    pub fn new(session: Session, credentials: SessionCredentials) -> Self {
        Self {
            session,
            credentials,
            signed_in_at: Utc::now(),
        }
    }
}
