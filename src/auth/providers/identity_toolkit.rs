use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, instrument, warn};

use crate::auth::providers::{
    IdentityProvider, ProviderResult, SessionChannel, SessionSink, WatchId,
};
use crate::auth::session::{
    PersistenceMode, ProfileUpdate, Session, SessionCredentials, StoredSession,
};
use crate::auth::storage::SessionStore;
use crate::error::{codes, ProviderError};

// Hosted endpoints
pub const IDENTITY_TOOLKIT_URL: &str = "https://identitytoolkit.googleapis.com/v1";
pub const SECURE_TOKEN_URL: &str = "https://securetoken.googleapis.com/v1/token";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const TOKEN_REFRESH_MARGIN_SECS: i64 = 300;
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

// Response for accounts:signUp and accounts:signInWithPassword
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignInResponse {
    local_id: String,
    email: String,
    id_token: String,
    refresh_token: String,
    expires_in: String,
}

// Response for accounts:update
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateResponse {
    email: Option<String>,
    id_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    users: Vec<UserRecord>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserRecord {
    local_id: String,
    email: String,
    display_name: Option<String>,
    photo_url: Option<String>,
    #[serde(default)]
    email_verified: bool,
}

impl From<UserRecord> for Session {
    fn from(user: UserRecord) -> Self {
        Session {
            uid: user.local_id,
            email: user.email,
            display_name: user.display_name,
            photo_url: user.photo_url,
            email_verified: user.email_verified,
        }
    }
}

// Response from the secure token endpoint
#[derive(Debug, Clone, Deserialize)]
struct RefreshResponse {
    id_token: String,
    refresh_token: String,
    expires_in: String,
}

// Error envelope shared by both services
#[derive(Debug, Clone, Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Clone, Deserialize)]
struct ErrorDetail {
    message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct OobCodeRequest<'a> {
    request_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    id_token: Option<&'a str>,
}

/// Turn an error body from the REST API into a provider error.
///
/// Messages look like `EMAIL_EXISTS` or `WEAK_PASSWORD : Password should be
/// at least 6 characters`; the part before ` : ` picks the code and the rest
/// is kept as detail.
pub fn normalize_rest_error(body: &str) -> ProviderError {
    let message = match serde_json::from_str::<ErrorResponse>(body) {
        Ok(response) => response.error.message,
        Err(_) => return ProviderError::internal(format!("Unexpected error response: {body}")),
    };

    let (reason, detail) = match message.split_once(" : ") {
        Some((reason, detail)) => (reason.trim(), detail.trim()),
        None => (message.trim(), ""),
    };

    let code = match reason {
        "EMAIL_EXISTS" => codes::EMAIL_ALREADY_IN_USE,
        "INVALID_EMAIL" => codes::INVALID_EMAIL,
        "OPERATION_NOT_ALLOWED" | "PASSWORD_LOGIN_DISABLED" => codes::OPERATION_NOT_ALLOWED,
        "WEAK_PASSWORD" => codes::WEAK_PASSWORD,
        "EMAIL_NOT_FOUND" | "USER_NOT_FOUND" => codes::USER_NOT_FOUND,
        "INVALID_PASSWORD" => codes::WRONG_PASSWORD,
        "INVALID_LOGIN_CREDENTIALS" => codes::INVALID_CREDENTIAL,
        "USER_DISABLED" => codes::USER_DISABLED,
        "TOO_MANY_ATTEMPTS_TRY_LATER" => codes::TOO_MANY_REQUESTS,
        "CREDENTIAL_TOO_OLD_LOGIN_AGAIN" => codes::REQUIRES_RECENT_LOGIN,
        "TOKEN_EXPIRED" => codes::USER_TOKEN_EXPIRED,
        "INVALID_ID_TOKEN" | "INVALID_REFRESH_TOKEN" => codes::INVALID_USER_TOKEN,
        _ => return ProviderError::internal(message.clone()),
    };

    let detail = if detail.is_empty() { reason } else { detail };
    ProviderError::new(code, detail)
}

fn parse_expires_in(expires_in: &str) -> i64 {
    expires_in
        .parse::<i64>()
        .unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS)
}

/// The signed-in session and the persistence it was created with
#[derive(Debug, Clone)]
struct ActiveSession {
    stored: StoredSession,
    mode: PersistenceMode,
}

/// Client for the hosted identity provider's REST API
pub struct IdentityToolkitProvider {
    /// HTTP client for API requests
    client: Client,
    api_key: String,
    /// Base URL of the account endpoints
    identity_url: String,
    /// Secure token endpoint used for refreshes
    token_url: String,
    channel: SessionChannel,
    /// Persistence applied to sign-ins until changed
    persistence: Mutex<PersistenceMode>,
    active: Mutex<Option<ActiveSession>>,
    /// Held across every change to `active` until it is stored and
    /// published, so the published order matches the order of the changes
    transitions: AsyncMutex<()>,
    store: Option<Arc<SessionStore>>,
}

impl IdentityToolkitProvider {
    /// Create a provider talking to the hosted endpoints
    pub fn new(api_key: &str) -> Self {
        Self::with_endpoints(api_key, IDENTITY_TOOLKIT_URL, SECURE_TOKEN_URL)
    }

    /// Create a provider talking to a local auth emulator, e.g.
    /// `http://localhost:9099`
    pub fn with_emulator(api_key: &str, emulator_host: &str) -> Self {
        let host = emulator_host.trim_end_matches('/');
        info!(emulator = %host, "Using auth emulator");
        Self::with_endpoints(
            api_key,
            &format!("{host}/identitytoolkit.googleapis.com/v1"),
            &format!("{host}/securetoken.googleapis.com/v1/token"),
        )
    }

    pub fn with_endpoints(api_key: &str, identity_url: &str, token_url: &str) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            client,
            api_key: api_key.to_string(),
            identity_url: identity_url.trim_end_matches('/').to_string(),
            token_url: token_url.to_string(),
            channel: SessionChannel::default(),
            persistence: Mutex::new(PersistenceMode::default()),
            active: Mutex::new(None),
            transitions: AsyncMutex::new(()),
            store: None,
        }
    }

    /// Use a preconfigured HTTP client
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    /// Persist durable-local sessions in this store
    pub fn with_store(mut self, store: Arc<SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// POST a JSON body to an account endpoint
    async fn call<B, R>(&self, endpoint: &str, body: &B) -> ProviderResult<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = format!("{}/{}", self.identity_url, endpoint);
        let request = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(body);

        self.send(endpoint, request).await
    }

    async fn send<R: DeserializeOwned>(
        &self,
        endpoint: &str,
        request: reqwest::RequestBuilder,
    ) -> ProviderResult<R> {
        let response = request.send().await.map_err(|e| {
            warn!(endpoint, error = %e, "Request to identity provider failed");
            ProviderError::network(e)
        })?;

        let status = response.status();
        let text = response.text().await.map_err(ProviderError::network)?;

        if !status.is_success() {
            let err = normalize_rest_error(&text);
            debug!(endpoint, %status, code = %err.code, "Identity provider rejected request");
            return Err(err);
        }

        serde_json::from_str(&text).map_err(|e| {
            error!(endpoint, error = %e, "Failed to parse identity provider response");
            ProviderError::internal(format!("Failed to parse {endpoint} response: {e}"))
        })
    }

    /// Fetch the full user record behind an id token
    async fn lookup(&self, id_token: &str) -> ProviderResult<Session> {
        let response: LookupResponse = self
            .call("accounts:lookup", &json!({ "idToken": id_token }))
            .await?;

        response
            .users
            .into_iter()
            .next()
            .map(Session::from)
            .ok_or_else(|| ProviderError::new(codes::USER_NOT_FOUND, "No user for this token"))
    }

    /// Exchange a refresh token for fresh credentials
    async fn refresh(&self, refresh_token: &str) -> ProviderResult<SessionCredentials> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];

        let request = self
            .client
            .post(&self.token_url)
            .query(&[("key", self.api_key.as_str())])
            .form(&params);

        let response: RefreshResponse = self.send("token", request).await?;
        debug!("Refreshed id token");

        Ok(SessionCredentials::new(
            response.id_token,
            response.refresh_token,
            parse_expires_in(&response.expires_in),
        ))
    }

    /// The active session, provided it belongs to `session`
    fn require_active(&self, session: &Session) -> ProviderResult<ActiveSession> {
        match self.active.lock().as_ref() {
            Some(active) if active.stored.session.uid == session.uid => Ok(active.clone()),
            _ => Err(ProviderError::new(
                codes::INVALID_USER_TOKEN,
                "No signed-in user matches this session",
            )),
        }
    }

    /// A usable id token for the active session, refreshing it when stale
    async fn valid_id_token(&self, session: &Session, force_refresh: bool) -> ProviderResult<String> {
        let active = self.require_active(session)?;
        let credentials = &active.stored.credentials;

        if !force_refresh && !credentials.expires_soon(TOKEN_REFRESH_MARGIN_SECS) {
            return Ok(credentials.id_token.clone());
        }

        let fresh = self.refresh(&credentials.refresh_token).await?;
        let id_token = fresh.id_token.clone();
        self.replace_credentials(&session.uid, fresh).await;
        Ok(id_token)
    }

    /// Record a fresh sign-in and announce it
    async fn establish(&self, session: Session, credentials: SessionCredentials) -> Session {
        let _transition = self.transitions.lock().await;
        let mode = *self.persistence.lock();
        let stored = StoredSession::new(session.clone(), credentials);

        *self.active.lock() = Some(ActiveSession {
            stored: stored.clone(),
            mode,
        });
        self.persist(&stored, mode).await;
        self.channel.publish(Some(session.clone()));

        info!(uid = %session.uid, ?mode, "User signed in");
        session
    }

    /// Replace the active session's profile and announce the change
    async fn replace_session(&self, session: Session, credentials: Option<SessionCredentials>) {
        let _transition = self.transitions.lock().await;
        let updated = {
            let mut active = self.active.lock();
            match active.as_mut() {
                Some(current) if current.stored.session.uid == session.uid => {
                    current.stored.session = session.clone();
                    if let Some(credentials) = credentials {
                        current.stored.credentials = credentials;
                    }
                    Some(current.clone())
                }
                _ => None,
            }
        };

        if let Some(active) = updated {
            self.persist(&active.stored, active.mode).await;
            self.channel.publish(Some(session));
        }
    }

    async fn replace_credentials(&self, uid: &str, credentials: SessionCredentials) {
        let _transition = self.transitions.lock().await;
        let updated = {
            let mut active = self.active.lock();
            match active.as_mut() {
                Some(current) if current.stored.session.uid == uid => {
                    current.stored.credentials = credentials;
                    Some(current.clone())
                }
                _ => None,
            }
        };

        if let Some(active) = updated {
            self.persist(&active.stored, active.mode).await;
        }
    }

    /// Write or clear the durable entry; storage trouble never fails the call
    async fn persist(&self, stored: &StoredSession, mode: PersistenceMode) {
        let Some(store) = &self.store else {
            return;
        };

        let result = if mode.is_durable() {
            store.store(stored).await
        } else {
            store.clear().await
        };

        if let Err(e) = result {
            warn!(uid = %stored.session.uid, error = %e, "Failed to update session store");
        }
    }

    async fn forget_session(&self) {
        let _transition = self.transitions.lock().await;
        *self.active.lock() = None;

        if let Some(store) = &self.store {
            if let Err(e) = store.clear().await {
                warn!(error = %e, "Failed to clear session store");
            }
        }
        self.channel.publish(None);
    }

    async fn discard_stored(&self, store: &SessionStore) {
        if let Err(e) = store.clear().await {
            warn!(error = %e, "Failed to clear session store");
        }
    }
}

#[async_trait]
impl IdentityProvider for IdentityToolkitProvider {
    fn name(&self) -> &str {
        "identity_toolkit"
    }

    fn watch_sessions(&self, sink: SessionSink) -> WatchId {
        self.channel.watch(sink)
    }

    fn unwatch_sessions(&self, id: WatchId) {
        self.channel.unwatch(id);
    }

    #[instrument(skip_all)]
    async fn restore(&self) -> ProviderResult<Option<Session>> {
        let Some(store) = &self.store else {
            return Ok(None);
        };

        let stored = match store.retrieve().await {
            Ok(Some(stored)) => stored,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!(error = %e, "Discarding unreadable persisted session");
                self.discard_stored(store).await;
                return Ok(None);
            }
        };

        let stored = if stored.credentials.expires_soon(TOKEN_REFRESH_MARGIN_SECS) {
            match self.refresh(&stored.credentials.refresh_token).await {
                Ok(credentials) => StoredSession {
                    credentials,
                    ..stored
                },
                // Offline: keep the session, the next token request retries the refresh
                Err(e) if e.code == codes::NETWORK_REQUEST_FAILED => {
                    warn!(error = %e.message, "Could not refresh restored session");
                    stored
                }
                Err(e) => {
                    info!(code = %e.code, "Persisted session was revoked");
                    self.discard_stored(store).await;
                    return Ok(None);
                }
            }
        } else {
            stored
        };

        let session = stored.session.clone();
        let _transition = self.transitions.lock().await;
        *self.active.lock() = Some(ActiveSession {
            stored: stored.clone(),
            mode: PersistenceMode::DurableLocal,
        });
        self.persist(&stored, PersistenceMode::DurableLocal).await;
        self.channel.publish(Some(session.clone()));

        info!(uid = %session.uid, "Restored persisted session");
        Ok(Some(session))
    }

    async fn set_persistence(&self, mode: PersistenceMode) -> ProviderResult<()> {
        *self.persistence.lock() = mode;
        debug!(?mode, "Persistence set for later sign-ins");
        Ok(())
    }

    #[instrument(skip_all)]
    async fn create_user(&self, email: &str, password: &str) -> ProviderResult<Session> {
        let response: SignInResponse = self
            .call(
                "accounts:signUp",
                &json!({ "email": email, "password": password, "returnSecureToken": true }),
            )
            .await?;

        let credentials = SessionCredentials::new(
            response.id_token,
            response.refresh_token,
            parse_expires_in(&response.expires_in),
        );
        let session = Session::new(response.local_id, response.email);
        Ok(self.establish(session, credentials).await)
    }

    #[instrument(skip_all)]
    async fn sign_in(&self, email: &str, password: &str) -> ProviderResult<Session> {
        let response: SignInResponse = self
            .call(
                "accounts:signInWithPassword",
                &json!({ "email": email, "password": password, "returnSecureToken": true }),
            )
            .await?;

        let credentials = SessionCredentials::new(
            response.id_token,
            response.refresh_token,
            parse_expires_in(&response.expires_in),
        );

        // Sign-in responses omit the verification flag and photo
        let session = match self.lookup(&credentials.id_token).await {
            Ok(session) => session,
            Err(e) => {
                warn!(code = %e.code, "User lookup after sign-in failed");
                Session::new(response.local_id, response.email)
            }
        };

        Ok(self.establish(session, credentials).await)
    }

    async fn sign_out(&self) -> ProviderResult<()> {
        self.forget_session().await;
        info!("User signed out");
        Ok(())
    }

    #[instrument(skip_all)]
    async fn send_password_reset(&self, email: &str) -> ProviderResult<()> {
        let _: serde_json::Value = self
            .call(
                "accounts:sendOobCode",
                &OobCodeRequest {
                    request_type: "PASSWORD_RESET",
                    email: Some(email),
                    id_token: None,
                },
            )
            .await?;

        debug!("Password reset email requested");
        Ok(())
    }

    #[instrument(skip_all, fields(uid = %session.uid))]
    async fn update_profile(
        &self,
        session: &Session,
        update: &ProfileUpdate,
    ) -> ProviderResult<Session> {
        let id_token = self.valid_id_token(session, false).await?;

        let mut body = json!({ "idToken": id_token, "returnSecureToken": false });
        if let Some(name) = &update.display_name {
            body["displayName"] = json!(name);
        }
        if let Some(url) = &update.photo_url {
            body["photoUrl"] = json!(url);
        }

        let _: UpdateResponse = self.call("accounts:update", &body).await?;

        let current = self.require_active(session)?.stored.session;
        let updated = update.apply_to(current);
        self.replace_session(updated.clone(), None).await;
        Ok(updated)
    }

    #[instrument(skip_all, fields(uid = %session.uid))]
    async fn update_email(&self, session: &Session, new_email: &str) -> ProviderResult<Session> {
        let id_token = self.valid_id_token(session, false).await?;

        let response: UpdateResponse = self
            .call(
                "accounts:update",
                &json!({ "idToken": id_token, "email": new_email, "returnSecureToken": true }),
            )
            .await?;

        let mut updated = self.require_active(session)?.stored.session;
        updated.email = response.email.unwrap_or_else(|| new_email.to_string());
        updated.email_verified = false;

        let credentials = match (response.id_token, response.refresh_token) {
            (Some(id_token), Some(refresh_token)) => Some(SessionCredentials::new(
                id_token,
                refresh_token,
                response
                    .expires_in
                    .as_deref()
                    .map(parse_expires_in)
                    .unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS),
            )),
            _ => None,
        };
        self.replace_session(updated.clone(), credentials).await;

        if let Err(e) = self.send_email_verification(&updated).await {
            warn!(code = %e.code, "Email updated but verification email was not sent");
        }
        Ok(updated)
    }

    #[instrument(skip_all, fields(uid = %session.uid))]
    async fn update_password(&self, session: &Session, new_password: &str) -> ProviderResult<()> {
        let id_token = self.valid_id_token(session, false).await?;

        let response: UpdateResponse = self
            .call(
                "accounts:update",
                &json!({ "idToken": id_token, "password": new_password, "returnSecureToken": true }),
            )
            .await?;

        // Changing the password revokes earlier tokens
        if let (Some(id_token), Some(refresh_token)) = (response.id_token, response.refresh_token)
        {
            let expires_in = response
                .expires_in
                .as_deref()
                .map(parse_expires_in)
                .unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);
            self.replace_credentials(
                &session.uid,
                SessionCredentials::new(id_token, refresh_token, expires_in),
            )
            .await;
        }

        debug!("Password updated");
        Ok(())
    }

    #[instrument(skip_all, fields(uid = %session.uid))]
    async fn delete_user(&self, session: &Session) -> ProviderResult<()> {
        let id_token = self.valid_id_token(session, false).await?;

        let _: serde_json::Value = self
            .call("accounts:delete", &json!({ "idToken": id_token }))
            .await?;

        self.forget_session().await;
        info!(uid = %session.uid, "Account deleted");
        Ok(())
    }

    #[instrument(skip_all, fields(uid = %session.uid))]
    async fn send_email_verification(&self, session: &Session) -> ProviderResult<()> {
        let id_token = self.valid_id_token(session, false).await?;

        let _: serde_json::Value = self
            .call(
                "accounts:sendOobCode",
                &OobCodeRequest {
                    request_type: "VERIFY_EMAIL",
                    email: None,
                    id_token: Some(&id_token),
                },
            )
            .await?;

        debug!("Verification email requested");
        Ok(())
    }

    async fn id_token(&self, session: &Session, force_refresh: bool) -> ProviderResult<String> {
        self.valid_id_token(session, force_refresh).await
    }
}
