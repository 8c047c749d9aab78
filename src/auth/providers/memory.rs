//! In-process identity provider.
//!
//! Keeps accounts in memory and follows the same rules as the hosted
//! provider (email shape, password length, recent-login checks, lockout
//! after repeated bad passwords). Used by the offline mode of the binary and
//! as the provider fake in tests: every call is counted and a failure can be
//! injected for the next call of a given kind.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use regex::Regex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::auth::providers::{
    IdentityProvider, ProviderResult, SessionChannel, SessionSink, WatchId,
};
use crate::auth::session::{
    PersistenceMode, ProfileUpdate, Session, SessionCredentials, StoredSession,
};
use crate::auth::storage::SessionStore;
use crate::error::{codes, ProviderError};

const MIN_PASSWORD_LEN: usize = 6;
const MAX_FAILED_SIGN_INS: u32 = 5;
const RECENT_LOGIN_WINDOW_SECS: i64 = 300;
const ID_TOKEN_LIFETIME_SECS: i64 = 3600;
const ID_TOKEN_REFRESH_MARGIN_SECS: i64 = 300;

fn email_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("valid email regex"))
}

/// Kinds of provider call, used for call accounting and failure injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderCall {
    SetPersistence,
    CreateUser,
    SignIn,
    SignOut,
    PasswordReset,
    UpdateProfile,
    UpdateEmail,
    UpdatePassword,
    DeleteUser,
    SendVerification,
    IdToken,
}

/// Email the provider would have sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundEmail {
    Verification { to: String },
    PasswordReset { to: String },
}

#[derive(Debug, Clone)]
struct Account {
    uid: String,
    email: String,
    password: String,
    display_name: Option<String>,
    photo_url: Option<String>,
    email_verified: bool,
    disabled: bool,
    failed_sign_ins: u32,
}

impl Account {
    fn new(email: &str, password: &str) -> Self {
        Self {
            uid: Uuid::new_v4().to_string(),
            email: email.to_string(),
            password: password.to_string(),
            display_name: None,
            photo_url: None,
            email_verified: false,
            disabled: false,
            failed_sign_ins: 0,
        }
    }

    fn session(&self) -> Session {
        Session {
            uid: self.uid.clone(),
            email: self.email.clone(),
            display_name: self.display_name.clone(),
            photo_url: self.photo_url.clone(),
            email_verified: self.email_verified,
        }
    }
}

/// Account table keyed by uid.
///
/// Clones share the same accounts, which lets a second provider instance
/// stand in for the same backend after a simulated restart.
#[derive(Clone, Default)]
pub struct AccountDirectory {
    accounts: Arc<DashMap<String, Account>>,
    /// Held while an email address is checked and then taken
    claims: Arc<Mutex<()>>,
}

impl AccountDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    fn uid_for_email(&self, email: &str) -> Option<String> {
        let wanted = email.to_lowercase();
        self.accounts
            .iter()
            .find(|entry| entry.email.to_lowercase() == wanted)
            .map(|entry| entry.key().clone())
    }

    fn email_taken() -> ProviderError {
        ProviderError::new(
            codes::EMAIL_ALREADY_IN_USE,
            "The email address is already in use by another account",
        )
    }

    /// Add `account` unless another account already uses its email
    fn insert_unique(&self, account: Account) -> ProviderResult<Session> {
        let _claim = self.claims.lock();
        if self.uid_for_email(&account.email).is_some() {
            return Err(Self::email_taken());
        }

        let session = account.session();
        self.accounts.insert(account.uid.clone(), account);
        Ok(session)
    }

    /// Move an account to a new email unless another account already uses it
    fn change_email(&self, uid: &str, new_email: &str) -> ProviderResult<Session> {
        let _claim = self.claims.lock();
        if let Some(owner) = self.uid_for_email(new_email) {
            if owner != uid {
                return Err(Self::email_taken());
            }
        }

        let mut account = self
            .accounts
            .get_mut(uid)
            .ok_or_else(|| ProviderError::new(codes::USER_NOT_FOUND, "Account was deleted"))?;
        account.email = new_email.to_string();
        account.email_verified = false;
        Ok(account.session())
    }
}

/// The signed-in session and the persistence it was created with
#[derive(Debug, Clone)]
struct ActiveSession {
    stored: StoredSession,
    mode: PersistenceMode,
}

/// Identity provider that lives entirely in this process
pub struct InMemoryProvider {
    name: String,
    directory: AccountDirectory,
    channel: SessionChannel,
    /// Persistence applied to sign-ins until changed
    persistence: Mutex<PersistenceMode>,
    active: Mutex<Option<ActiveSession>>,
    /// Held across every change to `active` until it is stored and
    /// published, so the published order matches the order of the changes
    transitions: AsyncMutex<()>,
    store: Option<Arc<SessionStore>>,
    /// One-shot failures keyed by call kind
    failures: DashMap<ProviderCall, String>,
    calls: DashMap<ProviderCall, usize>,
    outbox: Mutex<Vec<OutboundEmail>>,
    token_counter: AtomicU64,
    sign_up_enabled: AtomicBool,
}

impl Default for InMemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryProvider {
    #[instrument(level = "debug")]
    pub fn new() -> Self {
        info!("Creating in-memory identity provider");
        Self {
            name: "memory".to_string(),
            directory: AccountDirectory::new(),
            channel: SessionChannel::default(),
            persistence: Mutex::new(PersistenceMode::default()),
            active: Mutex::new(None),
            transitions: AsyncMutex::new(()),
            store: None,
            failures: DashMap::new(),
            calls: DashMap::new(),
            outbox: Mutex::new(Vec::new()),
            token_counter: AtomicU64::new(0),
            sign_up_enabled: AtomicBool::new(true),
        }
    }

    /// Use an existing account table
    pub fn with_directory(mut self, directory: AccountDirectory) -> Self {
        self.directory = directory;
        self
    }

    /// Persist durable-local sessions in this store
    pub fn with_store(mut self, store: Arc<SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn directory(&self) -> AccountDirectory {
        self.directory.clone()
    }

    /// Seed an account without signing it in
    pub fn add_account(&self, email: &str, password: &str) -> Session {
        let account = Account::new(email, password);
        let session = account.session();
        self.directory.accounts.insert(account.uid.clone(), account);
        session
    }

    pub fn disable_account(&self, email: &str) {
        if let Some(uid) = self.directory.uid_for_email(email) {
            if let Some(mut account) = self.directory.accounts.get_mut(&uid) {
                account.disabled = true;
            }
        }
    }

    /// Switch email/password sign-up on or off
    pub fn set_sign_up_enabled(&self, enabled: bool) {
        self.sign_up_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Make the next call of `call` fail with `code`
    pub fn fail_next(&self, call: ProviderCall, code: &str) {
        self.failures.insert(call, code.to_string());
    }

    /// Number of calls of one kind made so far
    pub fn calls(&self, call: ProviderCall) -> usize {
        self.calls.get(&call).map(|count| *count).unwrap_or(0)
    }

    /// Total number of calls that would have crossed the network
    pub fn network_calls(&self) -> usize {
        self.calls.iter().map(|entry| *entry.value()).sum()
    }

    pub fn outbox(&self) -> Vec<OutboundEmail> {
        self.outbox.lock().clone()
    }

    /// Push a session change as if it came from elsewhere (e.g. another tab)
    pub fn push(&self, session: Option<Session>) {
        self.channel.publish(session);
    }

    /// Pretend the current sign-in happened `secs` seconds earlier
    pub fn backdate_sign_in(&self, secs: i64) {
        if let Some(active) = self.active.lock().as_mut() {
            active.stored.signed_in_at = active.stored.signed_in_at - Duration::seconds(secs);
        }
    }

    /// Count the call and take any failure injected for it
    fn begin(&self, call: ProviderCall) -> ProviderResult<()> {
        *self.calls.entry(call).or_insert(0) += 1;

        match self.failures.remove(&call) {
            Some((_, code)) => {
                debug!(?call, code = %code, "Injected provider failure");
                Err(ProviderError::new(code, "injected failure"))
            }
            None => Ok(()),
        }
    }

    fn check_email(email: &str) -> ProviderResult<()> {
        if email_pattern().is_match(email) {
            Ok(())
        } else {
            Err(ProviderError::new(
                codes::INVALID_EMAIL,
                format!("'{email}' is not a valid email address"),
            ))
        }
    }

    fn check_password(password: &str) -> ProviderResult<()> {
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(ProviderError::new(
                codes::WEAK_PASSWORD,
                "Password should be at least 6 characters",
            ));
        }
        Ok(())
    }

    fn mint_credentials(&self, uid: &str, refresh_token: Option<String>) -> SessionCredentials {
        let serial = self.token_counter.fetch_add(1, Ordering::SeqCst) + 1;
        SessionCredentials::new(
            format!("mem.{uid}.{serial}"),
            refresh_token.unwrap_or_else(|| format!("refresh.{}", Uuid::new_v4())),
            ID_TOKEN_LIFETIME_SECS,
        )
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

    fn require_recent_login(active: &ActiveSession) -> ProviderResult<()> {
        let age = Utc::now() - active.stored.signed_in_at;
        if age.num_seconds() > RECENT_LOGIN_WINDOW_SECS {
            return Err(ProviderError::new(
                codes::REQUIRES_RECENT_LOGIN,
                "This operation requires a recent sign-in",
            ));
        }
        Ok(())
    }

    /// Record a fresh sign-in and announce it
    async fn establish(&self, session: Session) -> Session {
        let _transition = self.transitions.lock().await;
        let mode = *self.persistence.lock();
        let stored = StoredSession::new(session.clone(), self.mint_credentials(&session.uid, None));

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
    async fn replace_session(&self, session: Session) {
        let _transition = self.transitions.lock().await;
        let updated = {
            let mut active = self.active.lock();
            match active.as_mut() {
                Some(current) if current.stored.session.uid == session.uid => {
                    current.stored.session = session.clone();
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
}

#[async_trait]
impl IdentityProvider for InMemoryProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn watch_sessions(&self, sink: SessionSink) -> WatchId {
        self.channel.watch(sink)
    }

    fn unwatch_sessions(&self, id: WatchId) {
        self.channel.unwatch(id);
    }

    async fn restore(&self) -> ProviderResult<Option<Session>> {
        let Some(store) = &self.store else {
            return Ok(None);
        };

        let stored = match store.retrieve().await {
            Ok(Some(stored)) => stored,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!(error = %e, "Discarding unreadable persisted session");
                if let Err(e) = store.clear().await {
                    warn!(error = %e, "Failed to clear session store");
                }
                return Ok(None);
            }
        };

        let account = self
            .directory
            .accounts
            .get(&stored.session.uid)
            .map(|account| account.clone());

        match account {
            Some(account) if !account.disabled => {
                let session = account.session();
                let _transition = self.transitions.lock().await;
                *self.active.lock() = Some(ActiveSession {
                    stored: StoredSession {
                        session: session.clone(),
                        ..stored
                    },
                    mode: PersistenceMode::DurableLocal,
                });
                self.channel.publish(Some(session.clone()));
                info!(uid = %session.uid, "Restored persisted session");
                Ok(Some(session))
            }
            _ => {
                debug!(uid = %stored.session.uid, "Persisted session no longer valid");
                if let Err(e) = store.clear().await {
                    warn!(error = %e, "Failed to clear session store");
                }
                Ok(None)
            }
        }
    }

    async fn set_persistence(&self, mode: PersistenceMode) -> ProviderResult<()> {
        self.begin(ProviderCall::SetPersistence)?;
        *self.persistence.lock() = mode;
        Ok(())
    }

    async fn create_user(&self, email: &str, password: &str) -> ProviderResult<Session> {
        self.begin(ProviderCall::CreateUser)?;
        Self::check_email(email)?;

        if !self.sign_up_enabled.load(Ordering::SeqCst) {
            return Err(ProviderError::new(
                codes::OPERATION_NOT_ALLOWED,
                "Password sign-up is disabled for this project",
            ));
        }
        Self::check_password(password)?;

        let session = self.directory.insert_unique(Account::new(email, password))?;
        Ok(self.establish(session).await)
    }

    async fn sign_in(&self, email: &str, password: &str) -> ProviderResult<Session> {
        self.begin(ProviderCall::SignIn)?;
        Self::check_email(email)?;

        let uid = self.directory.uid_for_email(email).ok_or_else(|| {
            ProviderError::new(codes::USER_NOT_FOUND, "There is no user for this email")
        })?;

        let session = {
            let mut account = self.directory.accounts.get_mut(&uid).ok_or_else(|| {
                ProviderError::new(codes::USER_NOT_FOUND, "There is no user for this email")
            })?;

            if account.disabled {
                return Err(ProviderError::new(
                    codes::USER_DISABLED,
                    "The user account has been disabled",
                ));
            }
            if account.failed_sign_ins >= MAX_FAILED_SIGN_INS {
                return Err(ProviderError::new(
                    codes::TOO_MANY_REQUESTS,
                    "Access temporarily disabled due to many failed attempts",
                ));
            }
            if account.password != password {
                account.failed_sign_ins += 1;
                return Err(ProviderError::new(
                    codes::WRONG_PASSWORD,
                    "The password is invalid",
                ));
            }

            account.failed_sign_ins = 0;
            account.session()
        };

        Ok(self.establish(session).await)
    }

    async fn sign_out(&self) -> ProviderResult<()> {
        self.begin(ProviderCall::SignOut)?;
        self.forget_session().await;
        info!("User signed out");
        Ok(())
    }

    async fn send_password_reset(&self, email: &str) -> ProviderResult<()> {
        self.begin(ProviderCall::PasswordReset)?;
        Self::check_email(email)?;

        if self.directory.uid_for_email(email).is_none() {
            return Err(ProviderError::new(
                codes::USER_NOT_FOUND,
                "There is no user for this email",
            ));
        }

        self.outbox.lock().push(OutboundEmail::PasswordReset {
            to: email.to_string(),
        });
        Ok(())
    }

    async fn update_profile(
        &self,
        session: &Session,
        update: &ProfileUpdate,
    ) -> ProviderResult<Session> {
        self.begin(ProviderCall::UpdateProfile)?;
        self.require_active(session)?;

        let updated = {
            let mut account = self
                .directory
                .accounts
                .get_mut(&session.uid)
                .ok_or_else(|| ProviderError::new(codes::USER_NOT_FOUND, "Account was deleted"))?;

            if let Some(name) = &update.display_name {
                account.display_name = Some(name.clone());
            }
            if let Some(url) = &update.photo_url {
                account.photo_url = Some(url.clone());
            }
            account.session()
        };

        self.replace_session(updated.clone()).await;
        Ok(updated)
    }

    async fn update_email(&self, session: &Session, new_email: &str) -> ProviderResult<Session> {
        self.begin(ProviderCall::UpdateEmail)?;
        let active = self.require_active(session)?;
        Self::require_recent_login(&active)?;
        Self::check_email(new_email)?;

        let updated = self.directory.change_email(&session.uid, new_email)?;

        self.outbox.lock().push(OutboundEmail::Verification {
            to: new_email.to_string(),
        });
        self.replace_session(updated.clone()).await;
        Ok(updated)
    }

    async fn update_password(&self, session: &Session, new_password: &str) -> ProviderResult<()> {
        self.begin(ProviderCall::UpdatePassword)?;
        let active = self.require_active(session)?;
        Self::require_recent_login(&active)?;
        Self::check_password(new_password)?;

        let mut account = self
            .directory
            .accounts
            .get_mut(&session.uid)
            .ok_or_else(|| ProviderError::new(codes::USER_NOT_FOUND, "Account was deleted"))?;
        account.password = new_password.to_string();
        account.failed_sign_ins = 0;
        Ok(())
    }

    async fn delete_user(&self, session: &Session) -> ProviderResult<()> {
        self.begin(ProviderCall::DeleteUser)?;
        let active = self.require_active(session)?;
        Self::require_recent_login(&active)?;

        self.directory.accounts.remove(&session.uid);
        self.forget_session().await;
        info!(uid = %session.uid, "Account deleted");
        Ok(())
    }

    async fn send_email_verification(&self, session: &Session) -> ProviderResult<()> {
        self.begin(ProviderCall::SendVerification)?;
        let active = self.require_active(session)?;

        self.outbox.lock().push(OutboundEmail::Verification {
            to: active.stored.session.email,
        });
        Ok(())
    }

    async fn id_token(&self, session: &Session, force_refresh: bool) -> ProviderResult<String> {
        self.begin(ProviderCall::IdToken)?;
        let active = self.require_active(session)?;
        let credentials = &active.stored.credentials;

        if !force_refresh && !credentials.expires_soon(ID_TOKEN_REFRESH_MARGIN_SECS) {
            return Ok(credentials.id_token.clone());
        }

        let fresh = self.mint_credentials(&session.uid, Some(credentials.refresh_token.clone()));
        let _transition = self.transitions.lock().await;
        let refreshed = {
            let mut guard = self.active.lock();
            match guard.as_mut() {
                Some(current) if current.stored.session.uid == session.uid => {
                    current.stored.credentials = fresh.clone();
                    Some(current.clone())
                }
                _ => None,
            }
        };

        if let Some(active) = refreshed {
            self.persist(&active.stored, active.mode).await;
        }
        debug!(uid = %session.uid, "Minted new id token");
        Ok(fresh.id_token)
    }
}
