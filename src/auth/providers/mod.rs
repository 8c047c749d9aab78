use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, ReentrantMutex};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::auth::session::{PersistenceMode, ProfileUpdate, Session};
use crate::error::ProviderError;

pub mod identity_toolkit;
pub mod memory;

pub use identity_toolkit::IdentityToolkitProvider;
pub use memory::{InMemoryProvider, ProviderCall};

/// Result type for provider calls
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Receiver of "current user changed" notifications
pub type SessionSink = Arc<dyn Fn(Option<Session>) + Send + Sync>;

/// Identifier of a registered session sink
pub type WatchId = Uuid;

/// External identity provider consumed by the session observer and the
/// authentication façade
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Get the provider name
    fn name(&self) -> &str;

    /// Register a sink for session transitions.
    ///
    /// The sink is called once with the current session before this
    /// returns, then with every later transition in the order they happen.
    fn watch_sessions(&self, sink: SessionSink) -> WatchId;

    /// Stop notifying a sink registered with [`IdentityProvider::watch_sessions`]
    fn unwatch_sessions(&self, id: WatchId);

    /// Reload a previously persisted session, pushing it through the feed.
    ///
    /// Providers without persistence have nothing to restore.
    async fn restore(&self) -> ProviderResult<Option<Session>> {
        Ok(None)
    }

    /// Choose where sessions created by later sign-ins and sign-ups are kept.
    ///
    /// The mode stays in force until it is set again.
    async fn set_persistence(&self, mode: PersistenceMode) -> ProviderResult<()>;

    /// Create an account; the new user is signed in on success
    async fn create_user(&self, email: &str, password: &str) -> ProviderResult<Session>;

    async fn sign_in(&self, email: &str, password: &str) -> ProviderResult<Session>;

    async fn sign_out(&self) -> ProviderResult<()>;

    async fn send_password_reset(&self, email: &str) -> ProviderResult<()>;

    async fn update_profile(
        &self,
        session: &Session,
        update: &ProfileUpdate,
    ) -> ProviderResult<Session>;

    async fn update_email(&self, session: &Session, new_email: &str) -> ProviderResult<Session>;

    async fn update_password(&self, session: &Session, new_password: &str) -> ProviderResult<()>;

    async fn delete_user(&self, session: &Session) -> ProviderResult<()>;

    async fn send_email_verification(&self, session: &Session) -> ProviderResult<()>;

    /// Mint a bearer token for the session, refreshing it when forced or stale
    async fn id_token(&self, session: &Session, force_refresh: bool) -> ProviderResult<String>;
}

/// Current-session cell paired with the sinks watching it.
///
/// Publishing and registering both hold the delivery lock, so every sink
/// sees the value current at registration followed by exactly the later
/// transitions, in order. The lock is re-entrant so a sink may publish.
pub struct SessionChannel {
    current: Mutex<Option<Session>>,
    sinks: Mutex<Vec<(WatchId, SessionSink)>>,
    delivery: ReentrantMutex<()>,
}

impl Default for SessionChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionChannel {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(None),
            sinks: Mutex::new(Vec::new()),
            delivery: ReentrantMutex::new(()),
        }
    }

    pub fn watch(&self, sink: SessionSink) -> WatchId {
        let _delivery = self.delivery.lock();
        let id = Uuid::new_v4();
        self.sinks.lock().push((id, Arc::clone(&sink)));

        let current = self.current.lock().clone();
        sink(current);

        debug!(watch_id = %id, "Session sink registered");
        id
    }

    pub fn unwatch(&self, id: WatchId) {
        let mut sinks = self.sinks.lock();
        let before = sinks.len();
        sinks.retain(|(sink_id, _)| *sink_id != id);

        if sinks.len() < before {
            debug!(watch_id = %id, "Session sink removed");
        }
    }

    pub fn current(&self) -> Option<Session> {
        self.current.lock().clone()
    }

    /// Replace the current session and notify every sink
    pub fn publish(&self, session: Option<Session>) {
        let _delivery = self.delivery.lock();
        *self.current.lock() = session.clone();

        let sinks: Vec<SessionSink> = self
            .sinks
            .lock()
            .iter()
            .map(|(_, sink)| Arc::clone(sink))
            .collect();

        trace!(sinks = sinks.len(), "Publishing session change");
        for sink in sinks {
            sink(session.clone());
        }
    }
}
