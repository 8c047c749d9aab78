//! Session observer
//!
//! Wraps the provider's single "current user changed" feed and fans it out to
//! any number of listeners. The latest session is cached so a late listener is
//! called straight away with the state as of its registration.
//!
//! Broadcasts run over a snapshot of the listener list taken when the
//! broadcast starts: a listener removed mid-delivery still receives the value
//! being delivered, and stops receiving from the next one.


use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{ReentrantMutex, RwLock};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::auth::providers::{IdentityProvider, WatchId};
use crate::auth::session::Session;

/// Identifier handed out for each registered listener
pub type ListenerId = Uuid;

type ListenerFn = dyn Fn(Option<&Session>) -> anyhow::Result<()> + Send + Sync;

#[derive(Clone)]
struct ListenerEntry {
    id: ListenerId,
    callback: Arc<ListenerFn>,
}

type ListenerList = RwLock<Vec<ListenerEntry>>;

/// Single point of truth for who is signed in right now
pub struct SessionObserver {
    /// Latest value pushed by the provider
    current: RwLock<Option<Session>>,

    /// Registered listeners in registration order
    listeners: Arc<ListenerList>,

    /// Serialises broadcasts and replays so listeners see transitions in order.
    /// Re-entrant so a listener may subscribe from inside a callback.
    delivery: ReentrantMutex<()>,

    /// Optional label used in log output
    group: Option<String>,
}

impl Default for SessionObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionObserver {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(None),
            listeners: Arc::new(RwLock::new(Vec::new())),
            delivery: ReentrantMutex::new(()),
            group: None,
        }
    }

    /// Create an observer whose log lines carry a group label
    pub fn with_group(group: &str) -> Self {
        Self {
            group: Some(group.to_string()),
            ..Self::new()
        }
    }

    /// Register a listener.
    ///
    /// The listener is called immediately, on the calling thread, with the
    /// cached session, then again for every later transition until the
    /// returned handle is used to unsubscribe.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(Option<&Session>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let entry = ListenerEntry {
            id: Uuid::new_v4(),
            callback: Arc::new(listener),
        };

        let _delivery = self.delivery.lock();
        self.listeners.write().push(entry.clone());

        debug!(
            listener_id = %entry.id,
            group = self.group.as_deref().unwrap_or("default"),
            "Registered session listener"
        );

        let snapshot = self.current.read().clone();
        self.invoke(&entry, snapshot.as_ref());

        Subscription {
            id: entry.id,
            listeners: Arc::downgrade(&self.listeners),
            active: AtomicBool::new(true),
        }
    }

    /// Remove every listener. The cached session is left alone.
    pub fn unsubscribe_all(&self) {
        let mut listeners = self.listeners.write();
        let count = listeners.len();
        listeners.clear();

        debug!(
            count,
            group = self.group.as_deref().unwrap_or("default"),
            "Cleared all session listeners"
        );
    }

    /// The cached session, if any
    pub fn current(&self) -> Option<Session> {
        self.current.read().clone()
    }

    /// Get the number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// React to a provider push: replace the cached session, then call every
    /// listener registered at this moment, in registration order.
    ///
    /// Returns how many listeners failed. Failures never propagate to the
    /// caller, which is normally the provider's notification path.
    pub fn deliver(&self, session: Option<Session>) -> usize {
        let _delivery = self.delivery.lock();

        *self.current.write() = session.clone();
        let snapshot: Vec<ListenerEntry> = self.listeners.read().clone();

        debug!(
            signed_in = session.is_some(),
            listeners = snapshot.len(),
            group = self.group.as_deref().unwrap_or("default"),
            "Broadcasting session change"
        );

        snapshot
            .iter()
            .filter(|entry| !self.invoke(entry, session.as_ref()))
            .count()
    }

    /// Follow a provider's session transitions.
    ///
    /// The provider's current session is delivered before this returns, and
    /// every later transition is delivered on the provider's calling thread
    /// before the provider call that caused it completes. The provider only
    /// holds a weak reference, so it never keeps the observer alive.
    pub fn attach(self: &Arc<Self>, provider: &dyn IdentityProvider) -> WatchId {
        let observer = Arc::downgrade(self);
        let id = provider.watch_sessions(Arc::new(move |session: Option<Session>| {
            if let Some(observer) = observer.upgrade() {
                observer.deliver(session);
            }
        }));

        info!(
            provider = provider.name(),
            watch_id = %id,
            group = self.group.as_deref().unwrap_or("default"),
            "Session observer attached"
        );
        id
    }

    /// Call one listener, isolating errors and panics. Returns false on failure.
    fn invoke(&self, entry: &ListenerEntry, session: Option<&Session>) -> bool {
        let group = self.group.as_deref().unwrap_or("default");

        match catch_unwind(AssertUnwindSafe(|| (entry.callback)(session))) {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!(
                    listener_id = %entry.id,
                    group,
                    error = %e,
                    "Session listener failed"
                );
                false
            }
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(
                    listener_id = %entry.id,
                    group,
                    reason = %reason,
                    "Session listener panicked"
                );
                false
            }
        }
    }
}

/// Handle returned by [`SessionObserver::subscribe`].
///
/// Dropping the handle does not unsubscribe; call [`Subscription::unsubscribe`].
pub struct Subscription {
    id: ListenerId,
    listeners: Weak<ListenerList>,
    active: AtomicBool,
}

impl Subscription {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Remove exactly this listener. Calling it again does nothing.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }

        // Observer already gone: nothing left to remove from
        let Some(listeners) = self.listeners.upgrade() else {
            return;
        };

        let mut listeners = listeners.write();
        let before = listeners.len();
        listeners.retain(|entry| entry.id != self.id);

        if listeners.len() < before {
            debug!(listener_id = %self.id, "Unregistered session listener");
        } else {
            debug!(
                listener_id = %self.id,
                "Attempted to unregister a listener that was already cleared"
            );
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}
