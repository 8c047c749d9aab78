use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

// Export modules
pub mod auth;
pub mod config;
pub mod error;

pub use auth::outcome::{Notice, NoticeKind, Operation, OperationResult};
pub use auth::providers::{IdentityProvider, IdentityToolkitProvider, InMemoryProvider, WatchId};
pub use auth::session::{PersistenceMode, ProfileUpdate, Session};
pub use auth::{AuthService, SessionObserver, SessionStore, Subscription};
pub use config::Config;
pub use error::{CorpregError, ErrorCategory, ErrorClass, ProviderError};

/// Build the hosted identity provider described by `config`.
///
/// Durable sessions go to the configured store file.
pub fn build_provider(config: &Config) -> Result<Arc<dyn IdentityProvider>> {
    config.provider.validate()?;

    let store = Arc::new(SessionStore::new(
        config.session.store_path.clone(),
        &config.session.namespace,
    ));

    let provider = match config.provider.emulator() {
        Some(host) => IdentityToolkitProvider::with_emulator(&config.provider.api_key, &host),
        None => IdentityToolkitProvider::new(&config.provider.api_key),
    };

    Ok(Arc::new(provider.with_store(store)))
}

/// Main application state.
///
/// Owns the single session observer for the process and the façade built on
/// top of it. UI code subscribes through `observer` and calls operations
/// through `auth_service`.
pub struct AppState {
    /// Process-wide view of the signed-in user
    pub observer: Arc<SessionObserver>,
    /// Authentication service
    pub auth_service: Arc<AuthService>,
    provider: Arc<dyn IdentityProvider>,
    /// Registration of the observer with the provider, until shutdown
    watch: Mutex<Option<WatchId>>,
}

impl AppState {
    /// Create the application state for a loaded configuration
    pub async fn new(config: &Config) -> Result<Self> {
        let provider = build_provider(config)?;
        Ok(Self::with_provider(provider).await)
    }

    /// Create the application state around an existing provider.
    ///
    /// The observer is attached before any persisted session is restored, so
    /// the restored session reaches it like any other transition.
    pub async fn with_provider(provider: Arc<dyn IdentityProvider>) -> Self {
        info!(provider = provider.name(), "Initializing application");

        let observer = Arc::new(SessionObserver::with_group("app"));
        let watch = observer.attach(provider.as_ref());

        match provider.restore().await {
            Ok(Some(session)) => info!(uid = %session.uid, "Resumed previous session"),
            Ok(None) => debug!("No previous session to resume"),
            Err(e) => warn!(code = %e.code, error = %e.message, "Failed to restore session"),
        }

        let auth_service = Arc::new(AuthService::new(
            Arc::clone(&provider),
            Arc::clone(&observer),
        ));

        Self {
            observer,
            auth_service,
            provider,
            watch: Mutex::new(Some(watch)),
        }
    }

    pub fn provider(&self) -> &Arc<dyn IdentityProvider> {
        &self.provider
    }

    /// Detach from the provider and drop every listener.
    ///
    /// The last known session stays readable. Calling this twice is harmless.
    pub fn shutdown(&self) {
        if let Some(id) = self.watch.lock().take() {
            self.provider.unwatch_sessions(id);
            info!("Detached session observer from provider");
        }
        self.observer.unsubscribe_all();
    }
}

impl Drop for AppState {
    fn drop(&mut self) {
        self.shutdown();
    }
}
