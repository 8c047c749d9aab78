use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::auth::observer::SessionObserver;
use crate::auth::outcome::{DegradedStep, Operation, OperationResult};
use crate::auth::providers::IdentityProvider;
use crate::auth::session::{PersistenceMode, ProfileUpdate, Session};
use crate::error::ProviderError;

const STEP_SET_DISPLAY_NAME: &str = "set_display_name";
const STEP_SEND_VERIFICATION: &str = "send_verification";

/// Authentication façade.
///
/// Every operation issues its provider call(s) once, never retries, and
/// turns the outcome into an [`OperationResult`]; provider errors do not
/// escape. Operations that act on the signed-in user check the observer
/// first and return without touching the provider when nobody is signed in.
///
/// Concurrent calls are not deduplicated; callers disable their triggers
/// while a call is in flight.
pub struct AuthService {
    provider: Arc<dyn IdentityProvider>,
    observer: Arc<SessionObserver>,
}

impl AuthService {
    pub fn new(provider: Arc<dyn IdentityProvider>, observer: Arc<SessionObserver>) -> Self {
        info!(provider = provider.name(), "Creating auth service");
        Self { provider, observer }
    }

    pub fn observer(&self) -> &Arc<SessionObserver> {
        &self.observer
    }

    pub fn current_user(&self) -> Option<Session> {
        self.observer.current()
    }

    pub fn is_logged_in(&self) -> bool {
        self.observer.current().is_some()
    }

    pub fn is_email_verified(&self) -> bool {
        self.observer
            .current()
            .map(|session| session.email_verified)
            .unwrap_or(false)
    }

    /// Create an account, then set its display name and send the
    /// verification email.
    ///
    /// The result follows the account creation. If a trailing step fails
    /// the result is still a success, flagged as degraded with the failed
    /// steps listed and a message saying what did not happen.
    #[instrument(skip_all, fields(email = %email))]
    pub async fn register(
        &self,
        email: &str,
        password: &str,
        display_name: Option<&str>,
    ) -> OperationResult {
        let operation = Operation::Register;

        let mut session = match self.provider.create_user(email, password).await {
            Ok(session) => session,
            Err(e) => return self.failure(operation, e),
        };
        let mut result = OperationResult::succeeded(operation);

        if let Some(name) = display_name.map(str::trim).filter(|name| !name.is_empty()) {
            match self
                .provider
                .update_profile(&session, &ProfileUpdate::display_name(name))
                .await
            {
                Ok(updated) => session = updated,
                Err(e) => {
                    warn!(
                        uid = %session.uid,
                        code = %e.code,
                        error = %e.message,
                        "Registered user but failed to set display name"
                    );
                    result = result.with_degraded(STEP_SET_DISPLAY_NAME, &e.code);
                }
            }
        }

        if let Err(e) = self.provider.send_email_verification(&session).await {
            warn!(
                uid = %session.uid,
                code = %e.code,
                error = %e.message,
                "Registered user but failed to send verification email"
            );
            result = result.with_degraded(STEP_SEND_VERIFICATION, &e.code);
        }

        if result.is_degraded() {
            let message = degraded_registration_message(result.degraded());
            result = result.with_message(message);
        }

        info!(uid = %session.uid, degraded = result.is_degraded(), "User registered");
        result.with_session(session)
    }

    /// Sign in. The persistence mode is handed to the provider first since
    /// it only applies to sign-ins made after it is set.
    #[instrument(skip_all, fields(email = %email))]
    pub async fn login(
        &self,
        email: &str,
        password: &str,
        persistence: PersistenceMode,
    ) -> OperationResult {
        let operation = Operation::Login;

        if let Err(e) = self.provider.set_persistence(persistence).await {
            return self.failure(operation, e);
        }

        match self.provider.sign_in(email, password).await {
            Ok(session) => {
                info!(uid = %session.uid, ?persistence, "Login successful");
                OperationResult::succeeded(operation).with_session(session)
            }
            Err(e) => self.failure(operation, e),
        }
    }

    #[instrument(skip_all)]
    pub async fn logout(&self) -> OperationResult {
        match self.provider.sign_out().await {
            Ok(()) => OperationResult::succeeded(Operation::Logout),
            Err(e) => self.failure(Operation::Logout, e),
        }
    }

    #[instrument(skip_all, fields(email = %email))]
    pub async fn send_password_reset(&self, email: &str) -> OperationResult {
        match self.provider.send_password_reset(email).await {
            Ok(()) => OperationResult::succeeded(Operation::SendPasswordReset),
            Err(e) => self.failure(Operation::SendPasswordReset, e),
        }
    }

    #[instrument(skip_all)]
    pub async fn update_profile(&self, update: &ProfileUpdate) -> OperationResult {
        let operation = Operation::UpdateProfile;
        let session = match self.require_session(operation) {
            Ok(session) => session,
            Err(result) => return result,
        };

        match self.provider.update_profile(&session, update).await {
            Ok(updated) => OperationResult::succeeded(operation).with_session(updated),
            Err(e) => self.failure(operation, e),
        }
    }

    #[instrument(skip_all, fields(new_email = %new_email))]
    pub async fn update_email(&self, new_email: &str) -> OperationResult {
        let operation = Operation::UpdateEmail;
        let session = match self.require_session(operation) {
            Ok(session) => session,
            Err(result) => return result,
        };

        match self.provider.update_email(&session, new_email).await {
            Ok(updated) => OperationResult::succeeded(operation).with_session(updated),
            Err(e) => self.failure(operation, e),
        }
    }

    #[instrument(skip_all)]
    pub async fn update_password(&self, new_password: &str) -> OperationResult {
        let operation = Operation::UpdatePassword;
        let session = match self.require_session(operation) {
            Ok(session) => session,
            Err(result) => return result,
        };

        match self.provider.update_password(&session, new_password).await {
            Ok(()) => OperationResult::succeeded(operation),
            Err(e) => self.failure(operation, e),
        }
    }

    #[instrument(skip_all)]
    pub async fn delete_account(&self) -> OperationResult {
        let operation = Operation::DeleteAccount;
        let session = match self.require_session(operation) {
            Ok(session) => session,
            Err(result) => return result,
        };

        match self.provider.delete_user(&session).await {
            Ok(()) => {
                info!(uid = %session.uid, "Account deleted");
                OperationResult::succeeded(operation)
            }
            Err(e) => self.failure(operation, e),
        }
    }

    #[instrument(skip_all)]
    pub async fn resend_verification(&self) -> OperationResult {
        let operation = Operation::ResendVerification;
        let session = match self.require_session(operation) {
            Ok(session) => session,
            Err(result) => return result,
        };

        match self.provider.send_email_verification(&session).await {
            Ok(()) => OperationResult::succeeded(operation),
            Err(e) => self.failure(operation, e),
        }
    }

    /// Bearer token for the signed-in user.
    ///
    /// Returns `None` when nobody is signed in or the provider fails; never
    /// errors.
    #[instrument(skip_all)]
    pub async fn get_token(&self, force_refresh: bool) -> Option<String> {
        let session = self.observer.current()?;

        match self.provider.id_token(&session, force_refresh).await {
            Ok(token) => Some(token),
            Err(e) => {
                warn!(
                    uid = %session.uid,
                    code = %e.code,
                    error = %e.message,
                    "Error getting id token"
                );
                None
            }
        }
    }

    /// The signed-in session, or the precondition failure to hand back
    fn require_session(&self, operation: Operation) -> Result<Session, OperationResult> {
        self.observer.current().ok_or_else(|| {
            debug!(%operation, "No user is currently logged in");
            OperationResult::no_current_user(operation)
        })
    }

    fn failure(&self, operation: Operation, error: ProviderError) -> OperationResult {
        let result = OperationResult::failed(operation, &error.code);
        warn!(
            %operation,
            code = %error.code,
            category = ?result.category(),
            error = %error.message,
            "Auth operation failed"
        );
        result
    }
}

fn degraded_registration_message(steps: &[DegradedStep]) -> String {
    let name_failed = steps.iter().any(|s| s.step == STEP_SET_DISPLAY_NAME);
    let verification_failed = steps.iter().any(|s| s.step == STEP_SEND_VERIFICATION);

    match (name_failed, verification_failed) {
        (true, true) => "Registration successful, but your display name could not be saved \
                         and the verification email could not be sent."
            .to_string(),
        (false, true) => "Registration successful, but the verification email could not be \
                          sent. Please request a new one."
            .to_string(),
        _ => "Registration successful, but your display name could not be saved. \
              Please check your email for verification."
            .to_string(),
    }
}
